//! Cleanup callbacks that run when a thread dies.

use std::collections::TryReserveError;
use std::fmt;

use super::Context;

type Destructor<T> = Box<dyn FnOnce(&Context<T>)>;

#[cfg(test)]
thread_local! {
    /// Makes the next registration on this OS thread fail as if out of memory.
    pub(super) static FAIL_NEXT_REGISTER: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Callbacks in registration order.
pub(super) struct Destructors<T> {
    list: Vec<Destructor<T>>,
}

impl<T> Destructors<T> {
    pub(super) fn new() -> Self {
        Destructors { list: Vec::new() }
    }

    /// Appends a callback, leaving the list unchanged if it can't grow.
    pub(super) fn register(&mut self, destructor: Destructor<T>) -> Result<(), TryReserveError> {
        #[cfg(test)]
        if FAIL_NEXT_REGISTER.with(|fail| fail.replace(false)) {
            return Err(Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err());
        }

        self.list.try_reserve(1)?;
        self.list.push(destructor);
        Ok(())
    }

    /// Removes every callback, to be run outside of any borrow of the context.
    pub(super) fn take(&mut self) -> Destructors<T> {
        Destructors {
            list: std::mem::take(&mut self.list),
        }
    }

    /// Runs every callback exactly once in registration order.
    pub(super) fn run(self, context: &Context<T>) {
        for destructor in self.list {
            destructor(context);
        }
    }

    pub(super) fn len(&self) -> usize {
        self.list.len()
    }
}

impl<T> fmt::Debug for Destructors<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destructors")
            .field("len", &self.list.len())
            .finish()
    }
}
