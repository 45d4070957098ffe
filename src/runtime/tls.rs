//! Thread local storage, one independent store per cooperative thread.
//!
//! Slots are minted per context and resolved against the running thread's [Storage].

use std::any::Any;
use std::collections::TryReserveError;
use std::fmt;
use std::marker::PhantomData;

/// Key for a value of type `V` stored separately by every thread of a context.
///
/// Created by [crate::Context::new_tls_slot], retired by [crate::Context::free_tls_slot].
pub struct TlsSlot<V> {
    pub(super) key: u32,
    value: PhantomData<fn() -> V>,
}

impl<V> TlsSlot<V> {
    pub(super) fn new(key: u32) -> Self {
        TlsSlot {
            key,
            value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for TlsSlot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TlsSlot").field(&self.key).finish()
    }
}

/// Values of a single thread, sorted by slot key.
#[derive(Default)]
pub(super) struct Storage {
    entries: Vec<(u32, Box<dyn Any>)>,
}

impl Storage {
    pub(super) fn get(&self, key: u32) -> Option<&dyn Any> {
        let index = self.find(key).ok()?;
        Some(&*self.entries[index].1)
    }

    /// Inserts or replaces the value for `key`, returning the previous one.
    /// On allocation failure the store is left unchanged.
    pub(super) fn insert(
        &mut self,
        key: u32,
        value: Box<dyn Any>,
    ) -> Result<Option<Box<dyn Any>>, TryReserveError> {
        match self.find(key) {
            Ok(index) => Ok(Some(std::mem::replace(&mut self.entries[index].1, value))),
            Err(index) => {
                self.entries.try_reserve(1)?;
                self.entries.insert(index, (key, value));
                Ok(None)
            }
        }
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    fn find(&self, key: u32) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&key, |(key, _)| *key)
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.entries.iter().map(|(key, _)| key))
            .finish()
    }
}
