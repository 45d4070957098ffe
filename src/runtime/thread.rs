//! Thread handles and the records a context keeps for them.

use std::any::Any;
use std::ptr::NonNull;

use super::context_switch::Continuation;
use super::destructor::Destructors;
use super::stack::Stack;
use super::tls;
use super::{Context, Shared};

/// Handle to a cooperative thread of a [Context].
///
/// Handles are plain indices: they don't own the thread and stay valid to pass around after it's destroyed,
/// at which point the context treats them as [ThreadState::Dead].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Thread {
    pub(super) index: usize,
    pub(super) generation: u64,
}

/// Lifecycle of a thread, only ever advancing from [ThreadState::New] to [ThreadState::Dead].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Stack is prepared, but the thread never ran.
    New,
    /// Entry function is running or suspended.
    Alive,
    /// Entry function returned, the thread can't run again.
    Dead,
}

pub(super) type EntryFn<T> = Box<dyn FnOnce(&Context<T>, Option<T>)>;

/// Everything the bootstrap needs to start a thread, stored at the top of its stack.
pub(super) struct Start<T> {
    pub(super) context: NonNull<Shared<T>>,
    pub(super) thread: Thread,
    pub(super) entry: EntryFn<T>,
}

pub(super) struct ThreadRecord<T> {
    pub(super) generation: u64,
    pub(super) continuation: Continuation,
    pub(super) state: ThreadState,
    /// `None` for the root thread and after teardown.
    pub(super) stack: Option<Stack>,
    /// Pending start packet, only while [ThreadState::New].
    pub(super) start: Option<NonNull<Start<T>>>,
    pub(super) caller: Option<Thread>,
    pub(super) destructors: Destructors<T>,
    pub(super) tls: tls::Storage,
    pub(super) panic: Option<Box<dyn Any + Send>>,
}

impl<T> ThreadRecord<T> {
    /// Record for the thread that runs on the host's own stack.
    pub(super) fn root(generation: u64) -> Self {
        ThreadRecord {
            generation,
            continuation: Continuation::empty(),
            state: ThreadState::Alive,
            stack: None,
            start: None,
            caller: None,
            destructors: Destructors::new(),
            tls: tls::Storage::default(),
            panic: None,
        }
    }

    pub(super) fn new(
        generation: u64,
        stack: Stack,
        start: NonNull<Start<T>>,
        continuation: Continuation,
    ) -> Self {
        ThreadRecord {
            generation,
            continuation,
            state: ThreadState::New,
            stack: Some(stack),
            start: Some(start),
            caller: None,
            destructors: Destructors::new(),
            tls: tls::Storage::default(),
            panic: None,
        }
    }

    /// Detaches every resource the thread owns, in the order they must be released.
    pub(super) fn take_resources(&mut self) -> Resources<T> {
        Resources {
            destructors: self.destructors.take(),
            tls: std::mem::take(&mut self.tls),
            start: self.start.take(),
            panic: self.panic.take(),
            stack: self.stack.take(),
        }
    }
}

/// Resources of a thread being torn down, released outside of any borrow of the context.
pub(super) struct Resources<T> {
    pub(super) destructors: Destructors<T>,
    pub(super) tls: tls::Storage,
    pub(super) start: Option<NonNull<Start<T>>>,
    pub(super) panic: Option<Box<dyn Any + Send>>,
    pub(super) stack: Option<Stack>,
}

impl<T> Resources<T> {
    /// Runs destructors while the stack is still mapped, then frees everything else.
    pub(super) fn release(self, context: &Context<T>) {
        let Resources {
            destructors,
            tls,
            start,
            panic,
            stack,
        } = self;

        destructors.run(context);
        drop(tls);

        // never started, so the entry closure is still on the stack
        if let Some(start) = start {
            unsafe { start.as_ptr().drop_in_place() };
        }

        if panic.is_some() {
            log::warn!("discarding panic of a thread that died without being resumed");
        }
        drop(panic);

        drop(stack);
    }
}
