//! Cooperative threads multiplexed on the current OS thread.
//!
//! A [Context] owns a family of threads and remembers which one is running.
//! Control moves only when a thread calls [Context::resume], [Context::yield_now] or [Context::switch],
//! or when its entry function returns.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::panic;
use std::ptr::NonNull;

use thread::{EntryFn, Start, ThreadRecord};

mod context_switch;
mod destructor;
mod stack;
mod thread;
mod tls;

pub use thread::{Thread, ThreadState};
pub use tls::TlsSlot;

/// Smallest stack size accepted by [Context::set_stack_size].
pub const MIN_STACK_SIZE: usize = 4096;

/// Stack size of new threads unless configured otherwise.
pub const DEFAULT_STACK_SIZE: usize = 131072;

/// Settings applied to threads created by a [Context].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Usable stack bytes per thread, rounded up to whole pages.
    /// Values below [MIN_STACK_SIZE] are ignored.
    pub stack_size: usize,
    /// Inaccessible pages below each stack, turning overflows into segmentation faults.
    pub guard_pages: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: NonZeroUsize::MIN,
        }
    }
}

type Shared<T> = RefCell<ContextState<T>>;

/// Family of cooperative threads that can resume each other, passing values of type `T`.
///
/// The thread that creates the context becomes its root thread, running on the stack it already has.
/// Dropping the context (only allowed from the root thread) destroys the root thread, which runs its
/// destructors and so tears down its child threads, then frees every remaining thread.
///
/// # Examples
///
/// ```
/// let context = cothread::Context::new();
///
/// let doubler = context
///     .create_thread(|context, mut value| {
///         while let Some(n) = value {
///             value = context.yield_now(n * 2);
///         }
///     })
///     .unwrap();
///
/// assert_eq!(context.resume(doubler, 1), Some(2));
/// assert_eq!(context.resume(doubler, 21), Some(42));
/// ```
pub struct Context<T> {
    state: NonNull<Shared<T>>,
}

struct ContextState<T> {
    threads: slab::Slab<ThreadRecord<T>>,
    root: Thread,
    current: Thread,
    /// Value in flight between the thread that transfers control and the one receiving it.
    transient: Option<T>,
    stack_size: usize,
    guard_pages: NonZeroUsize,
    tls_slots: u32,
    generations: u64,
    /// Thread that died handing control to the running one, torn down as soon as it's off its stack.
    dead: Option<Thread>,
}

impl<T> ContextState<T> {
    fn record(&self, thread: Thread) -> Option<&ThreadRecord<T>> {
        let record = self.threads.get(thread.index)?;
        (record.generation == thread.generation).then_some(record)
    }

    fn record_mut(&mut self, thread: Thread) -> Option<&mut ThreadRecord<T>> {
        let record = self.threads.get_mut(thread.index)?;
        (record.generation == thread.generation).then_some(record)
    }

    fn running(&mut self) -> &mut ThreadRecord<T> {
        let current = self.current;
        self.record_mut(current).expect("running thread has a record")
    }

    /// Whether the thread can be jumped to: still allocated and not dead.
    fn is_resumable(&self, thread: Thread) -> bool {
        self.record(thread)
            .is_some_and(|record| record.state != ThreadState::Dead)
    }

    fn continuations(
        &mut self,
        from: Thread,
        to: Thread,
    ) -> (*mut context_switch::Continuation, *const context_switch::Continuation) {
        let from = &mut self.threads[from.index].continuation as *mut _;
        let to = &self.threads[to.index].continuation as *const _;
        (from, to)
    }

    fn prepare_resume(&mut self, thread: Thread, value: T) -> Resume<T> {
        if thread == self.current {
            return Resume::Itself(value);
        }

        if !self.is_resumable(thread) {
            return Resume::Dead(value);
        }

        let caller = self.current;
        let saved_caller = self.running().caller;

        self.threads[thread.index].caller = Some(caller);
        self.current = thread;
        let stale = self.transient.replace(value);

        let (from, to) = self.continuations(caller, thread);
        Resume::Jump(Jump {
            saved_caller,
            stale,
            from,
            to,
        })
    }

    /// Marks the running thread dead and picks who runs next.
    /// Falls back to the root thread when the caller is gone.
    fn die(&mut self, thread: Thread, panic: Option<Box<dyn Any + Send>>) -> Jump<T> {
        let root = self.root;
        let record = self.running();
        record.state = ThreadState::Dead;
        record.panic = panic;
        let caller = record.caller;

        let next = caller
            .filter(|caller| self.is_resumable(*caller))
            .unwrap_or(root);
        log::debug!("{thread:?} died, returning to {next:?}");

        self.dead = Some(thread);
        self.current = next;
        let stale = self.transient.take();

        let (from, to) = self.continuations(thread, next);
        Jump {
            saved_caller: caller,
            stale,
            from,
            to,
        }
    }

    /// Any thread besides the root that still has a record.
    fn any_non_root(&self) -> Option<Thread> {
        self.threads
            .iter()
            .map(|(index, record)| Thread {
                index,
                generation: record.generation,
            })
            .find(|thread| *thread != self.root)
    }
}

enum Resume<T> {
    Itself(T),
    Dead(T),
    Jump(Jump<T>),
}

struct Jump<T> {
    saved_caller: Option<Thread>,
    /// Previous occupant of the transient slot, dropped outside of the borrow.
    stale: Option<T>,
    from: *mut context_switch::Continuation,
    to: *const context_switch::Continuation,
}

impl<T> Context<T> {
    /// Creates a context whose root thread is the caller, with default [Config].
    pub fn new() -> Self {
        Context::with_config(Config::default())
    }

    /// Creates a context whose root thread is the caller.
    pub fn with_config(config: Config) -> Self {
        let mut threads = slab::Slab::new();
        let root = Thread {
            index: threads.insert(ThreadRecord::root(0)),
            generation: 0,
        };

        let state = ContextState {
            threads,
            root,
            current: root,
            transient: None,
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: config.guard_pages,
            tls_slots: 0,
            generations: 0,
            dead: None,
        };

        let context = Context {
            state: NonNull::from(Box::leak(Box::new(RefCell::new(state)))),
        };
        context.set_stack_size(config.stack_size);
        context
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ContextState<T>) -> R) -> R {
        // safety: state outlives every handle, it's freed when the owning handle drops
        let state = unsafe { self.state.as_ref() };
        f(&mut state.borrow_mut())
    }

    /// Sets the stack size of threads created from now on.
    /// Values smaller than [MIN_STACK_SIZE] are ignored.
    pub fn set_stack_size(&self, bytes: usize) {
        if bytes >= MIN_STACK_SIZE {
            self.with_state(|state| state.stack_size = bytes);
        }
    }

    /// Stack size of threads created from now on.
    pub fn stack_size(&self) -> usize {
        self.with_state(|state| state.stack_size)
    }

    /// Creates a thread that will run `entry` when first resumed (or switched to).
    ///
    /// `entry` receives the context and the value the thread was first resumed with.
    /// Once it returns the thread is [ThreadState::Dead] and control goes back to its caller.
    pub fn create_thread<F>(&self, entry: F) -> crate::Result<Thread>
    where
        F: FnOnce(&Context<T>, Option<T>) + 'static,
    {
        let entry: EntryFn<T> = Box::new(entry);

        let (guard_pages, stack_size) = self.with_state(|state| (state.guard_pages, state.stack_size));
        let stack = stack::Stack::new(guard_pages, stack_size).map_err(crate::Error::Stack)?;

        let thread = self.with_state(|state| {
            state.generations += 1;
            let thread = Thread {
                index: state.threads.vacant_key(),
                generation: state.generations,
            };

            // start packet lives at the very top of the stack, frames go below it
            let start = unsafe { (stack.base() as *mut Start<T>).sub(1) };
            unsafe {
                start.write(Start {
                    context: self.state,
                    thread,
                    entry,
                })
            };
            let continuation =
                unsafe { context_switch::prepare_stack(start.cast(), bootstrap::<T>, start.cast()) };

            // safety: derived from the non-null stack base
            let start = unsafe { NonNull::new_unchecked(start) };
            let index = state
                .threads
                .insert(ThreadRecord::new(thread.generation, stack, start, continuation));
            debug_assert_eq!(index, thread.index);

            thread
        });

        log::trace!("created {thread:?}");
        Ok(thread)
    }

    /// Creates a thread that gets destroyed when the running thread is destroyed.
    ///
    /// On failure to register that destructor the new thread is destroyed before returning the error.
    pub fn create_child_thread<F>(&self, entry: F) -> crate::Result<Thread>
    where
        F: FnOnce(&Context<T>, Option<T>) + 'static,
    {
        let child = self.create_thread(entry)?;

        let registered = self.register_destructor(move |context| {
            if context.current() == child {
                // can't unmap the stack it's running on, reclaimed with the context instead
                log::debug!("skipped destroying running child {child:?}");
                return;
            }
            context.destroy_thread(child);
        });

        if let Err(error) = registered {
            self.destroy_thread(child);
            return Err(error);
        }

        Ok(child)
    }

    /// Destroys a thread, running its remaining destructors before releasing its stack.
    ///
    /// A suspended thread is not unwound, values living on its stack are leaked.
    /// Destroying an already destroyed thread does nothing.
    ///
    /// # Panics
    /// If `thread` is the running thread or the root thread.
    pub fn destroy_thread(&self, thread: Thread) {
        let resources = self.with_state(|state| {
            assert_ne!(thread, state.root, "root thread is destroyed with its context");
            assert_ne!(thread, state.current, "running thread can't destroy itself");

            state.record(thread)?;
            Some(state.threads.remove(thread.index).take_resources())
        });

        if let Some(resources) = resources {
            log::trace!(
                "destroying {thread:?} with {} destructors and {} tls values",
                resources.destructors.len(),
                resources.tls.len(),
            );
            resources.release(self);
        }
    }

    /// Lifecycle state of a thread, [ThreadState::Dead] once destroyed.
    pub fn thread_state(&self, thread: Thread) -> ThreadState {
        self.with_state(|state| {
            state
                .record(thread)
                .map_or(ThreadState::Dead, |record| record.state)
        })
    }

    /// Transfers control to `thread`, which receives `value`.
    ///
    /// A new thread receives it as the argument of its entry function, a suspended one as the return
    /// value of its own call to [Context::resume] or [Context::yield_now].
    /// Returns the value passed back when control returns to the running thread,
    /// or `None` if it returned because `thread` died.
    ///
    /// Resuming a dead thread does nothing and returns `None`.
    /// Resuming the running thread does nothing and returns `Some(value)`.
    ///
    /// The returned value is taken before a thread that died handing back control is torn down,
    /// so values passed around by its destructors don't replace it.
    ///
    /// # Panics
    /// If `thread` panicked, the panic continues in the caller once the thread is torn down.
    pub fn resume(&self, thread: Thread, value: T) -> Option<T> {
        let jump = match self.with_state(|state| state.prepare_resume(thread, value)) {
            Resume::Itself(value) => return Some(value),
            Resume::Dead(value) => {
                drop(value);
                return None;
            }
            Resume::Jump(jump) => jump,
        };

        let Jump {
            saved_caller,
            stale,
            from,
            to,
        } = jump;
        drop(stale);

        log::trace!("resuming {thread:?}");
        unsafe { context_switch::jump(from, to) };

        // resumed again, by anyone
        let value = self.with_state(|state| state.transient.take());
        let panic = self.reap(Some(thread));

        self.with_state(|state| state.running().caller = saved_caller);

        if let Some(payload) = panic {
            panic::resume_unwind(payload);
        }

        value
    }

    /// Transfers control back to the thread that resumed the running one.
    /// Same as `resume(caller(), value)`.
    ///
    /// # Panics
    /// If the running thread has no caller, e.g. it's the root thread.
    pub fn yield_now(&self, value: T) -> Option<T> {
        let caller = self.caller().expect("running thread has no caller to yield to");
        self.resume(caller, value)
    }

    /// Switches from the running thread to another, without touching callers or passing values.
    /// The thread switched to keeps whatever value was last left in flight.
    ///
    /// Meant for symmetric topologies such as two threads handing control back and forth,
    /// where [Context::resume] would keep nesting callers.
    /// Switching a thread to itself does nothing.
    ///
    /// # Panics
    /// If `from` isn't the running thread, or `to` is dead.
    pub fn switch(&self, from: Thread, to: Thread) {
        let jump = self.with_state(|state| {
            assert_eq!(from, state.current, "switch must start from the running thread");
            if from == to {
                return None;
            }
            assert!(state.is_resumable(to), "can't switch to dead {to:?}");

            state.current = to;
            Some(state.continuations(from, to))
        });

        if let Some((from_continuation, to_continuation)) = jump {
            log::trace!("switching from {from:?} to {to:?}");
            unsafe { context_switch::jump(from_continuation, to_continuation) };
            self.reap(None);
        }
    }

    /// Frees the thread that died handing control to the running one, if any.
    /// Returns its panic when it's the `resumed` thread, otherwise the panic is discarded.
    fn reap(&self, resumed: Option<Thread>) -> Option<Box<dyn Any + Send>> {
        let (thread, mut resources) = self.with_state(|state| {
            let thread = state.dead.take()?;
            Some((thread, state.threads.remove(thread.index).take_resources()))
        })?;
        log::trace!("tearing down dead {thread:?}");

        let panic = match resumed {
            Some(resumed) if resumed == thread => resources.panic.take(),
            _ => None,
        };
        resources.release(self);
        panic
    }

    /// Thread that most recently resumed the running thread, if it's still suspended in that call.
    pub fn caller(&self) -> Option<Thread> {
        self.with_state(|state| state.running().caller)
    }

    /// Thread that is running right now.
    pub fn current(&self) -> Thread {
        self.with_state(|state| state.current)
    }

    /// Thread running on the stack that created the context.
    pub fn root(&self) -> Thread {
        self.with_state(|state| state.root)
    }

    /// Registers a callback to run when the running thread dies or is destroyed.
    ///
    /// Destructors run in registration order, before the thread's stack is released,
    /// so they may still read values the thread keeps on its stack.
    pub fn register_destructor<F>(&self, destructor: F) -> crate::Result<()>
    where
        F: FnOnce(&Context<T>) + 'static,
    {
        let destructor = Box::new(destructor);
        self.with_state(|state| state.running().destructors.register(destructor))?;
        Ok(())
    }

    /// Allocates a slot for values that every thread of this context stores separately.
    pub fn new_tls_slot<V: 'static>(&self) -> TlsSlot<V> {
        self.with_state(|state| {
            state.tls_slots = state.tls_slots.checked_add(1).expect("too many tls slots");
            TlsSlot::new(state.tls_slots)
        })
    }

    /// Value the running thread stored in `slot`, `None` if it never set one.
    pub fn tls_get<V: Clone + 'static>(&self, slot: &TlsSlot<V>) -> Option<V> {
        self.with_state(|state| {
            let value = state.running().tls.get(slot.key)?;
            value.downcast_ref::<V>().cloned()
        })
    }

    /// Stores a value in `slot` for the running thread, returning the previous one.
    pub fn tls_set<V: 'static>(&self, slot: &TlsSlot<V>, value: V) -> crate::Result<Option<V>> {
        let previous = self.with_state(|state| state.running().tls.insert(slot.key, Box::new(value)))?;
        Ok(previous.and_then(|previous| previous.downcast::<V>().ok()).map(|previous| *previous))
    }

    /// Retires a slot. Values threads already stored in it stay until those threads are torn down.
    pub fn free_tls_slot<V>(&self, slot: TlsSlot<V>) {
        log::trace!("freed {slot:?}");
    }
}

impl<T> Default for Context<T> {
    fn default() -> Self {
        Context::new()
    }
}

impl<T> Drop for Context<T> {
    fn drop(&mut self) {
        let (current, root) = self.with_state(|state| (state.current, state.root));
        assert_eq!(current, root, "context must be dropped from its root thread");
        log::debug!("dropping context");

        loop {
            // root destructors cascade into child threads
            let resources = self.with_state(|state| state.running().take_resources());
            resources.release(self);

            match self.with_state(|state| state.any_non_root()) {
                Some(thread) => self.destroy_thread(thread),
                None => break,
            }
        }

        // safety: allocated by Box in constructor, no thread can run anymore
        drop(unsafe { Box::from_raw(self.state.as_ptr()) });
    }
}

impl<T> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_state(|state| {
            f.debug_struct("Context")
                .field("current", &state.current)
                .field("root", &state.root)
                .field("threads", &state.threads.len())
                .field("stack_size", &state.stack_size)
                .finish()
        })
    }
}

extern "C" fn bootstrap<T>(start: *mut ()) -> ! {
    // move the packet off the top of the stack
    let Start {
        context,
        thread,
        entry,
    } = unsafe { start.cast::<Start<T>>().read() };
    let context = ManuallyDrop::new(Context { state: context });

    let value = context.with_state(|state| {
        let record = state.running();
        record.start = None;
        record.state = ThreadState::Alive;
        state.transient.take()
    });
    log::trace!("started {thread:?}");

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| entry(&context, value)));

    let Jump {
        stale, from, to, ..
    } = context.with_state(|state| state.die(thread, result.err()));
    drop(stale);

    // the stack is released by whoever observes the death
    unsafe { context_switch::jump(from, to) };
    unreachable!()
}
