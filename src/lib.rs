//! Stackful cooperative threads for a single OS thread.
//!
//! Every thread of a [Context] has its own native stack, so it can suspend from arbitrarily deep inside
//! ordinary function calls. Control is only ever transferred explicitly, passing one value along:
//!
//! ```
//! use cothread::Context;
//!
//! let context = Context::new();
//! let numbers = context
//!     .create_child_thread(|context, _| {
//!         for i in 0..3 {
//!             context.yield_now(i);
//!         }
//!     })
//!     .unwrap();
//!
//! let mut seen = vec![];
//! while let Some(i) = context.resume(numbers, 0) {
//!     seen.push(i);
//! }
//! assert_eq!(seen, [0, 1, 2]);
//! ```
//!
//! There is no scheduler, no preemption and no parallelism.
//! A [Context] can't leave the OS thread that created it.

#![warn(missing_docs)]

use std::collections::TryReserveError;
use std::io;

mod runtime;

pub use runtime::{
    Config, Context, Thread, ThreadState, TlsSlot, DEFAULT_STACK_SIZE, MIN_STACK_SIZE,
};

/// Failure to allocate memory for a thread.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Mapping or guarding a thread's stack failed.
    #[error("failed to map thread stack")]
    Stack(#[source] io::Error),
    /// A thread's destructor list or TLS store couldn't grow.
    #[error("out of memory")]
    OutOfMemory(#[from] TryReserveError),
}

/// Result type for fallible thread operations.
pub type Result<T> = std::result::Result<T, Error>;
