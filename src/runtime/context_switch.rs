//! Abstraction over userspace multitasking.
//!
//! Provides an implementation for every CPU architecture.
//! Callee-saved registers are spilled onto the suspended stack, so a [Continuation] is just a stack pointer.

use std::arch::global_asm;
use std::ptr;

/// Handle to a stack pointer set up for context switching.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub(super) struct Continuation(*const ());

impl Continuation {
    /// Placeholder for a thread that is running on a stack it didn't allocate.
    /// Overwritten by the first [jump] away from it.
    pub(super) fn empty() -> Self {
        Continuation(ptr::null())
    }
}

/// First function to run on a freshly prepared stack.
/// Receives the argument given to [prepare_stack] and must never return.
pub(super) type Entry = extern "C" fn(*mut ()) -> !;

extern "C" {
    /// Initializes a stack for context switching.
    ///
    /// Writes a synthetic frame below [stack] (rounded down to 16 bytes) so that jumping to the returned
    /// continuation calls `entry(argument)` on an ABI-aligned stack with a null frame pointer.
    #[link_name = "cothread_prepare_stack"]
    pub(super) fn prepare_stack(stack: *mut u8, entry: Entry, argument: *mut ()) -> Continuation;

    /// Executes a context switch.
    ///
    /// Spills registers, sets [from] to updated stack pointer.
    /// Sets stack pointer to [to], restores registers.
    /// Jumping from a continuation to itself returns immediately.
    #[link_name = "cothread_jump"]
    pub(super) fn jump(from: *mut Continuation, to: *const Continuation);
}

#[cfg(not(target_os = "linux"))]
compile_error!("cothread only supports Linux");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("cothread only supports x86_64 and aarch64");

#[cfg(target_arch = "x86_64")]
global_asm!(include_str!("assembly/x86_64.s"));

#[cfg(target_arch = "aarch64")]
global_asm!(include_str!("assembly/aarch64.s"));

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::num::NonZeroUsize;

    use super::*;
    use crate::runtime::stack::Stack;

    thread_local! {
        static ORIGINAL: Cell<Continuation> = Cell::new(Continuation::empty());
        static SIDE: Cell<Continuation> = Cell::new(Continuation::empty());
        static LOG: Cell<u64> = Cell::new(0);
    }

    extern "C" fn record_and_return(argument: *mut ()) -> ! {
        LOG.with(|log| log.set(argument as u64));

        let original = ORIGINAL.with(|cell| cell.as_ptr());
        let side = SIDE.with(|cell| cell.as_ptr());
        unsafe { jump(side, original) };
        unreachable!()
    }

    #[test]
    fn jumps_into_prepared_stack_and_back() {
        let stack = Stack::new(NonZeroUsize::MIN, 4096).unwrap();

        let continuation = unsafe { prepare_stack(stack.base(), record_and_return, 42 as *mut ()) };
        SIDE.with(|cell| cell.set(continuation));

        let original = ORIGINAL.with(|cell| cell.as_ptr());
        let side = SIDE.with(|cell| cell.as_ptr());
        unsafe { jump(original, side) };

        assert_eq!(LOG.with(|log| log.get()), 42);
    }

    #[test]
    fn jump_to_self_is_noop() {
        let mut continuation = Continuation::empty();
        let pointer = &mut continuation as *mut Continuation;

        unsafe { jump(pointer, pointer) };

        // spilled registers were immediately restored from the same stack pointer
        assert!(!continuation.0.is_null());
    }

    #[cfg(target_arch = "x86_64")]
    mod floating_point {
        use std::arch::asm;

        use super::*;

        // control bits only, status flags change with any float operation
        const CONTROL_MASK: u32 = !0x3F;
        const ROUND_TOWARD_ZERO: u32 = 0x7F80;

        fn mxcsr() -> u32 {
            let mut value = 0_u32;
            unsafe { asm!("stmxcsr [{}]", in(reg) &mut value, options(nostack)) };
            value & CONTROL_MASK
        }

        fn set_mxcsr(value: u32) {
            unsafe { asm!("ldmxcsr [{}]", in(reg) &value, options(nostack)) };
        }

        extern "C" fn round_toward_zero_and_return(_: *mut ()) -> ! {
            set_mxcsr(ROUND_TOWARD_ZERO);
            LOG.with(|log| log.set(mxcsr() as u64));

            let original = ORIGINAL.with(|cell| cell.as_ptr());
            let side = SIDE.with(|cell| cell.as_ptr());
            unsafe { jump(side, original) };
            unreachable!()
        }

        #[test]
        fn restores_rounding_mode() {
            let stack = Stack::new(NonZeroUsize::MIN, 4096).unwrap();
            let before = mxcsr();

            let continuation =
                unsafe { prepare_stack(stack.base(), round_toward_zero_and_return, ptr::null_mut()) };
            SIDE.with(|cell| cell.set(continuation));
            let original = ORIGINAL.with(|cell| cell.as_ptr());
            let side = SIDE.with(|cell| cell.as_ptr());
            unsafe { jump(original, side) };

            assert_eq!(LOG.with(|log| log.get()), ROUND_TOWARD_ZERO as u64);
            assert_eq!(mxcsr(), before);
            assert_ne!(before, ROUND_TOWARD_ZERO);
        }
    }
}
