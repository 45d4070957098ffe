//! Native stacks for threads.

use std::num::NonZeroUsize;
use std::{ffi, io, ptr};

#[derive(Debug)]
pub(super) struct Stack {
    pointer: *mut u8,
    length: usize,
}

impl Stack {
    /// Allocates a general purpose stack with at least `size` usable bytes.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    /// The stack is protected from overflow using guard pages.
    pub(super) fn new(guard_pages: NonZeroUsize, size: usize) -> io::Result<Self> {
        // page aligned sizes
        let page_size = page_size();
        let usable_pages = size.div_ceil(page_size).max(1);
        let guard_length = guard_pages.get() * page_size;
        let length = guard_length + usable_pages * page_size;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
        };

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, guard_length, libc::PROT_NONE) };
        if result == -1 {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        Ok(stack)
    }

    /// Upper address of the stack memory, stack addresses grow downwards.
    pub(super) fn base(&self) -> *mut u8 {
        // safety: part of same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        assert_eq!(result, 0);
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(NonZeroUsize::MIN, 4096).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn base_is_page_aligned() {
        let stack = Stack::new(NonZeroUsize::MIN, 10_000).unwrap();

        assert_eq!(stack.base() as usize % page_size(), 0);
    }

    #[test]
    fn rounds_size_up_to_whole_pages() {
        let stack = Stack::new(NonZeroUsize::MIN, 1).unwrap();

        let usable = stack.base() as usize - stack.pointer as usize - page_size();
        assert_eq!(usable, page_size());
    }

    #[test]
    #[ignore = "aborts process"] // TODO: test with fork()
    fn overflow() {
        let stack = Stack::new(NonZeroUsize::MIN, 4096).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(page_size() + 1);
            pointer.write(123);
        }
    }
}
