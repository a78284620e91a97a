//! Dedicated call stacks for green threads.

use std::num::NonZeroUsize;
use std::{ffi, io, ptr};

/// Byte written over a stack's resident pages right before it's unmapped.
#[cfg(any(test, debug_assertions))]
pub(super) const POISON: u8 = 0xDE;

#[derive(Debug)]
pub(super) struct Stack {
    pointer: *mut u8,
    length: usize,
    guard_length: usize,
}

impl Stack {
    /// Allocates a general purpose stack.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    /// The stack is protected from overflow using guard pages.
    pub(super) fn new(guard_pages: NonZeroUsize, usable_pages: NonZeroUsize) -> io::Result<Self> {
        let (guard_pages, usable_pages) = (guard_pages.get(), usable_pages.get());

        let page_size = page_size();
        let length = guard_pages
            .checked_add(usable_pages)
            .and_then(|pages| pages.checked_mul(page_size))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stack size overflows"))?;

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
            guard_length: guard_pages * page_size,
        };
        #[cfg(test)]
        {
            LIVE_STACKS.with(|live| live.set(live.get() + 1));
            let mapped = stack.pointer as usize..stack.pointer as usize + length;
            FREED.with(|freed| {
                let mut freed = freed.borrow_mut();
                freed.retain(|range| range.end <= mapped.start || range.start >= mapped.end);
            });
        }

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer, stack.guard_length, libc::PROT_NONE) };
        if result == -1 {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        Ok(stack)
    }

    /// Highest address of the stack, where the first frame is placed.
    pub(super) fn base(&self) -> *mut u8 {
        // safety: part of same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }

    /// Number of bytes a thread can use before hitting the guard pages.
    #[cfg_attr(not(any(test, debug_assertions)), allow(dead_code))]
    pub(super) fn usable_length(&self) -> usize {
        self.length - self.guard_length
    }

    /// Overwrites every resident usable page with [POISON].
    /// Pages the thread never touched stay unbacked.
    #[cfg(any(test, debug_assertions))]
    fn poison(&self) {
        let page_size = page_size();
        let usable = unsafe { self.pointer.add(self.guard_length) };
        let mut resident = vec![0u8; self.usable_length() / page_size];

        let result = unsafe {
            libc::mincore(
                usable as *mut ffi::c_void,
                self.usable_length(),
                resident.as_mut_ptr() as *mut _,
            )
        };
        if result == -1 {
            return;
        }

        for (page, _) in resident.iter().enumerate().filter(|&(_, &flags)| flags & 1 != 0) {
            unsafe { ptr::write_bytes(usable.add(page * page_size), POISON, page_size) };
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.poison();

        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        assert_eq!(result, 0);

        #[cfg(test)]
        {
            LIVE_STACKS.with(|live| live.set(live.get() - 1));
            let unmapped = self.pointer as usize..self.pointer as usize + self.length;
            FREED.with(|freed| freed.borrow_mut().push(unmapped));
        }
    }
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
thread_local! {
    static LIVE_STACKS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
    /// Address ranges unmapped by this OS thread and not mapped again since.
    static FREED: std::cell::RefCell<Vec<std::ops::Range<usize>>> = const { std::cell::RefCell::new(Vec::new()) };
    /// Resumed stack pointers checked so far, and how many of them were bad.
    static RESUMES: std::cell::Cell<(usize, usize)> = const { std::cell::Cell::new((0, 0)) };
}

/// Number of stacks currently mapped by this OS thread.
#[cfg(test)]
pub(crate) fn live_stacks() -> usize {
    LIVE_STACKS.with(|live| live.get())
}

/// Records a stack pointer that is about to be restored.
/// It's bad if it lies in an unmapped stack or reads back as the poison pattern.
#[cfg(test)]
pub(crate) fn check_resume(stack_pointer: usize) {
    let poisoned = stack_pointer == usize::from_ne_bytes([POISON; std::mem::size_of::<usize>()]);
    let freed = FREED.with(|freed| freed.borrow().iter().any(|range| range.contains(&stack_pointer)));

    RESUMES.with(|resumes| {
        let (checked, bad) = resumes.get();
        resumes.set((checked + 1, bad + usize::from(poisoned || freed)));
    });
}

/// Resumed stack pointers checked on this OS thread, and how many of them were bad.
#[cfg(test)]
pub(crate) fn resumes() -> (usize, usize) {
    RESUMES.with(|resumes| resumes.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn usable_length_excludes_guard_pages() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::new(4).unwrap()).unwrap();

        assert_eq!(stack.usable_length(), 4 * page_size());
    }

    #[test]
    fn lowest_usable_byte_is_writable() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::new(2).unwrap()).unwrap();
        unsafe {
            let lowest = stack.base().sub(stack.usable_length());
            lowest.write(7);
            assert_eq!(lowest.read(), 7);
        }
    }

    #[test]
    fn counts_live_stacks() {
        let before = live_stacks();

        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        assert_eq!(live_stacks(), before + 1);

        drop(stack);
        assert_eq!(live_stacks(), before);
    }

    #[test]
    fn poisons_touched_pages_only() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::new(4).unwrap()).unwrap();
        let top = unsafe { stack.base().sub(1) };
        let lowest = unsafe { stack.base().sub(stack.usable_length()) };
        unsafe { top.write(7) };

        stack.poison();

        unsafe {
            assert_eq!(top.read(), POISON);
            assert_eq!(top.sub(page_size() - 1).read(), POISON);
            assert_eq!(lowest.read(), 0);
        }
    }

    #[test]
    fn remembers_unmapped_ranges() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let inside = stack.base() as usize - 1;

        check_resume(inside);
        let (checked, bad) = resumes();

        drop(stack);
        check_resume(inside);
        assert_eq!(resumes(), (checked + 1, bad + 1));
    }

    #[test]
    fn rejects_overflowing_size() {
        let result = Stack::new(NonZeroUsize::MIN, NonZeroUsize::new(usize::MAX).unwrap());

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    #[ignore = "aborts process"]
    fn overflow() {
        let stack = Stack::new(NonZeroUsize::MIN, NonZeroUsize::MIN).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(stack.usable_length() + 1);
            pointer.write(123);
        }
    }
}
