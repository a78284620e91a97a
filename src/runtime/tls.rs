//! Thread local storage for the runtime.
//!
//! Every access goes through [runtime], so switching to `#[thread_local]` (or an unsafe cell) stays local to this file.
//! The borrow must never be held across a context switch.

use std::cell::RefCell;

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Runtime(RefCell<Option<super::RuntimeState>>);

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Each thread gets its own independent runtime.
    static RUNTIME: Runtime = Runtime(RefCell::new(None));
}

/// Borrow the runtime of the current OS thread, creating it on first use.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        let runtime = cell.get_or_insert_with(super::RuntimeState::new);
        f(runtime)
    })
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static RUNTIME: Runtime = Runtime(RefCell::new(None));

/// Borrow the runtime of the current OS thread, creating it on first use.
#[cfg(feature = "fast_thread_local")]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> T {
    let mut cell = RUNTIME.0.borrow_mut();
    let runtime = cell.get_or_insert_with(super::RuntimeState::new);
    f(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_state_between_borrows() {
        let first = runtime(|rt| rt.registry.allocate_id());
        let second = runtime(|rt| rt.registry.allocate_id());

        assert!(second > first);
    }

    #[test]
    fn separate_per_os_thread() {
        runtime(|rt| {
            rt.registry.allocate_id();
            rt.registry.allocate_id();
        });

        let other = std::thread::spawn(|| runtime(|rt| rt.registry.allocate_id()))
            .join()
            .unwrap();

        assert_eq!(other.get(), 0);
    }

    #[test]
    #[should_panic]
    fn cant_borrow_twice() {
        runtime(|_| runtime(|_| {}));
    }
}
