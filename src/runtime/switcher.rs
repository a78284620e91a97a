//! State transition and context transfer between two contexts.
//!
//! A finished thread can't unmap the stack it's standing on, so its stack is parked in
//! [super::RuntimeState::retired] and released by the first code that runs on the destination stack.
//! Every destination starts in one of two places: right after the jump in [switch], or at the top of [trampoline].

use std::panic;

use super::context_switch::{self, Continuation};
use super::registry::{Registry, Slot, State};
use super::{scheduler, tls, RuntimeState};

enum Transfer {
    /// Previous context finished, nothing to save.
    Abandon(*const Continuation),
    /// Previous context gets resumed later, where it left off.
    Suspend(*mut Continuation, *const Continuation),
}

/// Moves the CPU from `prev` to `next`.
///
/// Returns once someone switches back to `prev`.
/// Never returns if `prev` finished, it's disposed instead.
pub(super) fn switch(prev: Slot, next: Slot) {
    let transfer = tls::runtime(|runtime| prepare(runtime, prev, next));

    match transfer {
        Transfer::Abandon(next) => unsafe { context_switch::restore(next) },
        Transfer::Suspend(prev, next) => unsafe { context_switch::jump(prev, next) },
    }

    tls::runtime(|runtime| runtime.release_retired());
}

fn prepare(runtime: &mut RuntimeState, prev: Slot, next: Slot) -> Transfer {
    assert_ne!(prev, next, "can't switch a context to itself");
    assert_eq!(runtime.registry.state(next), State::Ready, "switched to unready context");

    match next {
        Slot::Driver => log::debug!("returning to driver"),
        Slot::Thread(index) => log::trace!("scheduling {}", runtime.registry.get(index).id),
    }

    if let Slot::Thread(index) = prev {
        if runtime.registry.state(prev) == State::Finished {
            let record = runtime.registry.remove(index);
            log::debug!("disposing {}", record.id);

            let activation = record.activation.expect("finished thread owns its stack");
            assert!(runtime.retired.is_none(), "retired stack wasn't released");
            runtime.retired = Some(activation.stack);

            runtime.registry.set_state(next, State::Running);
            runtime.running = next;
            let next = continuation(&mut runtime.registry, next);
            #[cfg(test)]
            check_resumable(next);
            return Transfer::Abandon(next);
        }
    }

    runtime.registry.set_state(prev, State::Ready);
    runtime.registry.set_state(next, State::Running);
    runtime.running = next;

    let (prev, next) = (
        continuation(&mut runtime.registry, prev),
        continuation(&mut runtime.registry, next),
    );
    #[cfg(test)]
    check_resumable(next);
    Transfer::Suspend(prev, next)
}

#[cfg(test)]
fn check_resumable(next: *const Continuation) {
    // safety: points into the registry, which the caller still borrows
    let stack_pointer = unsafe { (*next).stack_pointer() };
    super::stack::check_resume(stack_pointer as usize);
}

fn continuation(registry: &mut Registry, slot: Slot) -> *mut Continuation {
    match slot {
        Slot::Driver => registry.driver.continuation.as_mut_ptr(),
        Slot::Thread(index) => {
            let activation = registry.get_mut(index).activation.as_mut();
            let activation = activation.expect("scheduled thread owns its stack");
            &mut activation.continuation as *mut Continuation
        }
    }
}

/// Bottom frame of every thread's stack.
pub(super) extern "C" fn trampoline() -> ! {
    let body = tls::runtime(|runtime| {
        runtime.release_retired();

        let index = runtime.running_index();
        runtime.registry.get_mut(index).body.take().expect("thread body runs once")
    });

    let result = panic::catch_unwind(panic::AssertUnwindSafe(body));

    let (current, next) = tls::runtime(|runtime| {
        let current = runtime.running;
        let index = runtime.running_index();
        let record = runtime.registry.get_mut(index);
        record.state = State::Finished;

        if let Err(payload) = result {
            let id = record.id;
            log::error!("thread {id} panicked");
            runtime.panics.push((id, payload));
        }

        (current, scheduler::schedule_next(&runtime.registry, current))
    });

    switch(current, next);
    unreachable!("finished thread was resumed")
}
