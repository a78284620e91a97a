//! A minimal single-threaded cooperative green thread runtime.
//!
//! Every OS thread owns an independent runtime. Green threads created on it share that OS thread,
//! each running on its own guard-paged stack, and hand off control in round-robin order
//! whenever one of them [yields](runtime::yield_now) or returns.
//!
//! # Examples
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//!
//! let handles: Vec<_> = ["A", "B"]
//!     .into_iter()
//!     .map(|label| {
//!         let log = log.clone();
//!         threadlet::create_thread(move || {
//!             for i in 1..=2 {
//!                 log.borrow_mut().push(format!("{label}{i}"));
//!                 threadlet::yield_now();
//!             }
//!         })
//!     })
//!     .collect();
//!
//! threadlet::run_all(handles);
//!
//! assert_eq!(*log.borrow(), ["A1", "B1", "A2", "B2"]);
//! ```

#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]

pub mod config;
pub mod runtime;

pub use runtime::{
    configure, create_thread, current, run_all, status, yield_now, State, Status, ThreadHandle, ThreadId,
    ThreadStatus,
};

/// Everything that can go wrong while driving green threads.
///
/// [Error::StackAllocation] is fatal when it happens inside [create_thread].
/// The remaining variants describe misuse of the API and are raised as panics.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The kernel refused to map memory for a thread's stack.
    #[error("failed to allocate thread stack: {0}")]
    StackAllocation(#[from] std::io::Error),

    /// An operation that suspends the calling thread was used from the driver.
    #[error("not called from inside a running thread")]
    OutsideThread,

    /// A handle refers to a thread that has already been disposed.
    #[error("thread {0} has already finished and been disposed")]
    StaleHandle(ThreadId),

    /// The scheduler was entered while it was already running.
    #[error("the runtime is already running on this thread")]
    Nested,

    /// The runtime was reconfigured while it still owns threads.
    #[error("can't reconfigure a runtime that has live threads")]
    ThreadsLive,
}
