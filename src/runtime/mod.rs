//! Cooperative green threads sharing one OS thread.
//!
//! The OS thread that calls [run_all] becomes the driver: it hands its CPU to the threads in
//! round-robin creation order and only gets it back once no other thread is ready.
//! A thread keeps the CPU until it returns or calls [yield_now].
//! A thread that does neither blocks the whole runtime, nothing preempts it.

use std::any::Any;
use std::num::NonZeroUsize;
use std::{fmt, marker, mem, panic, process};

use crate::config::Config;
use crate::Error;

mod context_switch;
mod registry;
mod scheduler;
pub(crate) mod stack;
mod switcher;
mod tls;

use registry::{Activation, RecordIndex, Registry, Slot, ThreadRecord};
pub use registry::{State, ThreadId};

pub(super) struct RuntimeState {
    config: Config,
    registry: Registry,
    running: Slot,
    /// Stack of the thread that was just disposed, released once the CPU has left it.
    retired: Option<stack::Stack>,
    panics: Vec<(ThreadId, Box<dyn Any + Send + 'static>)>,
    is_driving: bool,
}

impl RuntimeState {
    fn new() -> Self {
        RuntimeState {
            config: Config::from_env(),
            registry: Registry::new(),
            running: Slot::Driver,
            retired: None,
            panics: Vec::new(),
            is_driving: false,
        }
    }

    /// Allocates a stack and arranges for `body` to be the first thing that runs on it.
    fn provision(&mut self, body: Box<dyn FnOnce()>) -> Result<RecordIndex, Error> {
        let mut record = ThreadRecord::new(self.registry.allocate_id(), body);

        let guard_pages = NonZeroUsize::new(self.config.guard_pages).unwrap_or(NonZeroUsize::MIN);
        let usable_pages = NonZeroUsize::new(self.config.usable_pages()).unwrap_or(NonZeroUsize::MIN);
        let stack = stack::Stack::new(guard_pages, usable_pages)?;

        let continuation = unsafe { context_switch::prepare_stack(stack.base(), switcher::trampoline) };
        record.activation = Some(Activation {
            stack,
            continuation,
        });
        record.state = State::Ready;

        let id = record.id;
        let index = self.registry.insert(record);
        log::debug!("created thread {id}");

        Ok(index)
    }

    fn running_index(&self) -> RecordIndex {
        match self.running {
            Slot::Thread(index) => index,
            Slot::Driver => panic!("{}", Error::OutsideThread),
        }
    }

    fn release_retired(&mut self) {
        drop(self.retired.take());
    }

    fn status(&self) -> Status {
        Status {
            driver: self.registry.driver.state,
            threads: self
                .registry
                .iter()
                .map(|(_, record)| ThreadStatus {
                    id: record.id,
                    state: record.state,
                })
                .collect(),
        }
    }
}

/// Handle to a thread that hasn't been disposed yet.
///
/// Bound to the OS thread that created it.
#[derive(Debug)]
pub struct ThreadHandle {
    index: RecordIndex,
    id: ThreadId,
    _not_send: marker::PhantomData<*const ()>,
}

impl ThreadHandle {
    /// Identifier of the thread.
    pub fn id(&self) -> ThreadId {
        self.id
    }
}

/// Registers a new thread that runs `body` on its own stack once scheduled.
///
/// Can be called from the driver or from a running thread.
/// The thread is appended to the end of the round-robin order.
///
/// Failing to allocate the stack terminates the process.
pub fn create_thread<F: FnOnce() + 'static>(body: F) -> ThreadHandle {
    let result = tls::runtime(|runtime| {
        let index = runtime.provision(Box::new(body))?;
        Ok::<_, Error>((index, runtime.registry.get(index).id))
    });

    match result {
        Ok((index, id)) => ThreadHandle {
            index,
            id,
            _not_send: marker::PhantomData,
        },
        Err(error) => fatal(error),
    }
}

fn fatal(error: Error) -> ! {
    log::error!("{error}");
    eprintln!("threadlet: {error}");
    process::exit(1)
}

/// Runs every thread of this OS thread to completion, starting with the first of `handles`.
///
/// Threads created but left out of `handles` run as well.
/// Without any handle, the first ready thread in creation order starts.
/// Returns once every thread has finished and been disposed.
///
/// # Panics
/// If called from inside a thread, or given a handle of an already disposed thread.
/// If a thread panicked, the first panic is resumed after all other threads have finished.
pub fn run_all(handles: impl IntoIterator<Item = ThreadHandle>) {
    let handles: Vec<ThreadHandle> = handles.into_iter().collect();

    let mut next = tls::runtime(|runtime| {
        assert!(!runtime.is_driving, "{}", Error::Nested);

        let mut entries = Vec::with_capacity(handles.len());
        for handle in &handles {
            match runtime.registry.resolve(handle.index, handle.id) {
                Some(index) => entries.push(index),
                None => panic!("{}", Error::StaleHandle(handle.id)),
            }
        }

        runtime.is_driving = true;
        match entries.first() {
            Some(&index) => Slot::Thread(index),
            None => scheduler::schedule_next(&runtime.registry, Slot::Driver),
        }
    });

    while next != Slot::Driver {
        switcher::switch(Slot::Driver, next);
        next = tls::runtime(|runtime| scheduler::schedule_next(&runtime.registry, Slot::Driver));
    }

    let panics = tls::runtime(|runtime| {
        debug_assert!(runtime.registry.is_empty(), "driver quiescent with live threads");
        runtime.is_driving = false;
        mem::take(&mut runtime.panics)
    });

    if let Some((_, payload)) = panics.into_iter().next() {
        panic::resume_unwind(payload);
    }
}

/// Suspends the running thread, letting the next ready thread run.
///
/// Returns once the scheduler comes back around to the calling thread.
///
/// # Panics
/// If called from the driver.
pub fn yield_now() {
    let (current, next) = tls::runtime(|runtime| {
        let current = Slot::Thread(runtime.running_index());
        (current, scheduler::schedule_next(&runtime.registry, current))
    });

    switcher::switch(current, next);
}

/// Identifier of the running thread, [None] in the driver.
pub fn current() -> Option<ThreadId> {
    tls::runtime(|runtime| match runtime.running {
        Slot::Driver => None,
        Slot::Thread(index) => Some(runtime.registry.get(index).id),
    })
}

/// Snapshot of the driver and every live thread, in round-robin order.
pub fn status() -> Status {
    tls::runtime(|runtime| runtime.status())
}

/// Replaces the configuration used for threads created from now on.
///
/// # Panics
/// If this OS thread still has live threads.
pub fn configure(mut config: Config) {
    config.verify();

    tls::runtime(|runtime| {
        assert!(runtime.registry.is_empty(), "{}", Error::ThreadsLive);
        runtime.config = config;
    })
}

/// Snapshot of the runtime taken by [status], printable as a state table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// State of the context that called [run_all].
    pub driver: State,
    /// Live threads in round-robin order.
    pub threads: Vec<ThreadStatus>,
}

impl Status {
    /// Number of contexts in [State::Running], the driver included.
    pub fn running(&self) -> usize {
        let threads = self.threads.iter().filter(|thread| thread.state == State::Running).count();
        threads + usize::from(self.driver == State::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Thread States")?;
        writeln!(f, "=============")?;
        writeln!(f, "driver state:{}", self.driver)?;
        for thread in &self.threads {
            writeln!(f, "threadID: {} state:{}", thread.id, thread.state)?;
        }
        Ok(())
    }
}

/// State of one live thread at the time of a [status] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadStatus {
    /// Identifier of the thread.
    pub id: ThreadId,
    /// Where the thread is in its lifecycle.
    pub state: State,
}
