//! Lambda runners: the coroutine substrate.
//!
//! A [`LambdaRunner`] is a dedicated thread hosting one re-entrant closure.
//! The closure may suspend itself with [`RunnerShared::pause`]; the owning
//! worker resumes it with [`LambdaRunner::cont`] and observes suspension or
//! completion with [`LambdaRunner::wait`]. The handoff is a mutex/condvar
//! pair: pausing wakes the worker, continuing wakes the runner, and exactly
//! one of the two threads runs at a time.

pub(crate) mod pool;

pub(crate) use pool::RunnerPool;

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

thread_local! {
    static CURRENT_RUNNER: RefCell<Option<Arc<RunnerShared>>> = RefCell::new(None);
}

/// The runner state reachable both from the worker side and from inside the
/// hosted closure (through the thread-local current-runner pointer).
pub(crate) struct RunnerShared {
    state: Mutex<RunnerState>,
    cv: Condvar,
    finished: AtomicBool,
    halt: AtomicBool,
}

struct RunnerState {
    running: bool,
    job: Option<Box<dyn FnOnce() + Send>>,
}

impl RunnerShared {
    /// Suspend the calling runner thread until the next `cont()`.
    ///
    /// Must be called from the runner's own thread; the worker blocked in
    /// `wait()` is woken first.
    pub(crate) fn pause(&self) {
        let mut state = self.state.lock();
        state.running = false;
        self.cv.notify_all();
        while !state.running {
            self.cv.wait(&mut state);
        }
    }

    fn resume_with(&self, f: impl FnOnce(&mut RunnerState)) {
        let mut state = self.state.lock();
        f(&mut state);
        state.running = true;
        drop(state);
        self.cv.notify_all();
    }
}

/// The runner shared state for the calling thread, if the thread was
/// launched by a runner.
pub(crate) fn current_runner() -> Option<Arc<RunnerShared>> {
    CURRENT_RUNNER.with(|c| c.borrow().clone())
}

/// One native thread that can run closures with pause/resume semantics.
pub(crate) struct LambdaRunner {
    shared: Arc<RunnerShared>,
    slot: usize,
    thread: Option<JoinHandle<()>>,
}

impl LambdaRunner {
    /// Spawn a runner for the given worker slot, optionally pinned to a core.
    pub(crate) fn spawn(
        slot: usize,
        core: Option<core_affinity::CoreId>,
        stack_size: Option<usize>,
    ) -> Result<Self> {
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState {
                running: true,
                job: None,
            }),
            cv: Condvar::new(),
            finished: AtomicBool::new(true),
            halt: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let mut builder = std::thread::Builder::new().name(format!("sts-runner-{slot}"));
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let thread = builder
            .spawn(move || {
                CURRENT_RUNNER.with(|c| *c.borrow_mut() = Some(Arc::clone(&thread_shared)));
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                }
                loop {
                    thread_shared.pause();
                    if thread_shared.halt.load(Ordering::Acquire) {
                        break;
                    }
                    let job = thread_shared.state.lock().job.take();
                    if let Some(job) = job {
                        job();
                    }
                    thread_shared.finished.store(true, Ordering::Release);
                }
            })
            .map_err(|e| Error::spawn(e.to_string()))?;

        trace!(slot, "spawned lambda runner");

        let runner = Self {
            shared,
            slot,
            thread: Some(thread),
        };
        // The runner is usable once its thread has reached the initial pause.
        runner.wait();
        Ok(runner)
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// Hand the runner a new closure and start it. The previous closure must
    /// have finished.
    pub(crate) fn run(&self, job: Box<dyn FnOnce() + Send>) {
        assert!(
            self.is_finished(),
            "LambdaRunner::run while a closure is still in flight"
        );
        self.shared.finished.store(false, Ordering::Release);
        self.shared.resume_with(|state| state.job = Some(job));
    }

    /// Resume a paused closure.
    pub(crate) fn cont(&self) {
        self.shared.resume_with(|_| {});
    }

    /// Block until the hosted closure pauses or finishes.
    pub(crate) fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.running {
            self.shared.cv.wait(&mut state);
        }
    }

    /// Whether the last closure has run to completion.
    pub(crate) fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }
}

impl Drop for LambdaRunner {
    fn drop(&mut self) {
        // The runner must be parked at its loop-top pause before the halt
        // wakeup, or the wakeup could be consumed by an in-flight pause.
        self.wait();
        debug_assert!(self.is_finished(), "dropping a runner mid-closure");
        self.shared.halt.store(true, Ordering::Release);
        self.cont();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
