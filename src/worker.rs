//! Worker threads.
//!
//! Worker 0 is the OS thread that drives the application; workers 1..n are
//! spawned at startup and live until shutdown. Between steps a worker spins
//! on the global step counter; when it advances, the worker drains its
//! subtask queue in the active schedule and goes back to waiting. A negative
//! step value is the shutdown sentinel.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use std::cell::Cell;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

thread_local! {
    static WORKER_ID: Cell<usize> = const { Cell::new(0) };
}

/// Scheduler thread id of the calling thread. The OS thread and any thread
/// not owned by the scheduler report 0; lambda runners inherit the id of the
/// worker that checked them out.
pub(crate) fn current_worker_id() -> usize {
    WORKER_ID.with(|id| id.get())
}

pub(crate) fn set_current_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}

pub(crate) struct WorkerHandle {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!(worker = self.id, "worker thread panicked");
            }
        }
    }
}

/// Spawn worker `id` (1-based; worker 0 is the caller).
pub(crate) fn spawn(rt: Arc<Runtime>, id: usize) -> Result<WorkerHandle> {
    let config = rt.config().clone();
    let core = rt.core_for(id);
    let mut builder =
        std::thread::Builder::new().name(format!("{}-{id}", config.thread_name_prefix));
    if let Some(size) = config.stack_size {
        builder = builder.stack_size(size);
    }
    let thread = builder
        .spawn(move || {
            set_current_worker_id(id);
            if let Some(core) = core {
                core_affinity::set_for_current(core);
            }
            run_loop(&rt, id);
        })
        .map_err(|e| Error::spawn(e.to_string()))?;
    Ok(WorkerHandle {
        id,
        thread: Some(thread),
    })
}

fn run_loop(rt: &Arc<Runtime>, id: usize) {
    debug!(worker = id, "worker started");
    let mut seen_step = 0;
    loop {
        let step = rt.wait_on_step_counter(seen_step);
        if step < 0 {
            break;
        }
        trace!(worker = id, step, "processing step");
        let schedule = rt.active_schedule();
        schedule.run_all_sub_tasks(id);
        // The active schedule may only change after every worker has arrived
        // back at the step barrier, which happens above on the next wait.
        debug_assert!(Arc::ptr_eq(&schedule, &rt.active_schedule()));
        seen_step = step;
    }
    debug!(worker = id, "worker exiting");
}
