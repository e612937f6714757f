//! Process-wide scheduler state.
//!
//! [`startup`] builds the worker pool, the step-completion barrier, the
//! coroutine runner pool and the default schedule, and makes the default
//! schedule active. [`shutdown`] stores the shutdown sentinel into the step
//! counter and joins every worker; it is only legal while the default
//! schedule is active.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::runner::RunnerPool;
use crate::schedule::Schedule;
use crate::sync::{spin, OmBarrier};
use crate::worker::{self, WorkerHandle};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct Runtime {
    config: Config,
    num_threads: usize,
    /// Global step counter: 0 before the first step, incremented per step,
    /// -1 signals shutdown.
    step: AtomicI64,
    /// Workers arrive here when they re-enter the step wait; the
    /// orchestrating thread consumes the arrivals at the end of each step.
    completion: OmBarrier,
    workers: Mutex<Vec<WorkerHandle>>,
    runner_pool: RunnerPool,
    cores: Vec<Option<core_affinity::CoreId>>,
    default_schedule: Arc<Schedule>,
    active: RwLock<Option<Arc<Schedule>>>,
    schedules: RwLock<HashMap<String, Arc<Schedule>>>,
}

static GLOBAL_RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

/// Bring the scheduler up with `num_threads` workers (including the calling
/// OS thread, which becomes worker 0).
pub fn startup(num_threads: usize) -> Result<()> {
    startup_with_config(Config::builder().num_threads(num_threads).build()?)
}

/// Bring the scheduler up from a full [`Config`].
pub fn startup_with_config(config: Config) -> Result<()> {
    config.validate()?;
    let mut global = GLOBAL_RUNTIME.write();
    if global.is_some() {
        return Err(Error::AlreadyStarted);
    }

    let num_threads = config.worker_threads();
    let cores: Vec<Option<core_affinity::CoreId>> = if config.pin_workers {
        let ids = core_affinity::get_core_ids().unwrap_or_default();
        (0..num_threads)
            .map(|i| (!ids.is_empty()).then(|| ids[i % ids.len()]))
            .collect()
    } else {
        vec![None; num_threads]
    };

    let runtime = Arc::new(Runtime {
        num_threads,
        step: AtomicI64::new(0),
        completion: OmBarrier::new(),
        workers: Mutex::new(Vec::new()),
        runner_pool: RunnerPool::new(
            num_threads,
            cores.clone(),
            config.stack_size,
            config.shared_cores,
        ),
        cores,
        default_schedule: Schedule::new_default(num_threads),
        active: RwLock::new(None),
        schedules: RwLock::new(HashMap::new()),
        config,
    });
    *runtime.active.write() = Some(Arc::clone(&runtime.default_schedule));

    // Every worker arrives once on startup and once after its first step.
    runtime
        .completion
        .close(2 * num_threads.saturating_sub(1));

    if runtime.config.pin_workers {
        if let Some(core) = runtime.cores[0] {
            core_affinity::set_for_current(core);
        }
    }

    let mut workers = runtime.workers.lock();
    for id in 1..num_threads {
        workers.push(worker::spawn(Arc::clone(&runtime), id)?);
    }
    drop(workers);

    debug!(num_threads, "scheduler started");
    *global = Some(runtime);
    Ok(())
}

/// Join all workers and tear the scheduler down. Only legal while the
/// default schedule is active.
pub fn shutdown() {
    let runtime = match GLOBAL_RUNTIME.write().take() {
        Some(rt) => rt,
        None => return,
    };
    assert!(
        runtime.active_schedule().is_default(),
        "shutdown while a user schedule is active"
    );
    runtime.step.store(-1, Ordering::Release);
    let mut workers = runtime.workers.lock();
    for worker in workers.iter_mut() {
        worker.join();
    }
    workers.clear();
    drop(workers);
    debug!("scheduler stopped");
}

pub(crate) fn current_runtime() -> Arc<Runtime> {
    GLOBAL_RUNTIME
        .read()
        .as_ref()
        .expect("scheduler not started - call sts_rs::startup() first")
        .clone()
}

impl Runtime {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub(crate) fn core_for(&self, id: usize) -> Option<core_affinity::CoreId> {
        self.cores.get(id).copied().flatten()
    }

    pub(crate) fn runner_pool(&self) -> &RunnerPool {
        &self.runner_pool
    }

    pub(crate) fn default_schedule(&self) -> Arc<Schedule> {
        Arc::clone(&self.default_schedule)
    }

    pub(crate) fn active_schedule(&self) -> Arc<Schedule> {
        Arc::clone(self.active.read().as_ref().expect("no active schedule"))
    }

    pub(crate) fn set_active(&self, schedule: Arc<Schedule>) {
        *self.active.write() = Some(schedule);
    }

    pub(crate) fn register_schedule(&self, name: &str, schedule: &Arc<Schedule>) {
        let prev = self
            .schedules
            .write()
            .insert(name.to_string(), Arc::clone(schedule));
        assert!(prev.is_none(), "schedule '{name}' already registered");
    }

    pub(crate) fn lookup_schedule(&self, name: &str) -> Option<Arc<Schedule>> {
        self.schedules.read().get(name).cloned()
    }

    pub(crate) fn load_step(&self) -> i64 {
        self.step.load(Ordering::Acquire)
    }

    /// Release the workers into the next step. All schedule state written
    /// before this call is visible to workers after their step wait returns.
    pub(crate) fn advance_step(&self) -> i64 {
        self.step.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Worker-side step wait: report completion of the previous step, then
    /// spin until the counter moves past it.
    pub(crate) fn wait_on_step_counter(&self, seen: i64) -> i64 {
        self.completion.mark_arrival();
        spin::wait_until_not(&self.step, seen)
    }

    /// Orchestrator-side end of step: wait for every worker to report back,
    /// then rearm the barrier for the next step.
    pub(crate) fn step_completion_wait_and_rearm(&self) {
        self.completion.wait();
        self.completion.close(self.num_threads - 1);
    }
}
