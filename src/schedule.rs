//! Schedules: precomputed plans mapping tasks to worker threads.
//!
//! A schedule is built between steps with the `assign_*` calls, activated
//! with [`Schedule::next_step`], fed with work through [`Schedule::run`] and
//! [`Schedule::parallel_for`], and closed with [`Schedule::wait`]. Workers
//! never search for work: each drains its own precomputed subtask queue in
//! assignment order.
//!
//! The built-in default schedule (returned by [`Schedule::instance`] for
//! unknown names) parallelizes every loop across all workers and executes
//! `run` closures synchronously on the caller; it is the active schedule
//! whenever no user schedule is inside a `next_step`..`wait` bracket.

use crate::range::{Range, Ratio};
use crate::reduction::{ReductionInner, TaskReduction};
use crate::runner;
use crate::runtime::current_runtime;
use crate::sync::spin;
use crate::task::{SubTask, Task, TaskFunctor, TaskKind};
use crate::util::CachePadded;
use crate::worker::{current_worker_id, set_current_worker_id};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// One worker's view of a schedule: its subtask queue in assignment order,
/// the index of the next unstarted subtask, the stack of currently executing
/// subtasks (nested loops push onto it), and the precomputed pivot targets
/// for each coroutine subtask.
#[derive(Default)]
struct ThreadQueue {
    subs: Vec<Arc<SubTask>>,
    next: usize,
    stack: Vec<usize>,
    pivots: Vec<Vec<usize>>,
}

/// A named, pre-computed plan mapping tasks to worker threads.
pub struct Schedule {
    name: Option<String>,
    is_default: bool,
    num_threads: usize,
    tasks: RwLock<Vec<Arc<Task>>>,
    labels: RwLock<HashMap<String, usize>>,
    queues: Vec<Mutex<ThreadQueue>>,
    /// Per-thread count of state changes (functor published, checkpoint
    /// advanced, subtask resumed) a paused coroutine has not reacted to yet.
    progress: Vec<CachePadded<AtomicI64>>,
    is_active: AtomicBool,
}

// Closures handed to `run`/`parallel_for` only borrow state the caller must
// keep alive until the step's `wait()` returns; the functor slot is dropped
// before control leaves the step bracket. Same pattern as scoped spawning.
unsafe fn erase_once<'env>(
    f: Box<dyn FnOnce() + Send + 'env>,
) -> Box<dyn FnOnce() + Send + 'static> {
    std::mem::transmute(f)
}

unsafe fn erase_loop<'env>(
    f: Box<dyn Fn(i64) + Send + Sync + 'env>,
) -> Box<dyn Fn(i64) + Send + Sync + 'static> {
    std::mem::transmute(f)
}

impl Schedule {
    fn build(name: Option<String>, is_default: bool, num_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            is_default,
            num_threads,
            tasks: RwLock::new(Vec::new()),
            labels: RwLock::new(HashMap::new()),
            queues: (0..num_threads).map(|_| Mutex::new(ThreadQueue::default())).collect(),
            progress: (0..num_threads)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
            is_active: AtomicBool::new(is_default),
        })
    }

    /// Create an anonymous schedule.
    pub fn new() -> Arc<Self> {
        let rt = current_runtime();
        Self::build(None, false, rt.num_threads())
    }

    /// Create a schedule registered under `name`.
    pub fn named(name: &str) -> Arc<Self> {
        let rt = current_runtime();
        let schedule = Self::build(Some(name.to_string()), false, rt.num_threads());
        rt.register_schedule(name, &schedule);
        schedule
    }

    /// Look up a schedule by name, falling back to the default schedule.
    pub fn instance(name: &str) -> Arc<Self> {
        let rt = current_runtime();
        rt.lookup_schedule(name).unwrap_or_else(|| rt.default_schedule())
    }

    /// The built-in default schedule: one loop slice per worker, `run`
    /// executed synchronously on the caller.
    pub(crate) fn new_default(num_threads: usize) -> Arc<Self> {
        let schedule = Self::build(None, true, num_threads);
        {
            let (task_id, task) = schedule.get_or_create_task("default", TaskKind::Loop);
            for tid in 0..num_threads {
                let sub = task.push_subtask(task_id, tid, Range::unit_slice(tid, num_threads));
                schedule.queues[tid].lock().subs.push(sub);
            }
        }
        schedule
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    // ---- assignment API (main thread, between steps) --------------------

    fn assert_main_thread(&self, what: &str) {
        assert_eq!(current_worker_id(), 0, "{what} must be called from thread 0");
        assert!(
            runner::current_runner().is_none(),
            "{what} must not be called from inside a coroutine"
        );
    }

    fn assert_assignable(&self, tid: usize) {
        self.assert_main_thread("assign");
        assert!(!self.is_default, "the default schedule cannot be reassigned");
        assert!(
            !self.is_active.load(Ordering::Acquire),
            "assignments are only allowed between steps"
        );
        assert!(tid < self.num_threads, "thread id {tid} out of range");
    }

    fn get_or_create_task(&self, label: &str, kind: TaskKind) -> (usize, Arc<Task>) {
        if let Some(&id) = self.labels.read().get(label) {
            let task = Arc::clone(&self.tasks.read()[id]);
            assert_eq!(
                task.kind, kind,
                "task '{label}' was previously assigned with a different shape"
            );
            return (id, task);
        }
        let mut tasks = self.tasks.write();
        let id = tasks.len();
        let task = Arc::new(Task::new(label, kind, self.num_threads));
        tasks.push(Arc::clone(&task));
        self.labels.write().insert(label.to_string(), id);
        (id, task)
    }

    fn task_by_label(&self, label: &str) -> Option<(usize, Arc<Task>)> {
        let id = *self.labels.read().get(label)?;
        Some((id, Arc::clone(&self.tasks.read()[id])))
    }

    fn expect_task(&self, label: &str) -> (usize, Arc<Task>) {
        self.task_by_label(label)
            .unwrap_or_else(|| panic!("unknown task label '{label}'"))
    }

    /// Assign a basic task to a thread. Order of assign calls fixes the
    /// execution order on that thread.
    pub fn assign_run(&self, label: &str, tid: usize) {
        self.assert_assignable(tid);
        let (task_id, task) = self.get_or_create_task(label, TaskKind::Basic);
        let sub = task.push_subtask(task_id, tid, Range::unit());
        self.queues[tid].lock().subs.push(sub);
    }

    /// Assign a basic task plus a companion multi-loop task
    /// `"<label>_multiloop"` whose slices tile `[0, 1]` evenly over
    /// `threads` in order. The basic task's body may then issue any number
    /// of `parallel_for` rounds against the companion label.
    pub fn assign_run_multi(&self, label: &str, tid: usize, threads: &[usize]) {
        assert!(!threads.is_empty(), "multi-loop needs at least one thread");
        self.assign_run(label, tid);
        let ml_label = format!("{label}_multiloop");
        let (ml_id, ml_task) = self.get_or_create_task(&ml_label, TaskKind::MultiLoop);
        for (i, &t) in threads.iter().enumerate() {
            self.assert_assignable(t);
            let sub = ml_task.push_subtask(ml_id, t, Range::unit_slice(i, threads.len()));
            self.queues[t].lock().subs.push(sub);
        }
        let (_, basic) = self.expect_task(label);
        basic.set_companion(ml_task);
    }

    /// Assign one fractional slice of a loop task to a thread. The slices
    /// assigned across all threads must tile `[0, 1]`.
    pub fn assign_loop(&self, label: &str, tid: usize, range: Range<Ratio>) {
        self.assert_assignable(tid);
        assert!(range.is_unit_subrange(), "loop range must lie within [0, 1]");
        let (task_id, task) = self.get_or_create_task(label, TaskKind::Loop);
        let sub = task.push_subtask(task_id, tid, range);
        self.queues[tid].lock().subs.push(sub);
    }

    /// Assign a loop task split evenly over `threads`, in order.
    pub fn assign_loop_even(&self, label: &str, threads: &[usize]) {
        assert!(!threads.is_empty(), "loop needs at least one thread");
        for (i, &tid) in threads.iter().enumerate() {
            self.assign_loop(label, tid, Range::unit_slice(i, threads.len()));
        }
    }

    /// Re-slice an assigned loop: `intervals` holds the cut points, from 0
    /// to 1, one more than the task has subtasks.
    pub fn set_task_ranges(&self, label: &str, intervals: &[Ratio]) {
        self.assert_main_thread("set_task_ranges");
        let (_, task) = self.expect_task(label);
        let subtasks = task.subtasks();
        assert_eq!(
            intervals.len(),
            subtasks.len() + 1,
            "need one interval endpoint more than subtasks"
        );
        assert_eq!(intervals[0], Ratio::ZERO, "intervals must start at 0");
        assert_eq!(*intervals.last().unwrap(), Ratio::ONE, "intervals must end at 1");
        for (i, sub) in subtasks.iter().enumerate() {
            assert!(intervals[i] <= intervals[i + 1], "intervals must be monotone");
            sub.set_range(Range::new(intervals[i], intervals[i + 1]));
        }
    }

    /// Mark a task as cooperatively scheduled on the given threads: its
    /// subtasks there execute inside a lambda runner and may `pause`,
    /// pivoting to later subtasks of the tasks named in `next_labels`.
    /// Labels that never get assigned are ignored.
    pub fn set_coroutine(&self, label: &str, threads: &[usize], next_labels: &[&str]) {
        self.assert_main_thread("set_coroutine");
        let (_, task) = self.expect_task(label);
        task.set_coroutine(threads, next_labels);
    }

    /// Allow idle subtasks of this loop task to take iterations from
    /// slower siblings.
    pub fn enable_task_auto_balancing(&self, label: &str) {
        self.assert_main_thread("enable_task_auto_balancing");
        let (_, task) = self.expect_task(label);
        task.set_auto_balance();
    }

    /// Mark a task as a `yield_now` target.
    pub fn set_high_priority(&self, label: &str) {
        self.assert_main_thread("set_high_priority");
        let (_, task) = self.expect_task(label);
        task.set_high_priority();
    }

    /// Remove every subtask from every task and thread queue. Task labels
    /// survive, so coroutine and priority settings are re-applied on the
    /// next assignment round.
    pub fn clear_assignments(&self) {
        self.assert_main_thread("clear_assignments");
        assert!(
            !self.is_active.load(Ordering::Acquire),
            "clear_assignments during a step"
        );
        for task in self.tasks.read().iter() {
            task.clear_subtasks();
        }
        for queue in &self.queues {
            let mut q = queue.lock();
            q.subs.clear();
            q.next = 0;
            q.stack.clear();
            q.pivots.clear();
        }
    }

    // ---- step orchestration ---------------------------------------------

    /// Reset all tasks and queues for a fresh step and precompute the pivot
    /// targets of every coroutine subtask.
    fn reset_step_state(&self) {
        for task in self.tasks.read().iter() {
            task.restart();
        }
        let tasks = self.tasks.read();
        let labels = self.labels.read();
        for (tid, queue) in self.queues.iter().enumerate() {
            let mut q = queue.lock();
            q.next = 0;
            assert!(q.stack.is_empty(), "step started while a subtask is executing");
            let pivots: Vec<Vec<usize>> = {
                let subs = &q.subs;
                subs.iter()
                    .enumerate()
                    .map(|(idx, sub)| {
                        let task = &tasks[sub.task_id];
                        if !task.is_coroutine_on(tid) {
                            return Vec::new();
                        }
                        let target_ids: HashSet<usize> = task
                            .next_tasks()
                            .iter()
                            .filter_map(|l| labels.get(l).copied())
                            .collect();
                        // Only later queue positions are valid pivot targets;
                        // earlier ones are reached on the worker's own scan.
                        (idx + 1..subs.len())
                            .filter(|&j| target_ids.contains(&subs[j].task_id))
                            .collect()
                    })
                    .collect()
            };
            q.pivots = pivots;
        }
        for p in &self.progress {
            p.store(0, Ordering::Release);
        }
    }

    /// Activate this schedule and release the workers into the next step.
    pub fn next_step(self: &Arc<Self>) {
        self.assert_main_thread("next_step");
        assert!(!self.is_default, "next_step on the default schedule");
        let rt = current_runtime();
        let active = rt.active_schedule();
        assert!(
            active.is_default() || Arc::ptr_eq(&active, self),
            "next_step while schedule {:?} is active",
            active.name()
        );
        self.reset_step_state();
        self.is_active.store(true, Ordering::Release);
        rt.set_active(Arc::clone(self));
        let step = rt.advance_step();
        debug!(schedule = ?self.name, step, "step started");
    }

    /// Supply the functor of a basic task. On the default schedule (or for
    /// a label with no assignment) the closure runs synchronously instead.
    pub fn run<'env, F>(&self, label: &str, f: F)
    where
        F: FnOnce() + Send + 'env,
    {
        if self.is_default {
            f();
            return;
        }
        let Some((task_id, task)) = self.task_by_label(label) else {
            f();
            return;
        };
        let tid = current_worker_id();
        if tid == 0 {
            assert!(
                self.is_active.load(Ordering::Acquire),
                "run('{label}') outside a next_step..wait bracket"
            );
            let f = unsafe { erase_once(Box::new(f)) };
            task.set_functor(TaskFunctor::basic(f));
            self.notify_progress();
            trace!(label, "functor published");
        }
        // Participate right away when this task is next on the caller's
        // own queue.
        let next_idx = {
            let q = self.queues[tid].lock();
            (q.next < q.subs.len()
                && q.subs[q.next].task_id == task_id
                && !q.subs[q.next].is_done())
            .then_some(q.next)
        };
        if let Some(idx) = next_idx {
            self.run_sub_task(tid, idx);
        }
    }

    /// Assign a no-op functor to a basic task, keeping its barrier
    /// contracts intact for this step.
    pub fn skip_run(&self, label: &str) {
        self.assert_main_thread("skip_run");
        self.run(label, || {});
    }

    /// Assign an empty loop functor to a loop task.
    pub fn skip_loop(&self, label: &str) {
        self.assert_main_thread("skip_loop");
        if self.is_default {
            return;
        }
        let Some((task_id, task)) = self.task_by_label(label) else {
            return;
        };
        assert_eq!(task.kind, TaskKind::Loop, "skip_loop on a non-loop task");
        task.set_functor(TaskFunctor::noop_loop());
        self.notify_progress();
        let next_idx = {
            let q = self.queues[0].lock();
            (q.next < q.subs.len() && q.subs[q.next].task_id == task_id).then_some(q.next)
        };
        if let Some(idx) = next_idx {
            self.run_sub_task(0, idx);
        }
    }

    /// Execute a parallel loop over `[start, end)`.
    ///
    /// On a user schedule the caller must have this task next on its queue;
    /// the task's serial thread publishes the functor and blocks until every
    /// slice has completed. On the default schedule the loop is spread over
    /// all workers inside an internal step.
    pub fn parallel_for<'env, F>(&self, label: &str, start: i64, end: i64, body: F)
    where
        F: Fn(i64) + Send + Sync + 'env,
    {
        let body = unsafe { erase_loop(Box::new(body)) };
        self.parallel_for_impl(label, Range::new(start, end), body, None);
    }

    /// Like [`Schedule::parallel_for`], feeding per-thread values collected
    /// with [`Schedule::collect`] into `reduction` once the loop completes.
    pub fn parallel_for_reduce<'env, F, T>(
        &self,
        label: &str,
        start: i64,
        end: i64,
        body: F,
        reduction: &TaskReduction<T>,
    ) where
        F: Fn(i64) + Send + Sync + 'env,
        T: Clone + AddAssign + Send + 'static,
    {
        let body = unsafe { erase_loop(Box::new(body)) };
        let inner = reduction.inner();
        let serial = self.parallel_for_impl(
            label,
            Range::new(start, end),
            body,
            Some(inner.clone() as Arc<dyn Any + Send + Sync>),
        );
        if serial {
            inner.reduce();
        }
    }

    /// Returns whether the caller was the serial thread (and hence the loop
    /// and its end barrier have fully completed).
    fn parallel_for_impl(
        &self,
        label: &str,
        range: Range<i64>,
        body: Box<dyn Fn(i64) + Send + Sync + 'static>,
        reduction: Option<Arc<dyn Any + Send + Sync>>,
    ) -> bool {
        if self.is_default {
            return self.default_parallel_for(range, body, reduction);
        }
        let (task_id, task) = self.expect_task(label);
        let tid = current_worker_id();
        let serial = task.is_serial_thread(tid);

        match task.kind {
            TaskKind::Basic => panic!("parallel_for on basic task '{label}'"),
            TaskKind::Loop => {
                if serial {
                    task.set_reduction(reduction);
                    task.set_functor(TaskFunctor::Loop { body, range });
                    self.notify_progress();
                }
                self.run_nested_loop(task_id, tid);
                if serial {
                    task.wait();
                }
                serial
            }
            TaskKind::MultiLoop => {
                assert!(
                    serial,
                    "only the serial thread may issue rounds on multi-loop '{label}'"
                );
                task.set_reduction(reduction);
                task.close_round();
                task.set_round_functor(TaskFunctor::Loop { body, range });
                self.notify_progress();
                task.open_round();
                // Run our own slice of the round inline.
                let idx = self.enter_subtask_frame(tid, task_id);
                let sub = self.subtask_at(tid, idx);
                {
                    let mut times = sub.times.lock();
                    if times.wait_start.is_none() {
                        times.wait_start = Some(Instant::now());
                    }
                    times.run_starts.push(Instant::now());
                }
                task.run_round_slice(&sub);
                sub.times.lock().run_ends.push(Instant::now());
                self.queues[tid].lock().stack.pop();
                task.wait();
                true
            }
        }
    }

    /// Advance the caller's queue into the loop subtask it is expected to
    /// execute next, run exactly that subtask, and return.
    fn run_nested_loop(&self, task_id: usize, tid: usize) {
        let idx = {
            let mut q = self.queues[tid].lock();
            assert!(
                q.next < q.subs.len() && q.subs[q.next].task_id == task_id,
                "parallel_for does not match the caller's next assigned subtask"
            );
            let idx = q.next;
            q.next += 1;
            q.stack.push(idx);
            idx
        };
        let sub = self.subtask_at(tid, idx);
        let task = self.task_of(&sub);
        loop {
            spin::wait_until_ge(
                task.checkpoint_cell(),
                sub.pause_threshold.load(Ordering::Acquire),
            );
            if self.drive_sub_task(tid, idx) {
                break;
            }
        }
        self.queues[tid].lock().stack.pop();
    }

    /// Queue bookkeeping for a multi-loop round on the serial thread: the
    /// first round consumes the queue position, later rounds re-enter the
    /// same subtask.
    fn enter_subtask_frame(&self, tid: usize, task_id: usize) -> usize {
        let mut q = self.queues[tid].lock();
        if q.next < q.subs.len() && q.subs[q.next].task_id == task_id {
            let idx = q.next;
            q.next += 1;
            q.stack.push(idx);
            return idx;
        }
        let idx = q
            .subs
            .iter()
            .position(|s| s.task_id == task_id && !s.is_done())
            .expect("multi-loop round without an assigned subtask on this thread");
        q.stack.push(idx);
        idx
    }

    fn default_parallel_for(
        &self,
        range: Range<i64>,
        body: Box<dyn Fn(i64) + Send + Sync + 'static>,
        reduction: Option<Arc<dyn Any + Send + Sync>>,
    ) -> bool {
        self.assert_main_thread("parallel_for");
        let rt = current_runtime();
        assert!(
            rt.active_schedule().is_default(),
            "default-schedule parallel_for while a user schedule is active"
        );
        // The default schedule brackets each loop in its own internal step.
        self.reset_step_state();
        let task = Arc::clone(&self.tasks.read()[0]);
        task.set_reduction(reduction);
        task.set_functor(TaskFunctor::Loop { body, range });
        rt.advance_step();
        self.run_sub_task(0, 0);
        task.wait();
        task.take_functor();
        task.set_reduction(None);
        rt.step_completion_wait_and_rearm();
        true
    }

    /// Wait for every task of the active step to complete, then hand the
    /// active-schedule pointer back to the default schedule.
    pub fn wait(self: &Arc<Self>) {
        self.assert_main_thread("wait");
        assert!(!self.is_default, "wait on the default schedule");
        assert!(
            self.is_active.load(Ordering::Acquire),
            "wait on an inactive schedule"
        );
        self.run_all_sub_tasks(0);
        let tasks = self.tasks.read().clone();
        for task in &tasks {
            task.wait();
        }
        // Step closures must not outlive the step bracket.
        for task in &tasks {
            task.take_functor();
            task.set_reduction(None);
        }
        let rt = current_runtime();
        rt.step_completion_wait_and_rearm();
        self.is_active.store(false, Ordering::Release);
        rt.set_active(rt.default_schedule());
        debug!(schedule = ?self.name, "step completed");
    }

    /// Wait for one task's end barrier from any thread.
    pub fn wait_for_task(&self, label: &str) {
        let (_, task) = self.expect_task(label);
        task.wait();
    }

    /// Current value of the global step counter.
    pub fn load_step_counter(&self) -> i64 {
        current_runtime().load_step()
    }

    // ---- queue execution -------------------------------------------------

    fn subtask_at(&self, tid: usize, idx: usize) -> Arc<SubTask> {
        Arc::clone(&self.queues[tid].lock().subs[idx])
    }

    fn task_of(&self, sub: &SubTask) -> Arc<Task> {
        Arc::clone(&self.tasks.read()[sub.task_id])
    }

    /// Drain this worker's queue: keep scanning in assignment order until
    /// every subtask is done. Paused coroutines are revisited on each scan.
    pub(crate) fn run_all_sub_tasks(&self, tid: usize) {
        loop {
            let pending: Vec<usize> = {
                let q = self.queues[tid].lock();
                q.subs
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.is_done())
                    .map(|(i, _)| i)
                    .collect()
            };
            if pending.is_empty() {
                return;
            }
            for idx in pending {
                if !self.subtask_at(tid, idx).is_done() {
                    self.run_sub_task(tid, idx);
                }
            }
        }
    }

    /// Execute one subtask, honoring checkpoints and pivoting to later
    /// coroutine targets while it is paused. May return with the subtask
    /// still unfinished; the caller's next scan picks it back up.
    fn run_sub_task(&self, tid: usize, idx: usize) {
        {
            let mut q = self.queues[tid].lock();
            if q.next == idx {
                q.next += 1;
            }
            if idx > 0 {
                let mut times = q.subs[idx - 1].times.lock();
                if times.next_run_avail.is_none() {
                    times.next_run_avail = Some(Instant::now());
                }
            }
            q.stack.push(idx);
        }
        let sub = self.subtask_at(tid, idx);
        let task = self.task_of(&sub);
        loop {
            // A paused subtask may only resume once the task checkpoint has
            // caught up with the threshold it paused at.
            spin::wait_until_ge(
                task.checkpoint_cell(),
                sub.pause_threshold.load(Ordering::Acquire),
            );
            if self.drive_sub_task(tid, idx) {
                break;
            }
            let (target, _) = self.find_pause_target(tid, idx);
            if let Some(t) = target {
                self.run_sub_task(tid, t);
                if task.checkpoint() >= sub.pause_threshold.load(Ordering::Acquire) {
                    continue;
                }
            }
            // Nothing to pivot to (or still checkpoint-blocked): yield to
            // the caller so it can make progress, e.g. publish the functor
            // the paused subtask is waiting on.
            self.queues[tid].lock().stack.pop();
            return;
        }
        // Done; drain pivot targets that have not run yet so their turn is
        // not postponed to the end of the queue.
        let targets: Vec<usize> = self.queues[tid].lock().pivots[idx].clone();
        for t in targets {
            if !self.subtask_at(tid, t).is_done() {
                self.run_sub_task(tid, t);
            }
        }
        self.queues[tid].lock().stack.pop();
    }

    /// Run or resume one subtask, returning whether it finished.
    fn drive_sub_task(&self, tid: usize, idx: usize) -> bool {
        let sub = self.subtask_at(tid, idx);
        let task = self.task_of(&sub);

        if !task.is_coroutine_on(tid) {
            match task.kind {
                TaskKind::MultiLoop => task.run_rounds(&sub, tid),
                _ => task.run_subtask_to_completion(&sub),
            }
            sub.set_done(true);
            return true;
        }

        let runner = match sub.runner.lock().take() {
            Some(runner) => {
                sub.times.lock().run_starts.push(Instant::now());
                self.progress[tid].fetch_add(1, Ordering::AcqRel);
                runner.cont();
                runner
            }
            None => {
                let rt = current_runtime();
                let runner = rt
                    .runner_pool()
                    .get(tid)
                    .expect("failed to spawn a coroutine runner");
                let task2 = Arc::clone(&task);
                let sub2 = Arc::clone(&sub);
                runner.run(Box::new(move || {
                    // STS calls inside the closure must resolve to the
                    // worker this subtask was assigned to.
                    set_current_worker_id(tid);
                    match task2.kind {
                        TaskKind::MultiLoop => task2.run_rounds(&sub2, tid),
                        _ => task2.run_subtask_to_completion(&sub2),
                    }
                }));
                runner
            }
        };
        runner.wait();
        if runner.is_finished() {
            current_runtime().runner_pool().release(runner);
            sub.set_done(true);
            true
        } else {
            sub.times.lock().run_ends.push(Instant::now());
            *sub.runner.lock() = Some(runner);
            false
        }
    }

    /// First acceptable pivot target after `idx` on this worker, plus
    /// whether any allowed target is still incomplete. A target is
    /// acceptable when it is not done, its functor is available, and its
    /// pause threshold is within its task's checkpoint.
    fn find_pause_target(&self, tid: usize, idx: usize) -> (Option<usize>, bool) {
        let q = self.queues[tid].lock();
        let tasks = self.tasks.read();
        let mut any_incomplete = false;
        for &t in &q.pivots[idx] {
            let sub = &q.subs[t];
            if sub.is_done() {
                continue;
            }
            any_incomplete = true;
            let task = &tasks[sub.task_id];
            if !task.is_ready() {
                continue;
            }
            if sub.pause_threshold.load(Ordering::Acquire) > task.checkpoint() {
                continue;
            }
            return (Some(t), true);
        }
        (None, any_incomplete)
    }

    /// Whether any task this one may pivot to still has unfinished work on
    /// the caller's worker, anywhere in the queue.
    fn has_unfinished_pivot_task(&self, tid: usize, task: &Task) -> bool {
        let next = task.next_tasks();
        if next.is_empty() {
            return false;
        }
        let labels = self.labels.read();
        let ids: HashSet<usize> = next.iter().filter_map(|l| labels.get(l).copied()).collect();
        let q = self.queues[tid].lock();
        q.subs.iter().any(|s| !s.is_done() && ids.contains(&s.task_id))
    }

    fn current_frame(&self, tid: usize) -> Option<(Arc<SubTask>, Arc<Task>)> {
        let idx = {
            let q = self.queues[tid].lock();
            *q.stack.last()?
        };
        let sub = self.subtask_at(tid, idx);
        let task = self.task_of(&sub);
        Some((sub, task))
    }

    fn notify_progress(&self) {
        for p in &self.progress {
            p.fetch_add(1, Ordering::AcqRel);
        }
    }

    // ---- in-task API -----------------------------------------------------

    /// Cooperatively pause the current coroutine subtask.
    ///
    /// Suspends when a pivot-allowed task still has unfinished work on this
    /// worker or when `cp` is ahead of the task checkpoint; the subtask is
    /// resumed once its worker comes back around and the checkpoint allows
    /// it. Returns `false` without suspending when there is nothing to
    /// yield to.
    pub fn pause_at(&self, cp: i64) -> bool {
        let runner = runner::current_runner().expect("pause called outside a coroutine");
        let tid = current_worker_id();
        if cp == 0 && self.progress[tid].load(Ordering::Acquire) == 0 {
            return false;
        }
        let _ = self.progress[tid]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| (v > 0).then(|| v - 1));
        let (sub, task) = self
            .current_frame(tid)
            .expect("pause called outside a running subtask");
        let idx = *self.queues[tid].lock().stack.last().unwrap();
        let (target, _) = self.find_pause_target(tid, idx);
        let must_wait = cp > task.checkpoint();
        if target.is_some() || must_wait || self.has_unfinished_pivot_task(tid, &task) {
            sub.pause_threshold.store(cp, Ordering::Release);
            trace!(task = %task.label, tid, cp, "coroutine pausing");
            runner.pause();
            true
        } else {
            false
        }
    }

    /// `pause_at(0)`: yield to any unfinished pivot target.
    pub fn pause(&self) -> bool {
        self.pause_at(0)
    }

    /// Advance the current task's checkpoint. Called from the task's serial
    /// thread; paused siblings waiting below `value` become resumable.
    pub fn set_checkpoint(&self, value: i64) {
        let tid = current_worker_id();
        let (_, task) = self
            .current_frame(tid)
            .expect("set_checkpoint outside a task");
        task.set_checkpoint(value);
        self.notify_progress();
    }

    /// The current task's checkpoint.
    pub fn checkpoint(&self) -> i64 {
        let tid = current_worker_id();
        let (_, task) = self.current_frame(tid).expect("checkpoint outside a task");
        task.checkpoint()
    }

    /// Run a ready high-priority subtask from the caller's own queue to
    /// completion, if there is one; otherwise return immediately.
    pub fn yield_now(&self) {
        let tid = current_worker_id();
        let candidate = {
            let q = self.queues[tid].lock();
            let tasks = self.tasks.read();
            q.subs.iter().enumerate().find_map(|(i, s)| {
                if s.is_done() || q.stack.contains(&i) {
                    return None;
                }
                let task = &tasks[s.task_id];
                (task.is_high_priority() && task.is_ready()).then_some(i)
            })
        };
        if let Some(idx) = candidate {
            trace!(tid, "yielding to high-priority subtask");
            self.run_sub_task(tid, idx);
        }
    }

    /// Create a reduction sized to the task's thread count.
    pub fn create_task_reduction<T>(&self, label: &str, init: T) -> TaskReduction<T>
    where
        T: Clone + AddAssign + Send + 'static,
    {
        let (_, task) = self.expect_task(label);
        TaskReduction::new(init, task.num_threads())
    }

    /// Add `value` into the current task's reduction slot for this thread.
    /// Ignored when called outside a task or without a reduction in place.
    pub fn collect<T>(&self, value: T)
    where
        T: Clone + AddAssign + Send + 'static,
    {
        let tid = current_worker_id();
        let Some((_, task)) = self.current_frame(tid) else {
            return;
        };
        let Some(reduction) = task.reduction() else {
            return;
        };
        let Ok(inner) = reduction.downcast::<ReductionInner<T>>() else {
            return;
        };
        let Some(pos) = task.thread_local_id(tid) else {
            return;
        };
        inner.collect(value, pos);
    }

    /// Record a named timestamp on the currently executing subtask.
    pub fn record_time(&self, label: &str) {
        let tid = current_worker_id();
        if let Some((sub, _)) = self.current_frame(tid) {
            sub.record_aux_time(label);
        }
    }

    /// Task-local id of the calling thread within its current task.
    pub fn task_thread_id(&self) -> Option<usize> {
        let tid = current_worker_id();
        let (_, task) = self.current_frame(tid)?;
        task.thread_local_id(tid)
    }

    /// Number of threads participating in the current task.
    pub fn task_num_threads(&self) -> usize {
        let tid = current_worker_id();
        self.current_frame(tid)
            .map_or(0, |(_, task)| task.num_threads())
    }

    /// Number of threads participating in the named task.
    pub fn task_num_threads_of(&self, label: &str) -> usize {
        let (_, task) = self.expect_task(label);
        task.num_threads()
    }

    /// When the named task's functor was last published this step.
    pub fn functor_set_at(&self, label: &str) -> Option<Instant> {
        let (_, task) = self.expect_task(label);
        task.functor_set_at()
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("name", &self.name)
            .field("is_default", &self.is_default)
            .field("num_threads", &self.num_threads)
            .field("num_tasks", &self.tasks.read().len())
            .field("is_active", &self.is_active.load(Ordering::Relaxed))
            .finish()
    }
}
