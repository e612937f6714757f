//! Tasks and subtasks: the schedulable units of one step.
//!
//! A task is a labelled unit of work executed once per step; its subtasks
//! are the per-thread portions. A basic task has exactly one subtask, a loop
//! task one per participating thread. The functor is supplied by `run` /
//! `parallel_for` during the step; subtasks spin on the task's begin barrier
//! until it appears and report completion on the end barrier.

use crate::range::{Range, Ratio};
use crate::runner::LambdaRunner;
use crate::sync::{MoBarrier, OmBarrier, RmoBarrier};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// The work handed to one subtask execution.
#[derive(Clone, Copy, Debug)]
pub(crate) enum WorkSlice {
    /// A fractional slice of the loop range (or ignored, for basic tasks).
    Fraction(Range<Ratio>),
    /// An explicit iteration range, used for stolen work.
    Iters(Range<i64>),
}

/// The executable shape of a task, set anew each step.
pub(crate) enum TaskFunctor {
    /// Runs once, on the single subtask's thread.
    Basic(Mutex<Option<Box<dyn FnOnce() + Send>>>),
    /// Iterates `body(i)` over a sub-range of `range`.
    Loop {
        body: Box<dyn Fn(i64) + Send + Sync>,
        range: Range<i64>,
    },
}

impl TaskFunctor {
    pub(crate) fn basic(f: Box<dyn FnOnce() + Send>) -> Self {
        TaskFunctor::Basic(Mutex::new(Some(f)))
    }

    pub(crate) fn noop_loop() -> Self {
        TaskFunctor::Loop {
            body: Box::new(|_| {}),
            range: Range::new(0, 0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Basic,
    Loop,
    MultiLoop,
}

/// Time records for one subtask within one step. Coroutine subtasks get one
/// run start/end pair per resume.
#[derive(Debug, Default)]
pub(crate) struct TaskTimes {
    pub(crate) wait_start: Option<Instant>,
    pub(crate) run_starts: Vec<Instant>,
    pub(crate) run_ends: Vec<Instant>,
    pub(crate) next_run_avail: Option<Instant>,
    pub(crate) aux: HashMap<String, Vec<Instant>>,
}

impl TaskTimes {
    fn clear(&mut self) {
        self.wait_start = None;
        self.run_starts.clear();
        self.run_ends.clear();
        self.next_run_avail = None;
        self.aux.clear();
    }
}

/// The portion of a task executed by a single thread.
pub(crate) struct SubTask {
    pub(crate) task_id: usize,
    pub(crate) thread_id: usize,
    range: Mutex<Range<Ratio>>,
    done: AtomicBool,
    /// Checkpoint the subtask asked to be resumed at; 0 when not paused.
    pub(crate) pause_threshold: AtomicI64,
    /// The runner hosting this subtask, present only while a coroutine
    /// subtask is in flight.
    pub(crate) runner: Mutex<Option<LambdaRunner>>,
    pub(crate) times: Mutex<TaskTimes>,
}

impl SubTask {
    fn new(task_id: usize, thread_id: usize, range: Range<Ratio>) -> Self {
        Self {
            task_id,
            thread_id,
            range: Mutex::new(range),
            done: AtomicBool::new(false),
            pause_threshold: AtomicI64::new(0),
            runner: Mutex::new(None),
            times: Mutex::new(TaskTimes::default()),
        }
    }

    pub(crate) fn range(&self) -> Range<Ratio> {
        *self.range.lock()
    }

    pub(crate) fn set_range(&self, r: Range<Ratio>) {
        assert!(r.is_unit_subrange(), "subtask range must lie within [0, 1]");
        *self.range.lock() = r;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn set_done(&self, done: bool) {
        self.done.store(done, Ordering::Release);
    }

    pub(crate) fn record_aux_time(&self, label: &str) {
        self.times
            .lock()
            .aux
            .entry(label.to_string())
            .or_default()
            .push(Instant::now());
    }
}

/// Per-subtask iteration bookkeeping for auto-balanced loops. All fields are
/// read and written under the owning task's balance mutex.
#[derive(Clone, Copy, Debug, Default)]
struct RunInfo {
    active: bool,
    start: i64,
    end: i64,
    current: i64,
}

/// Round signalling for a multi-loop task: the serial thread opens one RMO
/// ticket per `parallel_for` round and a final one when the enclosing basic
/// task finishes.
pub(crate) struct MultiLoopState {
    begin: RmoBarrier,
    finished: AtomicBool,
}

pub(crate) struct Task {
    pub(crate) label: String,
    pub(crate) kind: TaskKind,
    functor: RwLock<Option<Arc<TaskFunctor>>>,
    /// Opened by `set_functor`; subtasks wait here before executing.
    begin: MoBarrier,
    /// Closed to the subtask count each step; every completing subtask
    /// arrives once.
    end: OmBarrier,
    subtasks: RwLock<Vec<Arc<SubTask>>>,
    /// Process thread id -> contiguous task-local id, in assignment order.
    thread_ids: RwLock<HashMap<usize, usize>>,
    reduction: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    /// Threads on which this task executes inside a lambda runner.
    coro_threads: RwLock<HashSet<usize>>,
    /// Labels of tasks a paused subtask may pivot to, in the order given.
    next_tasks: RwLock<Vec<String>>,
    /// Latest checkpoint the task's serial thread has reached this step.
    checkpoint: AtomicI64,
    auto_balance: AtomicBool,
    balance: Mutex<Vec<RunInfo>>,
    high_priority: AtomicBool,
    functor_set_at: Mutex<Option<Instant>>,
    multi: Option<MultiLoopState>,
    /// For a basic task created by `assign_run_multi`: the companion
    /// multi-loop task to finish when the basic functor returns.
    companion: RwLock<Option<Arc<Task>>>,
}

impl Task {
    pub(crate) fn new(label: &str, kind: TaskKind, num_threads: usize) -> Self {
        let multi = match kind {
            TaskKind::MultiLoop => Some(MultiLoopState {
                begin: RmoBarrier::new(num_threads.saturating_sub(1)),
                finished: AtomicBool::new(false),
            }),
            _ => None,
        };
        Self {
            label: label.to_string(),
            kind,
            functor: RwLock::new(None),
            begin: MoBarrier::new(),
            end: OmBarrier::new(),
            subtasks: RwLock::new(Vec::new()),
            thread_ids: RwLock::new(HashMap::new()),
            reduction: RwLock::new(None),
            coro_threads: RwLock::new(HashSet::new()),
            next_tasks: RwLock::new(Vec::new()),
            checkpoint: AtomicI64::new(0),
            auto_balance: AtomicBool::new(false),
            balance: Mutex::new(Vec::new()),
            high_priority: AtomicBool::new(false),
            functor_set_at: Mutex::new(None),
            multi,
            companion: RwLock::new(None),
        }
    }

    pub(crate) fn push_subtask(self: &Arc<Self>, task_id: usize, thread_id: usize, range: Range<Ratio>) -> Arc<SubTask> {
        if self.kind == TaskKind::Basic {
            assert!(
                self.subtasks.read().is_empty(),
                "basic task '{}' can only be assigned to one thread",
                self.label
            );
        }
        let sub = Arc::new(SubTask::new(task_id, thread_id, range));
        self.subtasks.write().push(Arc::clone(&sub));
        let mut ids = self.thread_ids.write();
        let next = ids.len();
        ids.entry(thread_id).or_insert(next);
        sub
    }

    pub(crate) fn clear_subtasks(&self) {
        self.subtasks.write().clear();
        self.thread_ids.write().clear();
    }

    pub(crate) fn subtasks(&self) -> Vec<Arc<SubTask>> {
        self.subtasks.read().clone()
    }

    pub(crate) fn num_subtasks(&self) -> usize {
        self.subtasks.read().len()
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.thread_ids.read().len()
    }

    /// Task-local id for the given process thread id, or `None` if the
    /// thread has no subtask of this task.
    pub(crate) fn thread_local_id(&self, thread_id: usize) -> Option<usize> {
        self.thread_ids.read().get(&thread_id).copied()
    }

    /// Whether the given thread is the task's serial thread (first assigned).
    pub(crate) fn is_serial_thread(&self, thread_id: usize) -> bool {
        self.thread_local_id(thread_id) == Some(0)
    }

    pub(crate) fn set_coroutine(&self, threads: &[usize], next_labels: &[&str]) {
        let mut coro = self.coro_threads.write();
        coro.clear();
        coro.extend(threads.iter().copied());
        let mut next = self.next_tasks.write();
        next.clear();
        for label in next_labels {
            if !next.iter().any(|l| l == label) {
                next.push((*label).to_string());
            }
        }
    }

    pub(crate) fn is_coroutine_on(&self, thread_id: usize) -> bool {
        self.coro_threads.read().contains(&thread_id)
    }

    pub(crate) fn next_tasks(&self) -> Vec<String> {
        self.next_tasks.read().clone()
    }

    pub(crate) fn set_auto_balance(&self) {
        assert!(
            self.kind != TaskKind::Basic,
            "auto-balancing only applies to loop tasks"
        );
        self.auto_balance.store(true, Ordering::Release);
    }

    pub(crate) fn set_high_priority(&self) {
        self.high_priority.store(true, Ordering::Release);
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.high_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_companion(&self, companion: Arc<Task>) {
        *self.companion.write() = Some(companion);
    }

    pub(crate) fn set_reduction(&self, reduction: Option<Arc<dyn Any + Send + Sync>>) {
        *self.reduction.write() = reduction;
    }

    pub(crate) fn reduction(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.reduction.read().clone()
    }

    /// Reset the task for a new step: drop the functor, rearm both barriers,
    /// zero the checkpoint and wipe per-subtask state.
    pub(crate) fn restart(&self) {
        *self.functor.write() = None;
        *self.functor_set_at.lock() = None;
        self.begin.close();
        match self.kind {
            // Rounds close the end barrier themselves; a step with zero
            // rounds must still release the schedule's end-of-step wait.
            TaskKind::MultiLoop => self.end.close(0),
            _ => self.end.close(self.num_subtasks()),
        }
        self.checkpoint.store(0, Ordering::Release);
        if let Some(multi) = &self.multi {
            multi.finished.store(false, Ordering::Release);
        }
        let subtasks = self.subtasks.read();
        for sub in subtasks.iter() {
            sub.set_done(false);
            sub.pause_threshold.store(0, Ordering::Release);
            sub.times.lock().clear();
        }
        *self.balance.lock() = vec![RunInfo::default(); subtasks.len()];
    }

    /// Publish the step's functor and release the begin barrier. Called by
    /// the schedule on the orchestrating thread only.
    pub(crate) fn set_functor(&self, functor: TaskFunctor) {
        *self.functor.write() = Some(Arc::new(functor));
        *self.functor_set_at.lock() = Some(Instant::now());
        self.begin.open();
    }

    /// Replace the functor for a multi-loop round without touching barriers.
    pub(crate) fn set_round_functor(&self, functor: TaskFunctor) {
        *self.functor.write() = Some(Arc::new(functor));
        *self.functor_set_at.lock() = Some(Instant::now());
    }

    pub(crate) fn take_functor(&self) {
        *self.functor.write() = None;
    }

    pub(crate) fn is_ready(&self) -> bool {
        match self.kind {
            TaskKind::MultiLoop => self.functor.read().is_some(),
            _ => self.begin.is_open(),
        }
    }

    pub(crate) fn functor_set_at(&self) -> Option<Instant> {
        *self.functor_set_at.lock()
    }

    pub(crate) fn checkpoint(&self) -> i64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    pub(crate) fn checkpoint_cell(&self) -> &AtomicI64 {
        &self.checkpoint
    }

    /// Advance the monotone checkpoint. Called from the task's serial thread.
    pub(crate) fn set_checkpoint(&self, value: i64) {
        self.checkpoint.fetch_max(value, Ordering::AcqRel);
    }

    /// Arm the end barrier for one multi-loop round.
    pub(crate) fn close_round(&self) {
        self.end.close(self.num_subtasks());
    }

    /// Release one multi-loop round to the waiting participants.
    pub(crate) fn open_round(&self) {
        self.multi
            .as_ref()
            .expect("open_round on a non-multi-loop task")
            .begin
            .open();
    }

    /// Signal a multi-loop task that no further rounds will come this step.
    pub(crate) fn finish_rounds(&self) {
        if let Some(multi) = &self.multi {
            multi.finished.store(true, Ordering::Release);
            multi.begin.open();
        }
    }

    /// Caller-side wait for all subtasks of this task (or of the current
    /// round, for multi-loop tasks).
    pub(crate) fn wait(&self) {
        self.end.wait();
    }

    /// Execute one slice of this task on the calling thread: wait for the
    /// functor, run it, and arrive at the end barrier.
    pub(crate) fn run_slice(&self, sub: &SubTask, slice: WorkSlice) {
        {
            let mut times = sub.times.lock();
            if times.wait_start.is_none() {
                times.wait_start = Some(Instant::now());
            }
        }
        self.begin.wait();
        sub.times.lock().run_starts.push(Instant::now());
        self.execute_functor(sub, slice);
        sub.times.lock().run_ends.push(Instant::now());
        self.end.mark_arrival();
    }

    fn execute_functor(&self, sub: &SubTask, slice: WorkSlice) {
        let functor = self
            .functor
            .read()
            .clone()
            .expect("functor executed before it was set");
        match &*functor {
            TaskFunctor::Basic(cell) => {
                let f = cell
                    .lock()
                    .take()
                    .expect("basic functor executed more than once");
                f();
                let companion = self.companion.read().clone();
                if let Some(companion) = companion {
                    companion.finish_rounds();
                }
            }
            TaskFunctor::Loop { body, range } => {
                let iters = match slice {
                    WorkSlice::Fraction(r) => range.subset(r),
                    WorkSlice::Iters(r) => r,
                };
                if self.auto_balance.load(Ordering::Acquire) {
                    let slot = self.subtask_slot(sub);
                    self.run_balanced(slot, iters, body);
                } else {
                    for i in iters.iter() {
                        body(i);
                    }
                }
            }
        }
    }

    fn subtask_slot(&self, sub: &SubTask) -> usize {
        self.subtasks
            .read()
            .iter()
            .position(|s| std::ptr::eq(s.as_ref(), sub))
            .expect("subtask does not belong to this task")
    }

    /// Iterate a balanced loop, claiming one iteration at a time under the
    /// balance mutex so concurrent range splits stay exact.
    fn run_balanced(&self, slot: usize, iters: Range<i64>, body: &(dyn Fn(i64) + Send + Sync)) {
        {
            let mut balance = self.balance.lock();
            balance[slot] = RunInfo {
                active: true,
                start: iters.start,
                end: iters.end,
                current: iters.start,
            };
        }
        loop {
            let claimed = {
                let mut balance = self.balance.lock();
                let info = &mut balance[slot];
                if info.current < info.end {
                    let i = info.current;
                    info.current += 1;
                    Some(i)
                } else {
                    info.active = false;
                    None
                }
            };
            match claimed {
                Some(i) => body(i),
                None => break,
            }
        }
    }

    /// Take roughly half of the remaining iterations of the most loaded
    /// running subtask. Registers one extra end-barrier arrival for the
    /// stolen slice so the waiting thread accounts for it.
    pub(crate) fn steal_work(&self, thief: &SubTask) -> Option<Range<i64>> {
        if !self.auto_balance.load(Ordering::Acquire) {
            return None;
        }
        let thief_slot = self.subtask_slot(thief);
        let mut balance = self.balance.lock();
        let mut victim: Option<(usize, i64)> = None;
        for (slot, info) in balance.iter().enumerate() {
            if slot == thief_slot || !info.active {
                continue;
            }
            let remaining = info.end - info.current;
            if remaining > 1 && victim.map_or(true, |(_, r)| remaining > r) {
                victim = Some((slot, remaining));
            }
        }
        let (slot, remaining) = victim?;
        let info = &mut balance[slot];
        let mid = info.end - remaining / 2;
        let stolen = Range::new(mid, info.end);
        info.end = mid;
        self.end.add_thread();
        debug!(
            task = %self.label,
            donor = slot,
            donor_left = info.end - info.start,
            thief = thief_slot,
            stolen = stolen.len(),
            "stole loop iterations"
        );
        Some(stolen)
    }

    /// Run the subtask's own slice, then keep stealing leftovers from
    /// slower siblings until the loop has no splittable work left.
    pub(crate) fn run_subtask_to_completion(&self, sub: &SubTask) {
        self.run_slice(sub, WorkSlice::Fraction(sub.range()));
        while let Some(extra) = self.steal_work(sub) {
            trace!(task = %self.label, "running stolen range");
            self.run_slice(sub, WorkSlice::Iters(extra));
        }
    }

    /// The serial thread's own slice of a multi-loop round. The serial
    /// thread published the round functor itself, so there is nothing to
    /// wait on before executing.
    pub(crate) fn run_round_slice(&self, sub: &SubTask) {
        self.execute_functor(sub, WorkSlice::Fraction(sub.range()));
        self.end.mark_arrival();
    }

    /// Participant loop for a multi-loop task: run every round the serial
    /// thread opens until the enclosing basic task signals completion.
    pub(crate) fn run_rounds(&self, sub: &SubTask, worker_id: usize) {
        let multi = self
            .multi
            .as_ref()
            .expect("run_rounds on a non-multi-loop task");
        {
            let mut times = sub.times.lock();
            if times.wait_start.is_none() {
                times.wait_start = Some(Instant::now());
            }
        }
        loop {
            multi.begin.wait(worker_id);
            if multi.finished.load(Ordering::Acquire) {
                return;
            }
            sub.times.lock().run_starts.push(Instant::now());
            self.execute_functor(sub, WorkSlice::Fraction(sub.range()));
            sub.times.lock().run_ends.push(Instant::now());
            self.end.mark_arrival();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_task(label: &str, threads: usize) -> Arc<Task> {
        let task = Arc::new(Task::new(label, TaskKind::Loop, threads));
        for tid in 0..threads {
            task.push_subtask(0, tid, Range::unit_slice(tid, threads));
        }
        task
    }

    #[test]
    fn thread_ids_are_contiguous_by_insertion() {
        let task = Arc::new(Task::new("t", TaskKind::Loop, 4));
        task.push_subtask(0, 3, Range::unit_slice(0, 3));
        task.push_subtask(0, 1, Range::unit_slice(1, 3));
        task.push_subtask(0, 3, Range::unit_slice(2, 3));
        assert_eq!(task.thread_local_id(3), Some(0));
        assert_eq!(task.thread_local_id(1), Some(1));
        assert_eq!(task.thread_local_id(0), None);
        assert_eq!(task.num_threads(), 2);
        assert_eq!(task.num_subtasks(), 3);
        assert!(task.is_serial_thread(3));
    }

    #[test]
    fn restart_resets_step_state() {
        let task = loop_task("t", 2);
        task.restart();
        task.set_functor(TaskFunctor::noop_loop());
        assert!(task.is_ready());
        task.set_checkpoint(5);
        let subtasks = task.subtasks();
        subtasks[0].set_done(true);
        task.restart();
        assert!(!task.is_ready());
        assert_eq!(task.checkpoint(), 0);
        assert!(!subtasks[0].is_done());
    }

    #[test]
    fn checkpoint_is_monotone() {
        let task = loop_task("t", 1);
        task.set_checkpoint(3);
        task.set_checkpoint(1);
        assert_eq!(task.checkpoint(), 3);
    }

    #[test]
    fn balanced_claiming_covers_all_iterations_once() {
        use std::sync::atomic::AtomicUsize;

        let task = loop_task("t", 2);
        task.set_auto_balance();
        task.restart();
        let hits: Arc<Vec<AtomicUsize>> =
            Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect());
        let h = Arc::clone(&hits);
        task.set_functor(TaskFunctor::Loop {
            body: Box::new(move |i| {
                h[i as usize].fetch_add(1, Ordering::SeqCst);
            }),
            range: Range::new(0, 100),
        });

        let subtasks = task.subtasks();
        std::thread::scope(|scope| {
            for sub in &subtasks {
                let task = &task;
                scope.spawn(move || task.run_subtask_to_completion(sub));
            }
        });
        task.wait();
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn steal_takes_from_most_loaded_donor() {
        let task = loop_task("t", 3);
        task.set_auto_balance();
        task.restart();
        {
            let mut balance = task.balance.lock();
            balance[0] = RunInfo {
                active: true,
                start: 0,
                end: 10,
                current: 8,
            };
            balance[1] = RunInfo {
                active: true,
                start: 10,
                end: 100,
                current: 20,
            };
        }
        let subtasks = task.subtasks();
        let stolen = task.steal_work(&subtasks[2]).unwrap();
        assert_eq!(stolen, Range::new(60, 100));
        let balance = task.balance.lock();
        assert_eq!(balance[1].end, 60);
        // Iteration count is conserved across the split.
        assert_eq!(balance[1].end - balance[1].current + stolen.len(), 80);
    }
}
