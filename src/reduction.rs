//! Per-task reductions.
//!
//! A reduction gives every thread participating in a loop its own slot;
//! bodies add into their slot through [`Schedule::collect`] and the thread
//! that issued the loop folds the slots into the result once the loop's end
//! barrier has released. Slot access is thread-safe because each thread owns
//! a distinct slot index for the lifetime of the task.
//!
//! [`Schedule::collect`]: crate::schedule::Schedule::collect

use parking_lot::Mutex;
use std::ops::AddAssign;
use std::sync::Arc;

/// A fold over per-thread partial values of type `T`.
///
/// Created with [`Schedule::create_task_reduction`] and passed to
/// [`Schedule::parallel_for_reduce`]. The fold drains the slots back to the
/// init value, so a reduction reused across several loops (or steps)
/// accumulates into the result without double counting.
///
/// [`Schedule::create_task_reduction`]: crate::schedule::Schedule::create_task_reduction
/// [`Schedule::parallel_for_reduce`]: crate::schedule::Schedule::parallel_for_reduce
pub struct TaskReduction<T> {
    inner: Arc<ReductionInner<T>>,
}

impl<T> TaskReduction<T>
where
    T: Clone + AddAssign + Send + 'static,
{
    pub(crate) fn new(init: T, num_threads: usize) -> Self {
        Self {
            inner: Arc::new(ReductionInner {
                slots: (0..num_threads).map(|_| Mutex::new(init.clone())).collect(),
                result: Mutex::new(init.clone()),
                init: Mutex::new(init),
            }),
        }
    }

    pub(crate) fn inner(&self) -> Arc<ReductionInner<T>> {
        Arc::clone(&self.inner)
    }

    /// The folded result. Meaningful once the loop that fed the reduction
    /// has completed.
    pub fn get_result(&self) -> T {
        self.inner.result.lock().clone()
    }
}

impl<T> std::fmt::Debug for TaskReduction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskReduction")
            .field("slots", &self.inner.slots.len())
            .finish()
    }
}

pub(crate) struct ReductionInner<T> {
    init: Mutex<T>,
    slots: Vec<Mutex<T>>,
    result: Mutex<T>,
}

impl<T> ReductionInner<T>
where
    T: Clone + AddAssign + Send + 'static,
{
    pub(crate) fn collect(&self, value: T, pos: usize) {
        *self.slots[pos].lock() += value;
    }

    /// Fold every slot into the result, draining the slots.
    pub(crate) fn reduce(&self) {
        let init = self.init.lock().clone();
        let mut result = self.result.lock();
        for slot in &self.slots {
            let partial = std::mem::replace(&mut *slot.lock(), init.clone());
            *result += partial;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_and_reduce() {
        let red = TaskReduction::new(0i64, 4);
        let inner = red.inner();
        for pos in 0..4 {
            inner.collect(pos as i64 + 1, pos);
        }
        inner.reduce();
        assert_eq!(red.get_result(), 10);
    }

    #[test]
    fn repeated_folds_accumulate_without_double_counting() {
        let red = TaskReduction::new(0i64, 2);
        let inner = red.inner();
        inner.collect(3, 0);
        inner.reduce();
        assert_eq!(red.get_result(), 3);
        inner.collect(4, 1);
        inner.reduce();
        assert_eq!(red.get_result(), 7);
        // Folding with empty slots changes nothing.
        inner.reduce();
        assert_eq!(red.get_result(), 7);
    }
}
