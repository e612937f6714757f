//! A per-worker pool of idle lambda runners.
//!
//! Runner creation costs a thread spawn, so finished runners are parked per
//! worker slot and handed back out on the next checkout. Runners are pinned
//! to their slot's core when worker pinning is on, which is why a runner can
//! only be returned to the slot it was created for.

use super::LambdaRunner;
use crate::error::Result;
use parking_lot::Mutex;
use tracing::debug;

pub(crate) struct RunnerPool {
    slots: Vec<Mutex<Vec<LambdaRunner>>>,
    cores: Vec<Option<core_affinity::CoreId>>,
    stack_size: Option<usize>,
    /// When false the application guarantees per-slot exclusivity; checkout
    /// contention then indicates a scheduling bug and is asserted.
    shared_cores: bool,
}

impl RunnerPool {
    pub(crate) fn new(
        num_slots: usize,
        cores: Vec<Option<core_affinity::CoreId>>,
        stack_size: Option<usize>,
        shared_cores: bool,
    ) -> Self {
        debug_assert_eq!(cores.len(), num_slots);
        Self {
            slots: (0..num_slots).map(|_| Mutex::new(Vec::new())).collect(),
            cores,
            stack_size,
            shared_cores,
        }
    }

    fn slot_lock(&self, slot: usize) -> parking_lot::MutexGuard<'_, Vec<LambdaRunner>> {
        if self.shared_cores {
            self.slots[slot].lock()
        } else {
            self.slots[slot]
                .try_lock()
                .expect("runner pool slot contended despite shared_cores = false")
        }
    }

    /// Check out an idle runner for the given worker slot, spawning one if
    /// the slot is empty.
    pub(crate) fn get(&self, slot: usize) -> Result<LambdaRunner> {
        if let Some(runner) = self.slot_lock(slot).pop() {
            return Ok(runner);
        }
        debug!(slot, "runner pool empty, spawning");
        LambdaRunner::spawn(slot, self.cores[slot], self.stack_size)
    }

    /// Return a finished runner to its slot.
    pub(crate) fn release(&self, runner: LambdaRunner) {
        assert!(runner.is_finished(), "released a runner mid-closure");
        let slot = runner.slot();
        self.slot_lock(slot).push(runner);
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, slot: usize) -> usize {
        self.slots[slot].lock().len()
    }
}
