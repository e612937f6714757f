//! Custom barrier primitives.
//!
//! Four shapes cover every synchronization point in a schedule:
//!
//! - [`MoBarrier`]: many wait, one releases (a task's begin barrier).
//! - [`OmBarrier`]: many arrive, one waits (a task's end barrier and the
//!   step-completion barrier).
//! - [`RmoBarrier`]: reusable many-to-one with per-id tickets, safe to wait
//!   on inside a loop without resetting between rounds.
//! - [`MmBarrier`]: a reusable rendezvous of exactly `n` threads.
//!
//! Any barrier can be given a name at construction; named barriers register
//! themselves in a per-type process-wide map and deregister on drop, so task
//! bodies can look them up without threading handles through closures.

use crate::sync::spin;
use crate::util::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

struct Registry<T> {
    map: Mutex<HashMap<String, Weak<T>>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, name: &str, value: &Arc<T>) {
        let prev = self
            .map
            .lock()
            .insert(name.to_string(), Arc::downgrade(value));
        assert!(
            prev.map_or(true, |w| w.upgrade().is_none()),
            "barrier name '{name}' already registered"
        );
    }

    fn deregister(&self, name: &str) {
        self.map.lock().remove(name);
    }

    fn get(&self, name: &str) -> Option<Arc<T>> {
        self.map.lock().get(name).and_then(Weak::upgrade)
    }
}

fn mo_registry() -> &'static Registry<MoBarrier> {
    static REGISTRY: OnceLock<Registry<MoBarrier>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn om_registry() -> &'static Registry<OmBarrier> {
    static REGISTRY: OnceLock<Registry<OmBarrier>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn rmo_registry() -> &'static Registry<RmoBarrier> {
    static REGISTRY: OnceLock<Registry<RmoBarrier>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn mm_registry() -> &'static Registry<MmBarrier> {
    static REGISTRY: OnceLock<Registry<MmBarrier>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

/// Many-to-one barrier: any number of threads wait until one thread opens it.
///
/// Starts closed. `close()` rearms it; no reset is needed between steps as
/// long as every `open()` is followed by a `close()` before the next round.
#[derive(Debug)]
pub struct MoBarrier {
    locked: AtomicBool,
    name: Option<String>,
}

impl MoBarrier {
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(true),
            name: None,
        }
    }

    /// Create a named barrier, retrievable through [`MoBarrier::instance`].
    pub fn named(name: &str) -> Arc<Self> {
        let barrier = Arc::new(Self {
            locked: AtomicBool::new(true),
            name: Some(name.to_string()),
        });
        mo_registry().register(name, &barrier);
        barrier
    }

    /// Look up a named barrier. Non-owning: returns a fresh handle.
    pub fn instance(name: &str) -> Option<Arc<Self>> {
        mo_registry().get(name)
    }

    /// Wait until open. Called by the "M" threads.
    pub fn wait(&self) {
        spin::wait_until(&self.locked, false);
    }

    /// Release all waiters. Called by the "O" thread.
    pub fn open(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Rearm the barrier.
    pub fn close(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        !self.locked.load(Ordering::Acquire)
    }
}

impl Default for MoBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MoBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            mo_registry().deregister(name);
        }
    }
}

/// One-to-many barrier: `n` threads arrive, one thread waits for all of them.
#[derive(Debug)]
pub struct OmBarrier {
    remaining: AtomicI64,
    name: Option<String>,
}

impl OmBarrier {
    pub fn new() -> Self {
        Self {
            remaining: AtomicI64::new(0),
            name: None,
        }
    }

    pub fn named(name: &str) -> Arc<Self> {
        let barrier = Arc::new(Self {
            remaining: AtomicI64::new(0),
            name: Some(name.to_string()),
        });
        om_registry().register(name, &barrier);
        barrier
    }

    pub fn instance(name: &str) -> Option<Arc<Self>> {
        om_registry().get(name)
    }

    /// Arm the barrier for `n` arrivals.
    pub fn close(&self, n: usize) {
        self.remaining.store(n as i64, Ordering::Release);
    }

    /// Register one arrival. Called by the "M" threads.
    pub fn mark_arrival(&self) {
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    /// Add one expected arrival after the barrier was closed. Used when a
    /// work-stealing runner joins a loop that is already executing.
    pub fn add_thread(&self) {
        self.remaining.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait for all arrivals. Called by the "O" thread.
    pub fn wait(&self) {
        let mut backoff = Backoff::new();
        while self.remaining.load(Ordering::Acquire) > 0 {
            backoff.spin();
        }
    }
}

impl Default for OmBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OmBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            om_registry().deregister(name);
        }
    }
}

/// Reusable many-to-one barrier with per-id tickets.
///
/// `open()` bumps a global count of openings; `wait(tid)` takes the caller's
/// next ticket and spins until the opening count catches up. Because both
/// sides only ever increment, the barrier can sit inside a loop with no
/// reset between rounds and no round can release a waiter early.
#[derive(Debug)]
pub struct RmoBarrier {
    opens: AtomicI64,
    waits: Vec<CachePadded<AtomicI64>>,
    name: Option<String>,
}

impl RmoBarrier {
    /// `max_thread_id` is the largest id that will ever call `wait`.
    pub fn new(max_thread_id: usize) -> Self {
        Self {
            opens: AtomicI64::new(0),
            waits: (0..=max_thread_id)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
            name: None,
        }
    }

    pub fn named(max_thread_id: usize, name: &str) -> Arc<Self> {
        let mut barrier = Self::new(max_thread_id);
        barrier.name = Some(name.to_string());
        let barrier = Arc::new(barrier);
        rmo_registry().register(name, &barrier);
        barrier
    }

    pub fn instance(name: &str) -> Option<Arc<Self>> {
        rmo_registry().get(name)
    }

    /// Release one round. Called by the "O" thread.
    pub fn open(&self) {
        self.opens.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait for the caller's next round to be opened.
    pub fn wait(&self, tid: usize) {
        let ticket = self.waits[tid].fetch_add(1, Ordering::Relaxed) + 1;
        spin::wait_until_ge(&self.opens, ticket);
    }
}

impl Drop for RmoBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            rmo_registry().deregister(name);
        }
    }
}

/// Reusable rendezvous of exactly `n` threads.
///
/// Each round: everyone waits for the previous round to finish draining,
/// checks in, spins until all `n` have checked in, then checks out; the last
/// thread out rearms the barrier. It is an error for more than `n` threads
/// to enter a round.
#[derive(Debug)]
pub struct MmBarrier {
    n: i64,
    waiting: AtomicI64,
    released: AtomicI64,
    name: Option<String>,
}

impl MmBarrier {
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "MmBarrier needs at least one participant");
        Self {
            n: n as i64,
            waiting: AtomicI64::new(0),
            released: AtomicI64::new(0),
            name: None,
        }
    }

    pub fn named(n: usize, name: &str) -> Arc<Self> {
        let mut barrier = Self::new(n);
        barrier.name = Some(name.to_string());
        let barrier = Arc::new(barrier);
        mm_registry().register(name, &barrier);
        barrier
    }

    pub fn instance(name: &str) -> Option<Arc<Self>> {
        mm_registry().get(name)
    }

    /// Rendezvous with the other `n - 1` participants.
    pub fn enter(&self) {
        // Previous round must fully drain before this one may check in.
        spin::wait_until_i64(&self.released, 0);
        let checked_in = self.waiting.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            checked_in <= self.n,
            "more than {} threads entered MmBarrier round",
            self.n
        );
        spin::wait_until_ge(&self.waiting, self.n);
        let out = self.released.fetch_add(1, Ordering::AcqRel) + 1;
        if out == self.n {
            // Last one out rearms: waiting first, then the gate.
            self.waiting.store(0, Ordering::Relaxed);
            self.released.store(0, Ordering::Release);
        }
    }
}

impl Drop for MmBarrier {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            mm_registry().deregister(name);
        }
    }
}
