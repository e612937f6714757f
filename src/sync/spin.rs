//! Spin-wait helpers over atomic cells.
//!
//! All loads are acquire so that whatever the releasing thread published
//! before the store is visible once the wait returns. Workers are assumed to
//! be placed carefully (no heavy oversubscription), so short busy spins with
//! a bounded backoff beat parking on a condvar.

use crate::util::Backoff;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Spin until `cell` equals `v`.
pub(crate) fn wait_until(cell: &AtomicBool, v: bool) {
    let mut backoff = Backoff::new();
    while cell.load(Ordering::Acquire) != v {
        backoff.spin();
    }
}

/// Spin until `cell` equals `v`.
pub(crate) fn wait_until_i64(cell: &AtomicI64, v: i64) {
    let mut backoff = Backoff::new();
    while cell.load(Ordering::Acquire) != v {
        backoff.spin();
    }
}

/// Spin while `cell` equals `v`, returning the first differing value.
pub(crate) fn wait_until_not(cell: &AtomicI64, v: i64) -> i64 {
    let mut backoff = Backoff::new();
    loop {
        let observed = cell.load(Ordering::Acquire);
        if observed != v {
            return observed;
        }
        backoff.spin();
    }
}

/// Spin until `cell >= v`.
pub(crate) fn wait_until_ge(cell: &AtomicI64, v: i64) {
    let mut backoff = Backoff::new();
    while cell.load(Ordering::Acquire) < v {
        backoff.spin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_until_sees_release() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let t = thread::spawn(move || {
            flag2.store(true, Ordering::Release);
        });
        wait_until(&flag, true);
        t.join().unwrap();
    }

    #[test]
    fn wait_until_not_returns_new_value() {
        let cell = Arc::new(AtomicI64::new(3));
        let cell2 = Arc::clone(&cell);
        let t = thread::spawn(move || {
            cell2.store(7, Ordering::Release);
        });
        assert_eq!(wait_until_not(&cell, 3), 7);
        t.join().unwrap();
    }

    #[test]
    fn wait_until_ge_passes_when_reached() {
        let cell = Arc::new(AtomicI64::new(0));
        let cell2 = Arc::clone(&cell);
        let t = thread::spawn(move || {
            for _ in 0..5 {
                cell2.fetch_add(1, Ordering::Release);
            }
        });
        wait_until_ge(&cell, 5);
        assert!(cell.load(Ordering::Acquire) >= 5);
        t.join().unwrap();
    }
}
