use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use sts_rs::{MmBarrier, OmBarrier, RmoBarrier, Schedule};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn with_scheduler(num_threads: usize, f: impl FnOnce()) {
    let _guard = TEST_LOCK.lock();
    sts_rs::startup(num_threads).unwrap();
    f();
    sts_rs::shutdown();
}

/// Roll call: thread 0 calls on each other thread in turn through a named
/// RMO barrier, with a named OM barrier closing every round.
#[test]
fn rmo_roll_call_releases_threads_in_order() {
    const NTHREADS: usize = 4;
    with_scheduler(NTHREADS, || {
        let rmob = RmoBarrier::named(NTHREADS - 1, "rmob");
        let omb = OmBarrier::named("omb");
        omb.close(NTHREADS - 1);

        let sched = Schedule::new();
        sched.assign_run("CALLER", 0);
        let all: Vec<usize> = (0..NTHREADS).collect();
        sched.assign_loop_even("ROLL_0", &all);

        let order = Mutex::new(Vec::new());

        sched.next_step();
        sched.run("CALLER", {
            let s = Arc::clone(&sched);
            let order = &order;
            move || {
                let body = Arc::clone(&s);
                s.parallel_for("ROLL_0", 0, NTHREADS as i64, move |_| {
                    // Barriers are looked up by name from inside the task.
                    let rmob = RmoBarrier::instance("rmob").unwrap();
                    let omb = OmBarrier::instance("omb").unwrap();
                    let tid = body.task_thread_id().unwrap();
                    for called in 1..NTHREADS {
                        if tid == 0 {
                            rmob.open();
                            omb.wait();
                            omb.close(NTHREADS - 1);
                        } else {
                            rmob.wait(tid);
                            if called == tid {
                                order.lock().push(tid);
                            }
                            omb.mark_arrival();
                        }
                    }
                });
            }
        });
        sched.wait();

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    });
}

/// Scenario: a parallel loop whose body rendezvouses through a reusable MM
/// barrier between a write phase and a read phase. With one contiguous slice
/// per worker, round k synchronizes the k-th iteration of every slice, so
/// each B entry sees its own A entry and the neighbor slice's A entry.
#[test]
fn mm_barrier_synchronizes_loop_phases() {
    const NTHREADS: usize = 10;
    const N: usize = 100;
    with_scheduler(NTHREADS, || {
        let sched = Schedule::new();
        sched.assign_run("TASK_F", 0);
        let all: Vec<usize> = (0..NTHREADS).collect();
        sched.assign_loop_even("TASK_F_0", &all);

        let barrier = MmBarrier::new(NTHREADS);
        let a: Vec<AtomicI64> = (0..N).map(|_| AtomicI64::new(0)).collect();
        let b: Vec<AtomicI64> = (0..N).map(|_| AtomicI64::new(0)).collect();

        sched.next_step();
        sched.run("TASK_F", {
            let s = Arc::clone(&sched);
            let barrier = &barrier;
            let a = &a;
            let b = &b;
            move || {
                s.parallel_for("TASK_F_0", 0, N as i64, move |i| {
                    let i = i as usize;
                    a[i].store(1, Ordering::SeqCst);
                    barrier.enter();
                    b[i].store(
                        a[i].load(Ordering::SeqCst) + a[(i + NTHREADS) % N].load(Ordering::SeqCst),
                        Ordering::SeqCst,
                    );
                });
            }
        });
        sched.wait();

        for (i, slot) in b.iter().enumerate() {
            assert_eq!(slot.load(Ordering::SeqCst), 2, "B[{i}]");
        }
    });
}
