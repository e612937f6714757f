use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use sts_rs::{Range, Ratio, Schedule};

// The scheduler is process-wide; serialize tests within this binary.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn with_scheduler(num_threads: usize, f: impl FnOnce()) {
    let _guard = TEST_LOCK.lock();
    sts_rs::startup(num_threads).unwrap();
    f();
    sts_rs::shutdown();
}

#[test]
fn balanced_split_runs_every_unit_exactly_once() {
    with_scheduler(3, || {
        let sched = Schedule::new();
        sched.assign_run("TASK_F", 1);
        sched.assign_run("TASK_G", 2);

        sched.assign_loop("TASK_F_0", 1, Range::new(Ratio::ZERO, Ratio::new(4, 6)));
        sched.assign_loop("TASK_G_0", 2, Range::new(Ratio::ZERO, Ratio::new(3, 6)));
        sched.assign_loop("TASK_G_1", 2, Range::new(Ratio::ZERO, Ratio::new(3, 6)));
        sched.assign_loop("TASK_G_0", 0, Range::new(Ratio::new(3, 6), Ratio::ONE));
        sched.assign_loop("TASK_F_0", 0, Range::new(Ratio::new(4, 6), Ratio::ONE));
        sched.assign_loop("TASK_G_1", 0, Range::new(Ratio::new(3, 6), Ratio::ONE));

        let f0: Vec<AtomicUsize> = (0..6).map(|_| AtomicUsize::new(0)).collect();
        let g0: Vec<AtomicUsize> = (0..6).map(|_| AtomicUsize::new(0)).collect();
        let g1: Vec<AtomicUsize> = (0..6).map(|_| AtomicUsize::new(0)).collect();

        const STEPS: usize = 2;
        for _ in 0..STEPS {
            sched.next_step();
            sched.run("TASK_F", {
                let sf = std::sync::Arc::clone(&sched);
                let f0 = &f0;
                move || {
                    sf.parallel_for("TASK_F_0", 0, 6, |i| {
                        f0[i as usize].fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
            sched.run("TASK_G", {
                let sg = std::sync::Arc::clone(&sched);
                let g0 = &g0;
                let g1 = &g1;
                move || {
                    sg.parallel_for("TASK_G_0", 0, 6, |i| {
                        g0[i as usize].fetch_add(1, Ordering::Relaxed);
                    });
                    sg.parallel_for("TASK_G_1", 0, 6, |i| {
                        g1[i as usize].fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
            sched.wait();
        }

        for counters in [&f0, &g0, &g1] {
            for (i, c) in counters.iter().enumerate() {
                assert_eq!(c.load(Ordering::Relaxed), STEPS, "index {i} miscounted");
            }
        }
    });
}

#[test]
fn reduction_accumulates_across_steps() {
    with_scheduler(4, || {
        let sched = Schedule::new();
        sched.assign_run("TASK_F", 0);
        sched.assign_loop_even("TASK_F_0", &[0, 1, 2, 3]);

        let reduction = sched.create_task_reduction("TASK_F_0", 0i64);
        for _ in 0..2 {
            sched.next_step();
            sched.run("TASK_F", {
                let s = std::sync::Arc::clone(&sched);
                let reduction = &reduction;
                move || {
                    let collector = std::sync::Arc::clone(&s);
                    s.parallel_for_reduce(
                        "TASK_F_0",
                        0,
                        10,
                        move |_| collector.collect(1i64),
                        reduction,
                    );
                }
            });
            sched.wait();
        }
        assert_eq!(reduction.get_result(), 20);
    });
}

#[test]
fn multi_loop_rounds_share_one_task() {
    with_scheduler(3, || {
        let sched = Schedule::new();
        sched.assign_run_multi("TASK_F", 0, &[0, 1, 2]);

        let reduction = sched.create_task_reduction("TASK_F_multiloop", 0i64);
        sched.next_step();
        sched.run("TASK_F", {
            let s = std::sync::Arc::clone(&sched);
            let reduction = &reduction;
            move || {
                for _round in 0..3 {
                    let collector = std::sync::Arc::clone(&s);
                    s.parallel_for_reduce(
                        "TASK_F_multiloop",
                        0,
                        30,
                        move |_| collector.collect(1i64),
                        reduction,
                    );
                }
            }
        });
        sched.wait();
        assert_eq!(reduction.get_result(), 90);
    });
}

#[test]
fn multi_loop_with_zero_rounds_completes() {
    with_scheduler(3, || {
        let sched = Schedule::new();
        sched.assign_run_multi("TASK_F", 0, &[0, 1, 2]);
        sched.next_step();
        sched.run("TASK_F", || {});
        sched.wait();
    });
}

#[test]
fn skip_keeps_barrier_contracts() {
    with_scheduler(2, || {
        let sched = Schedule::new();
        sched.assign_run("A", 1);
        sched.assign_loop_even("A_0", &[0, 1]);

        sched.next_step();
        sched.skip_run("A");
        sched.skip_loop("A_0");
        sched.wait();

        // The schedule stays reusable after a skipped step.
        let ran = AtomicBool::new(false);
        sched.next_step();
        sched.run("A", || ran.store(true, Ordering::Relaxed));
        sched.skip_loop("A_0");
        sched.wait();
        assert!(ran.load(Ordering::Relaxed));
    });
}

#[test]
fn empty_parallel_for_releases_barriers() {
    with_scheduler(2, || {
        let sched = Schedule::new();
        sched.assign_run("A", 0);
        sched.assign_loop_even("A_0", &[0, 1]);

        let hits = AtomicUsize::new(0);
        sched.next_step();
        sched.run("A", {
            let s = std::sync::Arc::clone(&sched);
            let hits = &hits;
            move || {
                s.parallel_for("A_0", 5, 5, |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        sched.wait();
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    });
}

#[test]
fn schedule_with_no_assignments_completes_wait() {
    with_scheduler(3, || {
        let sched = Schedule::new();
        sched.next_step();
        sched.wait();
        sched.next_step();
        sched.wait();
    });
}

#[test]
fn run_on_unassigned_label_executes_synchronously() {
    with_scheduler(2, || {
        let sched = Schedule::new();
        sched.assign_run("A", 1);
        let ran = AtomicBool::new(false);
        sched.next_step();
        sched.run("NOT_ASSIGNED", || ran.store(true, Ordering::Relaxed));
        assert!(ran.load(Ordering::Relaxed));
        sched.run("A", || {});
        sched.wait();
    });
}

#[test]
fn named_schedules_are_retrievable() {
    with_scheduler(2, || {
        let sched = Schedule::named("compute");
        sched.assign_run("A", 0);
        assert_eq!(Schedule::instance("compute").name(), Some("compute"));
        // Unknown names fall back to the default schedule.
        assert!(Schedule::instance("nope").name().is_none());

        let sched = Schedule::instance("compute");
        let ran = AtomicBool::new(false);
        sched.next_step();
        sched.run("A", || ran.store(true, Ordering::Relaxed));
        sched.wait();
        assert!(ran.load(Ordering::Relaxed));
    });
}

#[test]
fn set_task_ranges_reslices_a_loop() {
    with_scheduler(2, || {
        let sched = Schedule::new();
        sched.assign_run("A", 0);
        sched.assign_loop_even("A_0", &[0, 1]);
        // Thread 0 takes 3/4 of the loop instead of half.
        sched.set_task_ranges("A_0", &[Ratio::ZERO, Ratio::new(3, 4), Ratio::ONE]);
        assert_eq!(sched.task_num_threads_of("A_0"), 2);

        let counters: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();
        sched.next_step();
        sched.run("A", {
            let s = std::sync::Arc::clone(&sched);
            let counters = &counters;
            move || {
                s.parallel_for("A_0", 0, 8, |i| {
                    counters[i as usize].fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        sched.wait();
        assert!(counters.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    });
}

#[test]
fn high_priority_task_preempts_via_yield() {
    with_scheduler(4, || {
        let sched = Schedule::new();
        sched.assign_run("TASK_F", 1);
        sched.assign_loop_even("TASK_F_0", &[1, 3]);
        sched.assign_run("TASK_G", 2);
        sched.assign_loop_even("TASK_G_0", &[2, 0]);
        sched.assign_run("COMM", 3);
        sched.set_high_priority("COMM");

        let comm_waiting = AtomicBool::new(false);
        let comm_done = AtomicBool::new(false);
        let f_hits = AtomicUsize::new(0);
        let g_hits = AtomicUsize::new(0);
        const N: i64 = 4000;

        sched.next_step();
        sched.run("COMM", {
            let comm_done = &comm_done;
            move || comm_done.store(true, Ordering::SeqCst)
        });
        sched.run("TASK_F", {
            let s = std::sync::Arc::clone(&sched);
            let comm_waiting = &comm_waiting;
            let comm_done = &comm_done;
            let f_hits = &f_hits;
            move || {
                let body_sched = std::sync::Arc::clone(&s);
                s.parallel_for("TASK_F_0", 0, N, move |_| {
                    f_hits.fetch_add(1, Ordering::Relaxed);
                    // Worker 3 carries the high-priority COMM subtask; when
                    // the flag is up it must run COMM before continuing.
                    if comm_waiting.load(Ordering::SeqCst)
                        && !comm_done.load(Ordering::SeqCst)
                        && body_sched.task_thread_id() == Some(1)
                    {
                        body_sched.yield_now();
                        assert!(comm_done.load(Ordering::SeqCst));
                    }
                });
            }
        });
        sched.run("TASK_G", {
            let s = std::sync::Arc::clone(&sched);
            let comm_waiting = &comm_waiting;
            let g_hits = &g_hits;
            move || {
                s.parallel_for("TASK_G_0", 0, N, move |i| {
                    g_hits.fetch_add(1, Ordering::Relaxed);
                    if i == N / 4 {
                        comm_waiting.store(true, Ordering::SeqCst);
                    }
                });
            }
        });
        sched.wait();

        assert!(comm_done.load(Ordering::SeqCst));
        assert_eq!(f_hits.load(Ordering::Relaxed), N as usize);
        assert_eq!(g_hits.load(Ordering::Relaxed), N as usize);
    });
}

#[test]
fn wait_for_task_blocks_on_one_task() {
    with_scheduler(2, || {
        let sched = Schedule::new();
        sched.assign_run("A", 1);
        let ran = AtomicBool::new(false);
        sched.next_step();
        sched.run("A", {
            let ran = &ran;
            move || ran.store(true, Ordering::SeqCst)
        });
        sched.wait_for_task("A");
        assert!(ran.load(Ordering::SeqCst));
        assert!(sched.functor_set_at("A").is_some());
        sched.wait();
    });
}
