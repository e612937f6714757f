use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use sts_rs::Schedule;

/// Dispatch overhead of the default schedule: every loop pays one internal
/// step (counter bump + begin/end barriers) on top of the iteration work.
fn bench_default_parallel_for(c: &mut Criterion) {
    sts_rs::startup(4).unwrap();
    let sched = Schedule::instance("default");

    c.bench_function("default_parallel_for_1k", |b| {
        b.iter(|| {
            sched.parallel_for("loop", 0, 1000, |i| {
                black_box(i);
            });
        })
    });

    sts_rs::shutdown();
}

/// Full step cost of a precomputed user schedule: next_step, functor
/// publication, loop execution over four workers, wait.
fn bench_static_schedule_step(c: &mut Criterion) {
    sts_rs::startup(4).unwrap();
    let sched = Schedule::new();
    sched.assign_run("TASK_F", 0);
    sched.assign_loop_even("TASK_F_0", &[0, 1, 2, 3]);

    c.bench_function("static_schedule_step_1k", |b| {
        b.iter(|| {
            sched.next_step();
            sched.run("TASK_F", {
                let s = Arc::clone(&sched);
                move || {
                    s.parallel_for("TASK_F_0", 0, 1000, |i| {
                        black_box(i);
                    });
                }
            });
            sched.wait();
        })
    });

    sts_rs::shutdown();
}

criterion_group!(benches, bench_default_parallel_for, bench_static_schedule_step);
criterion_main!(benches);
