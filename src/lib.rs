//! STS - static task scheduler for latency-critical step loops.
//!
//! A user-space, static, cooperative thread scheduler for HPC kernels that
//! execute the same pattern of work step after step (molecular-dynamics
//! inner loops and the like). The application declares, per schedule,
//! exactly which thread executes which piece of work in which order; during
//! execution the framework only dispatches the precomputed assignments, so
//! there is no dynamic work-queue overhead and pipelining of concurrent
//! tasks is fully under application control.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use sts_rs::Schedule;
//!
//! sts_rs::startup(3).unwrap();
//!
//! let sched = Schedule::named("main");
//! sched.assign_run("TASK_F", 1);
//! sched.assign_loop_even("TASK_F_0", &[1, 0, 2]);
//!
//! let sum = AtomicU64::new(0);
//! for _step in 0..10 {
//!     sched.next_step();
//!     sched.run("TASK_F", || {
//!         let s = Schedule::instance("main");
//!         s.parallel_for("TASK_F_0", 0, 600, |i| {
//!             sum.fetch_add(i as u64, Ordering::Relaxed);
//!         });
//!     });
//!     sched.wait();
//! }
//!
//! sts_rs::shutdown();
//! ```
//!
//! # Model
//!
//! - A **schedule** maps labelled **tasks** to worker threads; loop tasks
//!   carry per-thread fractional **ranges** of the iteration space.
//! - A **step** is one pass through a schedule, bracketed by
//!   [`Schedule::next_step`] and [`Schedule::wait`]. Workers spin on a
//!   global step counter and drain their private subtask queues in
//!   assignment order.
//! - **Coroutine tasks** execute inside dedicated runner threads and may
//!   [`Schedule::pause`], pivoting the worker to a later ready subtask.
//! - **Auto-balancing** splits the remaining iterations of slow loop
//!   subtasks onto idle siblings at runtime.

#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod range;
pub mod reduction;
pub mod schedule;
pub mod sync;

mod runner;
mod runtime;
mod task;
mod util;
mod worker;

pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use range::{Range, Ratio};
pub use reduction::TaskReduction;
pub use runtime::{shutdown, startup, startup_with_config};
pub use schedule::Schedule;
pub use sync::{MmBarrier, MoBarrier, OmBarrier, RmoBarrier};
