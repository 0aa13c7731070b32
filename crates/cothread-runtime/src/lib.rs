//! # cothread-runtime
//!
//! Cooperative scheduler runtime.
//!
//! This crate provides:
//! - Thread groups, each driven by one driver OS thread that owns the
//!   group's ready queue and its descriptor/timer poll loop
//! - Cooperative threads (one backing OS thread each, at most one running
//!   per group at any instant) and stackless FSMs
//! - Wait registration (`fd_wait`, `timer_wait`, primitive `wait()`s)
//!   consumed by a single `suspend()`
//! - Synchronization primitives built on that contract
//! - A native-migration bridge for blocking system calls
//!
//! ```text
//!   task ── fd_wait / timer_wait / sema.wait ──► WaitSet (per task)
//!     │
//!     └── suspend() ── hands the group baton back ──► driver
//!                                                    │
//!        ready queue ◄── fire(epoch) ◄── poll(2) ◄───┘
//! ```

pub mod config;
mod tls;
mod task;
mod notifier;
mod poller;
mod group;
mod runtime;
pub mod scheduler;
pub mod fsm;
pub mod sync;
pub mod native;
pub mod io;
mod join;

// Re-exports
pub use config::RuntimeConfig;
pub use group::Group;
pub use runtime::Runtime;
pub use task::Outcome;
pub use join::JoinHandle;
pub use fsm::{AutoFsm, Fsm};
pub use scheduler::{
    fd_block, fd_closed, fd_read_wait, fd_wait, fd_write_wait, immediate_wake, migrate, poll,
    sleep, sleep_until, suspend, timer_wait, yield_now, Interest,
};
pub use sync::{Barrier, Completion, Cond, Mutex, RwLock, Semaphore};
pub use tls::{
    critical_depth, enter_critical_section, exit_critical_section, might_yield, CriticalSection,
};
pub use native::NativeSection;
