//! # cothread - cooperative threads in thread groups
//!
//! Many logical threads and stackless state machines multiplexed onto a
//! few scheduling domains, with an escape hatch to native OS threads for
//! calls that can only block.
//!
//! ## Features
//!
//! - **Thread groups**: at most one task of a group runs at any instant;
//!   groups run in parallel with each other
//! - **Cooperative threads**: suspend mid-function, join with a result
//! - **FSMs**: stackless tasks re-run from the top on every wake
//! - **One wait, many events**: descriptor, timer and primitive waits are
//!   registered first and consumed by a single `suspend()`
//! - **Primitives**: Mutex, RwLock, Semaphore, Cond, Barrier, Completion
//! - **Native migration**: `NativeSection` moves a thread off its group
//!   around a blocking system call
//!
//! ## Quick Start
//!
//! ```ignore
//! use cothread::{Runtime, RuntimeConfig, Semaphore};
//! use std::sync::Arc;
//!
//! fn main() -> cothread::SchedResult<()> {
//!     cothread::init_logging();
//!     let rt = Runtime::new(RuntimeConfig::from_env())?;
//!     let group = rt.default_group();
//!
//!     let sema = Arc::new(Semaphore::new(0));
//!     let s = Arc::clone(&sema);
//!     let waiter = group.spawn(move |_| {
//!         s.down();
//!         "woken"
//!     })?;
//!
//!     sema.up();
//!     assert_eq!(waiter.join(), "woken");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │     spawn(), spawn_fsm(), suspend(), yield_now(), lock()    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Runtime                               │
//! │             owns groups, one driver per group               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Group A  │      │  Group B  │      │  native   │
//!    │  driver   │      │  driver   │      │  threads  │
//!    └───────────┘      └───────────┘      └───────────┘
//!      ready queue + poll(2) over blocked tasks' fds and deadlines
//! ```

use std::sync::Once;

use tracing_subscriber::EnvFilter;

// Re-export core types
pub use cothread_core::{
    CancellationToken,
    GroupId,
    SchedError,
    SchedResult,
    TaskId,
    TaskKind,
    TaskState,
};

// Re-export env utilities
pub use cothread_core::{env_get, env_get_bool, env_get_ms, env_get_str};

// Re-export runtime types
pub use cothread_runtime::{
    AutoFsm,
    Barrier,
    Completion,
    Cond,
    CriticalSection,
    Fsm,
    Group,
    Interest,
    JoinHandle,
    Mutex,
    NativeSection,
    Outcome,
    Runtime,
    RuntimeConfig,
    RwLock,
    Semaphore,
};

// Re-export scheduler entry points
pub use cothread_runtime::{
    critical_depth,
    enter_critical_section,
    exit_critical_section,
    fd_block,
    fd_closed,
    fd_read_wait,
    fd_wait,
    fd_write_wait,
    immediate_wake,
    migrate,
    might_yield,
    poll,
    sleep,
    sleep_until,
    suspend,
    timer_wait,
    yield_now,
};

pub use cothread_runtime::{fsm, io, native, sync};

/// Install a `tracing` fmt subscriber filtered by `COT_LOG`
///
/// `COT_LOG` takes `EnvFilter` syntax (`info`, `cothread_net=debug,...`)
/// and defaults to `info`. Only the first call installs anything; it also
/// does nothing if the application already set a global subscriber.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let directives = env_get_str("COT_LOG", "info");
        let (filter, rejected) = match EnvFilter::try_new(&directives) {
            Ok(filter) => (filter, None),
            Err(e) => (EnvFilter::new("info"), Some(e)),
        };
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init()
            .is_ok();
        if let Some(e) = rejected {
            tracing::warn!(filter = %directives, error = %e, "COT_LOG not understood, logging at info");
        }
        if installed {
            tracing::debug!(filter = %directives, "logging initialized");
        }
    });
}
