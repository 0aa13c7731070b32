//! # cothread-core
//!
//! Core types for the cothread cooperative scheduler.
//!
//! This crate is platform-agnostic and contains no scheduling logic.
//! The scheduler itself lives in `cothread-runtime`.
//!
//! ## Modules
//!
//! - `id` - task and thread-group identifiers
//! - `state` - task lifecycle state and kind
//! - `cancel` - cancellation token for cooperative cancellation
//! - `error` - error types
//! - `spinlock` - internal spinlock primitive
//! - `env` - environment variable utilities

pub mod id;
pub mod state;
pub mod cancel;
pub mod error;
pub mod spinlock;
pub mod env;

// Re-exports for convenience
pub use id::{GroupId, TaskId};
pub use state::{TaskKind, TaskState};
pub use cancel::CancellationToken;
pub use error::{SchedError, SchedResult};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_str};
