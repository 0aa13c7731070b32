//! Cooperative synchronization primitives
//!
//! Every primitive offers a blocking call (`lock`, `down`, `block`...) and
//! a registration call (`wait`) returning an [`Outcome`](crate::Outcome),
//! so a primitive can be waited on together with descriptors and timers
//! in a single `suspend()`:
//!
//! ```ignore
//! let permit = sema.wait();
//! let readable = fd_read_wait(fd);
//! suspend();
//! if permit.is_set() { /* we hold a permit */ }
//! ```
//!
//! Primitives are meant for tasks of one group. They stay correct when
//! shared with native threads or other groups, but give no fairness
//! guarantee across them.

mod barrier;
mod completion;
mod cond;
mod mutex;
mod rwlock;
mod semaphore;
pub(crate) mod waitqueue;

pub use barrier::Barrier;
pub use completion::Completion;
pub use cond::Cond;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
