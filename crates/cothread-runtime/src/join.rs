//! Join handles for cooperative threads

use std::fmt;
use std::panic;
use std::sync::Arc;

use cothread_core::{CancellationToken, SpinLock, TaskId};

use crate::sync::Completion;
use crate::task::Task;

type Slot<T> = Arc<SpinLock<Option<std::thread::Result<T>>>>;

/// Owned permission to wait for a cooperative thread's result
///
/// Holding the handle does not keep the thread's private state reachable;
/// the only view into the thread after it exits is its result.
pub struct JoinHandle<T> {
    task: Arc<Task>,
    result: Slot<T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: Arc<Task>, result: Slot<T>) -> Self {
        JoinHandle { task, result }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.exited.is_complete()
    }

    /// Request cancellation; the thread observes it through its token
    pub fn cancel(&self) {
        self.task.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.task.token
    }

    /// Released once the thread exits
    pub fn join_completion(&self) -> Completion {
        self.task.exited.clone()
    }

    /// Wait for the thread and take its result
    ///
    /// Suspends cooperatively when called from a task; a panic inside the
    /// thread is resumed here.
    pub fn join(self) -> T {
        self.task.exited.block();
        let result = self.result.lock().take();
        match result {
            Some(Ok(v)) => v,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => unreachable!("thread exited without storing a result"),
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.task.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
