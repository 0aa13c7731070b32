use std::fmt;
use std::sync::Arc;

use cothread_core::SpinLock;

use super::waitqueue::{immediate, WaitQueue};
use crate::scheduler::suspend;
use crate::task::Outcome;
use crate::tls;

struct State {
    done: bool,
    queue: WaitQueue,
}

/// Level-triggered latch
///
/// After `release()`, every current and future waiter passes until
/// `latch()` re-arms it. Clones share the same latch, which makes it the
/// way to learn about a task's exit without holding on to the task.
#[derive(Clone)]
pub struct Completion {
    state: Arc<SpinLock<State>>,
}

impl Completion {
    pub fn new() -> Self {
        Completion { state: Arc::new(SpinLock::new(State { done: false, queue: WaitQueue::new() })) }
    }

    /// Re-arm a released completion
    pub fn latch(&self) {
        self.state.lock().done = false;
    }

    pub fn release(&self) {
        let mut s = self.state.lock();
        s.done = true;
        s.queue.wake_all(0);
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().done
    }

    pub fn wait(&self) -> Outcome {
        let mut s = self.state.lock();
        if s.done {
            immediate(0)
        } else {
            s.queue.enqueue_current()
        }
    }

    pub fn block(&self) {
        tls::might_yield();
        loop {
            let released = self.wait();
            suspend();
            if released.is_set() {
                return;
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("done", &self.is_complete()).finish()
    }
}
