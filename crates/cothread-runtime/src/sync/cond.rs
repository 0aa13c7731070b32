use cothread_core::SpinLock;

use super::mutex::MutexGuard;
use super::waitqueue::WaitQueue;
use crate::scheduler::suspend;
use crate::task::Outcome;
use crate::tls;

/// Condition variable
///
/// Signals are not remembered: only tasks registered at the time of
/// `signal()`/`broadcast()` are woken.
#[derive(Default)]
pub struct Cond {
    queue: SpinLock<WaitQueue>,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self) -> Outcome {
        self.queue.lock().enqueue_current()
    }

    /// Wake the longest waiter; true if somebody woke
    pub fn signal(&self) -> bool {
        self.queue.lock().wake_one(0).is_some()
    }

    /// Wake every waiter; returns how many woke
    pub fn broadcast(&self) -> usize {
        self.queue.lock().wake_all(0)
    }

    pub fn block(&self) {
        tls::might_yield();
        self.wait();
        suspend();
    }

    /// Release `guard`, wait for a signal, then lock again
    pub fn block_with<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        tls::might_yield();
        let mutex = guard.mutex();
        self.wait();
        drop(guard);
        suspend();
        mutex.lock()
    }
}
