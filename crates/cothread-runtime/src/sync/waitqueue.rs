//! FIFO queue of registered waiters shared by every primitive
//!
//! Primitives hold their own lock while touching the queue and only then
//! take a task's scheduling lock (through `fire`), never the other way
//! round.

use std::collections::VecDeque;
use std::sync::Arc;

use cothread_core::TaskId;

use crate::task::{Outcome, Task};
use crate::tls;

/// One registration of the current task on a primitive
pub(crate) struct Waiter {
    task: Arc<Task>,
    epoch: u64,
    outcome: Outcome,
}

impl Waiter {
    pub(crate) fn register() -> Self {
        let task = tls::current();
        let epoch = task.register_other();
        Waiter { task, epoch, outcome: Outcome::new() }
    }

    pub(crate) fn outcome(&self) -> Outcome {
        self.outcome.clone()
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// Deliver `value`; false if the waiter already woke for something else
    pub(crate) fn wake(&self, value: i32) -> bool {
        self.task.fire(self.epoch, &self.outcome, value)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.task.is_live_in(self.epoch)
    }
}

/// Registration that fires at once, for a primitive that is already available
pub(crate) fn immediate(value: i32) -> Outcome {
    let w = Waiter::register();
    w.wake(value);
    w.outcome
}

#[derive(Default)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, w: Waiter) {
        self.waiters.push_back(w);
    }

    /// Register the current task at the back; returns its outcome
    pub(crate) fn enqueue_current(&mut self) -> Outcome {
        let w = Waiter::register();
        let outcome = w.outcome();
        self.push(w);
        outcome
    }

    /// Wake the longest waiter still interested; stale entries are dropped
    pub(crate) fn wake_one(&mut self, value: i32) -> Option<TaskId> {
        while let Some(w) = self.waiters.pop_front() {
            if w.wake(value) {
                return Some(w.task_id());
            }
        }
        None
    }

    /// Wake everybody; returns how many actually woke
    pub(crate) fn wake_all(&mut self, value: i32) -> usize {
        self.waiters.drain(..).filter(|w| w.wake(value)).count()
    }

    /// Whether a waiter that can still be woken is queued
    pub(crate) fn has_live(&mut self) -> bool {
        self.waiters.retain(Waiter::is_live);
        !self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}
