use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use cothread_core::{SpinLock, TaskId};

use super::waitqueue::{immediate, WaitQueue};
use crate::scheduler::suspend;
use crate::task::Outcome;
use crate::tls;

struct State {
    owner: TaskId,
    queue: WaitQueue,
}

/// Non-reentrant cooperative mutex
///
/// Ownership passes straight to the longest waiter on unlock. Locking a
/// mutex the current task already owns is a usage error and panics.
pub struct Mutex<T> {
    state: SpinLock<State>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by ownership of the mutex
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Self {
        Mutex {
            state: SpinLock::new(State { owner: TaskId::NONE, queue: WaitQueue::new() }),
            data: UnsafeCell::new(data),
        }
    }

    /// Register for ownership; pair with `suspend()` and `acquired()`
    pub fn wait(&self) -> Outcome {
        let me = tls::current().id;
        let mut s = self.state.lock();
        assert!(s.owner != me, "mutex re-locked by its owner");
        if s.owner.is_none() {
            s.owner = me;
            immediate(0)
        } else {
            s.queue.enqueue_current()
        }
    }

    /// Guard for a registration that fired, if it granted ownership
    pub fn acquired(&self, outcome: &Outcome) -> Option<MutexGuard<'_, T>> {
        if outcome.is_set() && self.state.lock().owner == tls::current().id {
            Some(MutexGuard::new(self))
        } else {
            None
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        tls::might_yield();
        loop {
            let outcome = self.wait();
            suspend();
            if let Some(guard) = self.acquired(&outcome) {
                return guard;
            }
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let me = tls::current().id;
        let mut s = self.state.lock();
        assert!(s.owner != me, "mutex re-locked by its owner");
        if s.owner.is_none() {
            s.owner = me;
            drop(s);
            Some(MutexGuard::new(self))
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn owner(&self) -> Option<TaskId> {
        let owner = self.state.lock().owner;
        owner.is_some().then_some(owner)
    }

    fn unlock(&self) {
        let mut s = self.state.lock();
        s.owner = s.queue.wake_one(0).unwrap_or(TaskId::NONE);
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("owner", &self.owner()).finish()
    }
}

/// Ownership of a [`Mutex`]; stays with the task that locked it
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        MutexGuard { mutex, _not_send: PhantomData }
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves ownership of the mutex
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves ownership of the mutex
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::scheduler::yield_now;
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap()
    }

    #[test]
    fn test_try_lock_and_owner() {
        let m = Mutex::new(5);
        {
            let mut g = m.try_lock().unwrap();
            *g += 1;
            assert!(m.is_locked());
            assert_eq!(m.owner(), Some(tls::current().id));
        }
        assert!(!m.is_locked());
        assert_eq!(m.into_inner(), 6);
    }

    #[test]
    #[should_panic(expected = "re-locked by its owner")]
    fn test_relock_by_owner_panics() {
        let m = Mutex::new(());
        let _g = m.lock();
        let _again = m.try_lock();
    }

    #[test]
    fn test_lock_serializes_across_yields() {
        let rt = runtime();
        let g = rt.default_group();
        let m = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for id in 0..4 {
            let m = Arc::clone(&m);
            handles.push(
                g.spawn(move |_| {
                    for _ in 0..3 {
                        let mut v = m.lock();
                        v.push(id);
                        // Another task holding the baton must not get in.
                        yield_now();
                        v.push(id);
                    }
                })
                .unwrap(),
            );
        }
        for h in handles {
            h.join();
        }
        let m = Arc::try_unwrap(m).ok().unwrap();
        let v = m.into_inner();
        assert_eq!(v.len(), 24);
        for pair in v.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_wait_composes_with_suspend() {
        let m = Mutex::new(1);
        let outcome = m.wait();
        suspend();
        let g = m.acquired(&outcome).unwrap();
        assert_eq!(*g, 1);
    }
}
