use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use cothread_core::{SpinLock, TaskId};

use super::waitqueue::{immediate, WaitQueue};
use crate::scheduler::suspend;
use crate::task::Outcome;
use crate::tls;

struct State {
    readers: usize,
    writer: TaskId,
    read_q: WaitQueue,
    write_q: WaitQueue,
}

impl State {
    fn grant_writer(&mut self) -> bool {
        match self.write_q.wake_one(0) {
            Some(id) => {
                self.writer = id;
                true
            }
            None => false,
        }
    }

    /// Hand a free lock to the next live writer, else to every queued reader
    ///
    /// Readers queue behind a writer that may stop waiting before it is
    /// granted, so they must be released whenever no writer takes over.
    fn hand_off(&mut self) {
        if !self.grant_writer() {
            let woken = self.read_q.wake_all(0);
            self.readers += woken;
        }
    }
}

/// Reader/writer lock
///
/// Any number of readers, or one writer. New readers queue behind waiting
/// writers so writers are not starved. Not reentrant for writers.
pub struct RwLock<T> {
    state: SpinLock<State>,
    data: UnsafeCell<T>,
}

// SAFETY: shared access only with readers > 0, exclusive only with a writer
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(data: T) -> Self {
        RwLock {
            state: SpinLock::new(State {
                readers: 0,
                writer: TaskId::NONE,
                read_q: WaitQueue::new(),
                write_q: WaitQueue::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Register for shared access
    pub fn read_wait(&self) -> Outcome {
        let mut s = self.state.lock();
        if s.writer.is_none() && !s.write_q.has_live() {
            s.readers += 1;
            immediate(0)
        } else {
            s.read_q.enqueue_current()
        }
    }

    /// Register for exclusive access
    pub fn write_wait(&self) -> Outcome {
        let me = tls::current().id;
        let mut s = self.state.lock();
        assert!(s.writer != me, "rwlock re-locked for writing by its owner");
        if s.writer.is_none() && s.readers == 0 {
            s.writer = me;
            immediate(0)
        } else {
            s.write_q.enqueue_current()
        }
    }

    /// A set read outcome always grants shared access
    pub fn read_acquired(&self, outcome: &Outcome) -> Option<RwLockReadGuard<'_, T>> {
        outcome.is_set().then(|| RwLockReadGuard { lock: self, _not_send: PhantomData })
    }

    pub fn write_acquired(&self, outcome: &Outcome) -> Option<RwLockWriteGuard<'_, T>> {
        if outcome.is_set() && self.state.lock().writer == tls::current().id {
            Some(RwLockWriteGuard { lock: self, _not_send: PhantomData })
        } else {
            None
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        tls::might_yield();
        loop {
            let outcome = self.read_wait();
            suspend();
            if let Some(g) = self.read_acquired(&outcome) {
                return g;
            }
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        tls::might_yield();
        loop {
            let outcome = self.write_wait();
            suspend();
            if let Some(g) = self.write_acquired(&outcome) {
                return g;
            }
        }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let mut s = self.state.lock();
        if s.writer.is_none() && !s.write_q.has_live() {
            s.readers += 1;
            Some(RwLockReadGuard { lock: self, _not_send: PhantomData })
        } else {
            None
        }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let me = tls::current().id;
        let mut s = self.state.lock();
        assert!(s.writer != me, "rwlock re-locked for writing by its owner");
        if s.writer.is_none() && s.readers == 0 {
            s.writer = me;
            Some(RwLockWriteGuard { lock: self, _not_send: PhantomData })
        } else {
            None
        }
    }

    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    fn unlock_read(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.readers > 0);
        s.readers -= 1;
        if s.readers == 0 {
            s.hand_off();
        }
    }

    fn unlock_write(&self) {
        let mut s = self.state.lock();
        s.writer = TaskId::NONE;
        let woken = s.read_q.wake_all(0);
        s.readers += woken;
        if woken == 0 {
            s.hand_off();
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: readers > 0 excludes any writer
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer has exclusive access
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer has exclusive access
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
