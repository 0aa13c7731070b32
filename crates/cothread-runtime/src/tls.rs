//! Thread-local scheduler context
//!
//! Every OS thread knows which task it is currently executing. A cooperative
//! thread's backing OS thread always runs the same task; a group driver
//! switches its current task while it runs FSM steps. Plain OS threads that
//! touch the scheduler are adopted lazily as native tasks.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::task::Task;

thread_local! {
    /// Task executing on this OS thread
    static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };

    /// Explicit critical-section nesting depth
    static CRITICAL: Cell<u32> = const { Cell::new(0) };
}

/// Get the current task, adopting this OS thread as a native task if needed
pub(crate) fn current() -> Arc<Task> {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        match &*slot {
            Some(task) => Arc::clone(task),
            None => {
                let task = Task::adopt_native();
                *slot = Some(Arc::clone(&task));
                task
            }
        }
    })
}

/// Get the current task without adopting
pub(crate) fn try_current() -> Option<Arc<Task>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Replace the current task, returning the previous one
pub(crate) fn swap_current(task: Option<Arc<Task>>) -> Option<Arc<Task>> {
    CURRENT.with(|cell| std::mem::replace(&mut *cell.borrow_mut(), task))
}

/// Current critical-section depth
#[inline]
pub fn critical_depth() -> u32 {
    CRITICAL.with(|c| c.get())
}

/// Enter a region that must not suspend
#[inline]
pub fn enter_critical_section() {
    CRITICAL.with(|c| c.set(c.get() + 1));
}

/// Leave a region entered with `enter_critical_section`
#[inline]
pub fn exit_critical_section() {
    CRITICAL.with(|c| {
        let depth = c.get();
        assert!(depth > 0, "exit_critical_section without matching enter");
        c.set(depth - 1);
    });
}

/// Assert that the caller may suspend
///
/// Fails if a critical section is open or if wait registrations are
/// pending: a suspending call would consume registrations it did not make.
#[inline]
pub fn might_yield() {
    debug_assert_eq!(critical_depth(), 0, "suspending call inside a critical section");
    if cfg!(debug_assertions) {
        if let Some(task) = try_current() {
            assert!(
                task.kind != cothread_core::TaskKind::Fsm,
                "blocking call inside an FSM step"
            );
            assert_eq!(
                task.pending_registrations(),
                0,
                "suspending call with wait registrations pending"
            );
        }
    }
}

/// RAII critical section
///
/// ```ignore
/// let _cs = CriticalSection::enter();
/// table.insert(k, v); // must not suspend
/// ```
pub struct CriticalSection {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl CriticalSection {
    pub fn enter() -> Self {
        enter_critical_section();
        CriticalSection { _not_send: std::marker::PhantomData }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        exit_critical_section();
    }
}
