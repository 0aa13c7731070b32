//! Stackless finite-state machines
//!
//! An FSM is a stored step closure re-invoked from the top every time the
//! task is scheduled. Before returning, a step picks what happens next:
//!
//! ```text
//!   register waits + suspend()  ─► Blocked until one fires
//!   transition(next)            ─► run `next` on the next schedule
//!   yield_now()                 ─► requeue at once
//!   rest()                      ─► Dormant until wake() or run()
//!   exit()                      ─► Finished
//! ```
//!
//! A step that picks nothing rests, with a warning.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use cothread_core::{TaskId, TaskKind, TaskState};

use crate::sync::Completion;
use crate::task::{Kill, Task};
use crate::tls;

pub(crate) type Step = Box<dyn FnMut() + Send>;

pub(crate) enum Disposition {
    Block,
    Yield,
    Transition(Step),
    Exit,
    Rest,
}

#[derive(Default)]
pub(crate) struct FsmSlot {
    step: Option<Step>,
    next: Option<Disposition>,
}

impl FsmSlot {
    pub(crate) fn install(&mut self, step: Step) {
        self.step = Some(step);
        self.next = None;
    }
}

pub(crate) fn set_disposition(task: &Task, next: Disposition) {
    let mut slot = task.fsm.lock();
    debug_assert!(slot.next.is_none(), "FSM step chose more than one disposition");
    slot.next = Some(next);
}

fn current_fsm() -> Arc<Task> {
    match tls::try_current() {
        Some(task) if task.kind == TaskKind::Fsm => task,
        _ => panic!("FSM operation called outside an FSM step"),
    }
}

/// Run `next` instead of the current step from now on
pub fn transition<F>(next: F)
where
    F: FnMut() + Send + 'static,
{
    set_disposition(&current_fsm(), Disposition::Transition(Box::new(next)));
}

/// Terminate the running FSM once the step returns
pub fn exit() {
    set_disposition(&current_fsm(), Disposition::Exit);
}

/// Go dormant until `wake()` or `run()`
pub fn rest() {
    set_disposition(&current_fsm(), Disposition::Rest);
}

/// Run one step of `task` on the calling OS thread
///
/// The caller has already moved the task to Running.
pub(crate) fn dispatch(task: &Arc<Task>) -> Result<(), Box<dyn Any + Send>> {
    let step = task.fsm.lock().step.take();
    let mut step = match step {
        Some(step) => step,
        None => {
            task.retire();
            return Ok(());
        }
    };

    let prev = tls::swap_current(Some(Arc::clone(task)));
    let result = panic::catch_unwind(AssertUnwindSafe(|| step()));
    tls::swap_current(prev);

    let next = {
        let mut slot = task.fsm.lock();
        slot.step = Some(step);
        slot.next.take()
    };

    if let Err(payload) = result {
        let step = task.fsm.lock().step.take();
        drop(step);
        task.retire();
        return Err(payload);
    }

    match next {
        Some(Disposition::Block) => task.block_fsm(),
        Some(Disposition::Yield) => task.requeue(),
        Some(Disposition::Transition(new_step)) => {
            let old = task.fsm.lock().step.replace(new_step);
            drop(old);
            tracing::trace!(task = %task.id, "fsm transition");
            task.requeue();
        }
        Some(Disposition::Exit) => {
            let step = task.fsm.lock().step.take();
            drop(step);
            task.retire();
        }
        Some(Disposition::Rest) => task.rest_fsm(),
        None => {
            tracing::warn!(task = %task.id, "FSM step returned without a disposition; resting");
            task.rest_fsm();
        }
    }
    if task.take_kill_request() {
        drop_step(task);
        tracing::trace!(task = %task.id, "fsm killed after its step");
    }
    Ok(())
}

fn drop_step(task: &Task) {
    let step = task.fsm.lock().step.take();
    drop(step);
}

/// Handle to an FSM task
#[derive(Clone)]
pub struct Fsm {
    task: Arc<Task>,
}

impl Fsm {
    pub(crate) fn from_task(task: Arc<Task>) -> Self {
        Fsm { task }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// Schedule the FSM even though none of its registrations fired
    pub fn wake(&self) {
        self.task.wake();
    }

    pub fn is_finished(&self) -> bool {
        self.task.state() == TaskState::Finished
    }

    /// Released once the FSM exits or is killed
    pub fn join_completion(&self) -> Completion {
        self.task.exited.clone()
    }

    /// Invoke the current step synchronously on the calling thread
    ///
    /// Legal from any task, including another FSM's step; a panic in the
    /// step propagates to the caller.
    pub fn run(&self) {
        {
            let mut s = self.task.sched();
            assert!(s.state != TaskState::Running, "FSM run re-entrantly");
            if s.state == TaskState::Finished {
                return;
            }
            s.epoch += 1;
            s.waits.clear();
            s.woken_early = false;
            s.state = TaskState::Running;
        }
        if let Err(payload) = dispatch(&self.task) {
            panic::resume_unwind(payload);
        }
    }

    /// Terminate an FSM that is not currently running
    pub fn kill(&self) {
        match self.task.kill_fsm(false) {
            Kill::Running => panic!("FSM killed while running"),
            Kill::Killed => {
                drop_step(&self.task);
                tracing::trace!(task = %self.task.id, "fsm killed");
            }
            Kill::AlreadyFinished => {}
        }
    }

    /// Kill now, or as soon as the running step returns
    fn kill_at_boundary(&self) {
        match self.task.kill_fsm(true) {
            Kill::Killed => {
                drop_step(&self.task);
                tracing::trace!(task = %self.task.id, "fsm killed");
            }
            Kill::Running => tracing::trace!(task = %self.task.id, "fsm kill deferred to step end"),
            Kill::AlreadyFinished => {}
        }
    }
}

impl fmt::Debug for Fsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsm")
            .field("id", &self.task.id)
            .field("state", &self.task.state())
            .finish()
    }
}

/// An FSM killed when the handle is dropped
///
/// For FSMs owned by one object, such as a connection's driver. Dropping
/// it while a step runs on another thread lets that step finish first.
pub struct AutoFsm(Fsm);

impl AutoFsm {
    pub fn new(fsm: Fsm) -> Self {
        AutoFsm(fsm)
    }
}

impl Deref for AutoFsm {
    type Target = Fsm;

    fn deref(&self) -> &Fsm {
        &self.0
    }
}

impl Drop for AutoFsm {
    fn drop(&mut self) {
        self.0.kill_at_boundary();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::scheduler::{suspend, timer_wait, yield_now};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap()
    }

    #[test]
    fn test_yield_then_exit() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let fsm = rt
            .default_group()
            .spawn_fsm(move || {
                if r.fetch_add(1, Ordering::SeqCst) < 4 {
                    yield_now();
                } else {
                    exit();
                }
            })
            .unwrap();
        fsm.join_completion().block();
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert!(fsm.is_finished());
    }

    #[test]
    fn test_transition_switches_step() {
        let rt = runtime();
        let seen = Arc::new(cothread_core::SpinLock::new(Vec::new()));
        let s = Arc::clone(&seen);
        let fsm = rt
            .default_group()
            .spawn_fsm(move || {
                s.lock().push("first");
                let s2 = Arc::clone(&s);
                transition(move || {
                    s2.lock().push("second");
                    exit();
                });
            })
            .unwrap();
        fsm.join_completion().block();
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_block_on_timer() {
        let rt = runtime();
        let start = Instant::now();
        let deadline = start + Duration::from_millis(30);
        let armed = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&armed);
        let fsm = rt
            .default_group()
            .spawn_fsm(move || {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    timer_wait(deadline);
                    suspend();
                } else {
                    exit();
                }
            })
            .unwrap();
        fsm.join_completion().block();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(armed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rest_until_woken() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let fsm = rt
            .default_group()
            .spawn_fsm(move || {
                if r.fetch_add(1, Ordering::SeqCst) == 0 {
                    rest();
                } else {
                    exit();
                }
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!fsm.is_finished());
        fsm.wake();
        fsm.join_completion().block();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_synchronously_and_kill() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let fsm = rt
            .default_group()
            .spawn_fsm(move || {
                r.fetch_add(1, Ordering::SeqCst);
                rest();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        fsm.run();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        fsm.kill();
        assert!(fsm.is_finished());
        assert!(fsm.join_completion().is_complete());
        fsm.run();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nested_run_from_another_fsm() {
        let rt = runtime();
        let g = rt.default_group();
        let inner_runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&inner_runs);
        let inner = g
            .spawn_fsm(move || {
                r.fetch_add(1, Ordering::SeqCst);
                rest();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(inner_runs.load(Ordering::SeqCst), 1);
        let outer = g
            .spawn_fsm(move || {
                inner.run();
                exit();
            })
            .unwrap();
        outer.join_completion().block();
        assert_eq!(inner_runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_step_finishes_fsm() {
        let rt = runtime();
        let fsm = rt
            .default_group()
            .spawn_fsm(|| panic!("step failed"))
            .unwrap();
        fsm.join_completion().block();
        assert!(fsm.is_finished());
    }

    #[test]
    fn test_auto_fsm_kills_on_drop() {
        let rt = runtime();
        let fsm = rt.default_group().spawn_fsm(rest).unwrap();
        let done = fsm.join_completion();
        std::thread::sleep(Duration::from_millis(20));
        drop(AutoFsm::new(fsm));
        assert!(done.is_complete());
    }

    #[test]
    fn test_auto_fsm_dropped_during_step() {
        let rt = runtime();
        let gate = Arc::new(std::sync::Barrier::new(2));
        let g2 = Arc::clone(&gate);
        let fsm = rt
            .default_group()
            .spawn_fsm(move || {
                // Keep the step running while the owner drops its handle.
                g2.wait();
                g2.wait();
                yield_now();
            })
            .unwrap();
        let done = fsm.join_completion();
        let handle = fsm.clone();
        let auto = AutoFsm::new(fsm);

        gate.wait();
        drop(auto);
        assert!(!handle.is_finished());
        gate.wait();
        done.block();
        assert!(handle.is_finished());
    }

    #[test]
    #[should_panic(expected = "killed while running")]
    fn test_kill_while_running_panics() {
        let task = Task::new(TaskKind::Fsm, None, None, Duration::from_millis(1));
        task.sched().state = TaskState::Running;
        Fsm::from_task(task).kill();
    }
}
