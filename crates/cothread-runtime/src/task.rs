//! Task control block
//!
//! A task is a cooperative thread or an FSM. Its `Sched` record holds the
//! lifecycle state, the wait registrations made since the last suspension,
//! and the group the task currently belongs to.
//!
//! Registrations belong to an *epoch*. Every waker names the epoch it was
//! registered in; the first successful wake moves the task to a new epoch,
//! so later wakes for the old one are stale and ignored. This is what lets
//! one `suspend()` wait on descriptors, timers and primitives at once.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cothread_core::{CancellationToken, SpinLock, SpinLockGuard, TaskId, TaskKind, TaskState};

use crate::config::defaults;
use crate::fsm::FsmSlot;
use crate::group::{GroupInner, Switch};
use crate::poller::PollSet;
use crate::sync::Completion;

const PENDING: i32 = i32::MIN;

/// Result slot of one wait registration
///
/// Filled when the registered event fires: `revents` for descriptor waits,
/// `1` for an expired timer, a primitive-specific value otherwise.
/// After `suspend()` returns, check which outcomes are set.
#[derive(Clone)]
pub struct Outcome(Arc<AtomicI32>);

impl Outcome {
    pub(crate) fn new() -> Self {
        Outcome(Arc::new(AtomicI32::new(PENDING)))
    }

    /// Whether the event fired
    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) != PENDING
    }

    /// The value delivered by the event, if it fired
    #[inline]
    pub fn get(&self) -> Option<i32> {
        match self.0.load(Ordering::Acquire) {
            PENDING => None,
            v => Some(v),
        }
    }

    pub(crate) fn set(&self, value: i32) {
        self.0.store(value, Ordering::Release);
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => write!(f, "Outcome({})", v),
            None => write!(f, "Outcome(pending)"),
        }
    }
}

#[derive(Clone)]
pub(crate) struct FdWait {
    pub(crate) fd: RawFd,
    pub(crate) events: i16,
    pub(crate) outcome: Outcome,
}

#[derive(Clone)]
pub(crate) struct TimerWait {
    pub(crate) deadline: Instant,
    pub(crate) outcome: Outcome,
}

/// Registrations made since the last suspension
#[derive(Default)]
pub(crate) struct WaitSet {
    pub(crate) fds: Vec<FdWait>,
    pub(crate) timers: Vec<TimerWait>,
    /// Primitive wait queues this task sits in
    pub(crate) others: usize,
}

impl WaitSet {
    pub(crate) fn len(&self) -> usize {
        self.fds.len() + self.timers.len() + self.others
    }

    pub(crate) fn clear(&mut self) {
        self.fds.clear();
        self.timers.clear();
        self.others = 0;
    }

    pub(crate) fn earliest_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// Fill the outcome of every timer already due; true if any was
    fn fire_expired(&self, now: Instant) -> bool {
        let mut fired = false;
        for t in self.timers.iter().filter(|t| t.deadline <= now) {
            t.outcome.set(1);
            fired = true;
        }
        fired
    }
}

pub(crate) struct Sched {
    pub(crate) state: TaskState,
    pub(crate) epoch: u64,
    /// An event fired before the task got around to suspending
    pub(crate) woken_early: bool,
    /// Present on its group's ready queue
    pub(crate) queued: bool,
    /// FSM to retire once its running step returns
    pub(crate) kill_requested: bool,
    pub(crate) waits: WaitSet,
    pub(crate) group: Option<Arc<GroupInner>>,
}

impl Sched {
    pub(crate) fn in_group(&self, group: &GroupInner) -> bool {
        self.group.as_deref().map_or(false, |g| std::ptr::eq(g, group))
    }
}

/// Condvar parking for tasks running outside any group
struct Parker {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self { pending: Mutex::new(false), cv: Condvar::new() }
    }

    fn park(&self, timeout: Option<Duration>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !*pending {
            pending = match timeout {
                Some(t) => self.cv.wait_timeout(pending, t).unwrap_or_else(PoisonError::into_inner).0,
                None => self.cv.wait(pending).unwrap_or_else(PoisonError::into_inner),
            };
        }
        *pending = false;
    }

    fn unpark(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_one();
    }
}

/// Result of [`Task::kill_fsm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kill {
    Killed,
    AlreadyFinished,
    Running,
}

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) name: String,
    sched: SpinLock<Sched>,
    parker: Parker,
    native_slice: Duration,
    pub(crate) token: CancellationToken,
    /// Released once the task exits or is killed
    pub(crate) exited: Completion,
    pub(crate) fsm: SpinLock<FsmSlot>,
}

impl Task {
    pub(crate) fn new(
        kind: TaskKind,
        name: Option<&str>,
        group: Option<Arc<GroupInner>>,
        native_slice: Duration,
    ) -> Arc<Task> {
        let id = TaskId::next();
        let name = match name {
            Some(n) => n.to_string(),
            None => id.to_string(),
        };
        Arc::new(Task {
            id,
            kind,
            name,
            sched: SpinLock::new(Sched {
                state: TaskState::Ready,
                epoch: 0,
                woken_early: false,
                queued: false,
                kill_requested: false,
                waits: WaitSet::default(),
                group,
            }),
            parker: Parker::new(),
            native_slice,
            token: CancellationToken::new(),
            exited: Completion::new(),
            fsm: SpinLock::new(FsmSlot::default()),
        })
    }

    /// Record for a plain OS thread that touched the scheduler
    pub(crate) fn adopt_native() -> Arc<Task> {
        let task = Task::new(
            TaskKind::Thread,
            std::thread::current().name(),
            None,
            Duration::from_millis(defaults::NATIVE_POLL_SLICE_MS),
        );
        task.sched().state = TaskState::Native;
        task
    }

    #[inline]
    pub(crate) fn sched(&self) -> SpinLockGuard<'_, Sched> {
        self.sched.lock()
    }

    pub(crate) fn state(&self) -> TaskState {
        self.sched().state
    }

    pub(crate) fn group(&self) -> Option<Arc<GroupInner>> {
        self.sched().group.clone()
    }

    pub(crate) fn pending_registrations(&self) -> usize {
        self.sched().waits.len()
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    pub(crate) fn register_fd(&self, fd: RawFd, events: i16) -> Outcome {
        let outcome = Outcome::new();
        self.sched().waits.fds.push(FdWait { fd, events, outcome: outcome.clone() });
        outcome
    }

    pub(crate) fn register_timer(&self, deadline: Instant) -> Outcome {
        let outcome = Outcome::new();
        self.sched().waits.timers.push(TimerWait { deadline, outcome: outcome.clone() });
        outcome
    }

    /// Count a primitive registration; returns the epoch it belongs to
    pub(crate) fn register_other(&self) -> u64 {
        let mut s = self.sched();
        s.waits.others += 1;
        s.epoch
    }

    /// Whether a registration made in `epoch` can still wake this task
    pub(crate) fn is_live_in(&self, epoch: u64) -> bool {
        let s = self.sched();
        s.epoch == epoch && s.state.is_alive()
    }

    /// Snapshot of current registrations for a non-suspending check
    pub(crate) fn snapshot_waits(&self) -> (u64, Vec<FdWait>, Vec<TimerWait>) {
        let s = self.sched();
        (s.epoch, s.waits.fds.clone(), s.waits.timers.clone())
    }

    /// Drop every registration without waking
    pub(crate) fn discard_waits(&self) {
        let mut s = self.sched();
        if s.waits.len() > 0 {
            s.epoch += 1;
            s.waits.clear();
        }
        s.woken_early = false;
    }

    // ---------------------------------------------------------------
    // Waking
    // ---------------------------------------------------------------

    /// Deliver an event registered in `epoch`
    ///
    /// Returns false if the registration is stale (the task already woke
    /// for another event, or exited); the outcome is then left untouched.
    pub(crate) fn fire(self: &Arc<Self>, epoch: u64, outcome: &Outcome, value: i32) -> bool {
        let mut s = self.sched();
        if s.epoch != epoch || !s.state.is_alive() {
            return false;
        }
        outcome.set(value);
        if s.state.is_waiting() {
            self.resume_locked(s);
        } else {
            s.woken_early = true;
        }
        true
    }

    /// Wake regardless of registrations (FSM `wake()`)
    pub(crate) fn wake(self: &Arc<Self>) {
        let mut s = self.sched();
        let state = s.state;
        match state {
            TaskState::Blocked | TaskState::Dormant => self.resume_locked(s),
            TaskState::Running => s.woken_early = true,
            _ => {}
        }
    }

    /// Start a new epoch and make the task runnable again
    pub(crate) fn resume_locked(self: &Arc<Self>, mut s: SpinLockGuard<'_, Sched>) {
        s.epoch += 1;
        s.waits.clear();
        s.woken_early = false;
        match s.group.clone() {
            Some(group) => {
                s.state = TaskState::Ready;
                let push = !s.queued;
                s.queued = true;
                drop(s);
                if push {
                    group.push_ready(Arc::clone(self));
                }
            }
            None => {
                s.state = TaskState::Native;
                drop(s);
                self.parker.unpark();
            }
        }
    }

    /// Put a live task back on its ready queue
    pub(crate) fn requeue(self: &Arc<Self>) {
        let s = self.sched();
        if s.state.is_alive() {
            self.resume_locked(s);
        }
    }

    // ---------------------------------------------------------------
    // Suspension
    // ---------------------------------------------------------------

    /// Consume registrations that already fired; true if the caller
    /// should not actually block
    fn take_early(s: &mut Sched, now: Instant) -> bool {
        if s.woken_early || s.waits.fire_expired(now) {
            s.woken_early = false;
            s.epoch += 1;
            s.waits.clear();
            true
        } else {
            false
        }
    }

    /// Block a cooperative thread until one registration fires
    pub(crate) fn suspend_thread(self: &Arc<Self>) {
        let mut s = self.sched();
        if Self::take_early(&mut s, Instant::now()) {
            return;
        }
        let epoch = s.epoch;
        s.state = TaskState::Blocked;
        match s.group.clone() {
            Some(group) => {
                drop(s);
                group.note_waiting(self);
                group.switch_out(self.id, Switch::Block);
            }
            None => {
                let fds = s.waits.fds.clone();
                let timers = s.waits.timers.clone();
                drop(s);
                self.block_native(epoch, &fds, &timers);
            }
        }
    }

    /// Suspension for a thread migrated out of every group
    fn block_native(self: &Arc<Self>, epoch: u64, fds: &[FdWait], timers: &[TimerWait]) {
        let deadline = timers.iter().map(|t| t.deadline).min();
        loop {
            let now = Instant::now();
            for t in timers.iter().filter(|t| t.deadline <= now) {
                self.fire(epoch, &t.outcome, 1);
            }
            if self.state() != TaskState::Blocked {
                return;
            }

            let wait = deadline.map(|d| d.saturating_duration_since(now));
            if fds.is_empty() {
                self.parker.park(wait);
                continue;
            }

            // Descriptors cannot share a poll with the parker, so poll in
            // slices and recheck for primitive wakes in between.
            let slice = wait.map_or(self.native_slice, |w| w.min(self.native_slice));
            let mut set = PollSet::new();
            for w in fds {
                set.add(w.fd, w.events);
            }
            match set.poll(Some(slice)) {
                Ok(0) => {}
                Ok(_) => {
                    for (i, w) in fds.iter().enumerate() {
                        let revents = set.revents(i);
                        if revents != 0 {
                            self.fire(epoch, &w.outcome, i32::from(revents));
                        }
                    }
                }
                Err(e) => tracing::error!(task = %self.id, error = %e, "native poll failed"),
            }
        }
    }

    /// FSM step ended in a block disposition
    pub(crate) fn block_fsm(self: &Arc<Self>) {
        let mut s = self.sched();
        if !s.state.is_alive() {
            return;
        }
        if s.woken_early || s.waits.fire_expired(Instant::now()) {
            return self.resume_locked(s);
        }
        s.state = TaskState::Blocked;
        let group = s.group.clone();
        drop(s);
        if let Some(group) = group {
            group.note_waiting(self);
        }
    }

    /// FSM step ended in a rest disposition
    pub(crate) fn rest_fsm(self: &Arc<Self>) {
        let mut s = self.sched();
        if !s.state.is_alive() {
            return;
        }
        if s.woken_early {
            return self.resume_locked(s);
        }
        s.epoch += 1;
        s.waits.clear();
        s.state = TaskState::Dormant;
    }

    /// Retire an FSM between steps
    ///
    /// The state is checked and changed under one lock, so a step cannot
    /// start in between. With `defer`, a running FSM is flagged instead and
    /// retires when its current step returns.
    pub(crate) fn kill_fsm(&self, defer: bool) -> Kill {
        let mut s = self.sched();
        match s.state {
            TaskState::Finished => Kill::AlreadyFinished,
            TaskState::Running => {
                s.kill_requested |= defer;
                Kill::Running
            }
            _ => {
                self.retire_locked(s);
                Kill::Killed
            }
        }
    }

    /// Honor a deferred kill once no step is running; true if it retired
    pub(crate) fn take_kill_request(&self) -> bool {
        let mut s = self.sched();
        if !s.kill_requested || s.state == TaskState::Running {
            return false;
        }
        s.kill_requested = false;
        if s.state == TaskState::Finished {
            return false;
        }
        self.retire_locked(s);
        true
    }

    /// Mark the task finished and notify joiners
    ///
    /// Returns the group the task was in, if any.
    pub(crate) fn retire(&self) -> Option<Arc<GroupInner>> {
        let s = self.sched();
        self.retire_locked(s)
    }

    fn retire_locked(&self, mut s: SpinLockGuard<'_, Sched>) -> Option<Arc<GroupInner>> {
        if s.state == TaskState::Finished {
            return None;
        }
        s.state = TaskState::Finished;
        s.epoch += 1;
        s.waits.clear();
        let group = s.group.take();
        drop(s);
        if let Some(g) = &group {
            g.leave();
        }
        tracing::trace!(task = %self.id, name = %self.name, "task finished");
        self.exited.release();
        group
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}
