//! Thread groups and their drivers
//!
//! A group is a cooperative scheduling domain. Exactly one party holds the
//! group's *baton* at a time: either the driver thread or one cooperative
//! thread. The driver pops the ready queue; FSM steps run on the driver
//! itself, cooperative threads are handed the baton and the driver waits
//! for it to come back.
//!
//! ```text
//!   driver ── resume(t) ──► baton = Task(t) ──► thread t runs
//!      ▲                                          │
//!      └──── baton = Returned(Yield|Block|Exit|Migrate) ◄─┘
//! ```
//!
//! When the ready queue is empty the driver polls the descriptors and
//! deadlines of its blocked tasks plus its notifier, then fires whatever
//! became ready.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use cothread_core::{
    CancellationToken, GroupId, SchedError, SchedResult, SpinLock, TaskId, TaskKind, TaskState,
};
use crossbeam_queue::SegQueue;

use crate::fsm::{self, Fsm};
use crate::join::JoinHandle;
use crate::notifier::Notifier;
use crate::poller::PollSet;
use crate::runtime::RuntimeShared;
use crate::task::{Outcome, Task};
use crate::tls;

/// Why a cooperative thread handed the baton back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Switch {
    Yield,
    Block,
    Exit,
    Migrate,
}

enum Baton {
    Driver,
    Task(TaskId),
    Returned(Switch),
}

pub(crate) struct GroupInner {
    pub(crate) id: GroupId,
    pub(crate) name: String,
    ready: SegQueue<Arc<Task>>,
    baton: Mutex<Baton>,
    turn: Condvar,
    /// Tasks that blocked here; pruned lazily by the driver
    waiting: SpinLock<HashMap<TaskId, Arc<Task>>>,
    notifier: Notifier,
    polling: AtomicBool,
    members: AtomicUsize,
    released: AtomicBool,
    max_poll_wait: Duration,
    pub(crate) runtime: Weak<RuntimeShared>,
}

impl GroupInner {
    pub(crate) fn new(
        name: &str,
        runtime: Weak<RuntimeShared>,
        max_poll_wait: Duration,
    ) -> SchedResult<Arc<Self>> {
        Ok(Arc::new(Self {
            id: GroupId::next(),
            name: name.to_string(),
            ready: SegQueue::new(),
            baton: Mutex::new(Baton::Driver),
            turn: Condvar::new(),
            waiting: SpinLock::new(HashMap::new()),
            notifier: Notifier::new()?,
            polling: AtomicBool::new(false),
            members: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            max_poll_wait,
            runtime,
        }))
    }

    pub(crate) fn push_ready(&self, task: Arc<Task>) {
        self.ready.push(task);
        fence(Ordering::SeqCst);
        if self.polling.load(Ordering::SeqCst) {
            self.kick();
        }
    }

    /// Interrupt an idle poll
    pub(crate) fn kick(&self) {
        if let Err(e) = self.notifier.notify() {
            tracing::error!(group = %self.name, error = %e, "failed to notify driver");
        }
    }

    pub(crate) fn join(&self) {
        self.members.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave(&self) {
        if self.members.fetch_sub(1, Ordering::AcqRel) == 1 && self.released.load(Ordering::Acquire) {
            self.kick();
        }
    }

    pub(crate) fn note_waiting(&self, task: &Arc<Task>) {
        self.waiting.lock().insert(task.id, Arc::clone(task));
    }

    fn lock_baton(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_turn<'a>(&self, mut baton: MutexGuard<'a, Baton>, id: TaskId) -> MutexGuard<'a, Baton> {
        while !matches!(*baton, Baton::Task(t) if t == id) {
            baton = self.turn.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
        baton
    }

    /// Thread side: give the baton back; unless leaving, wait to be resumed
    pub(crate) fn switch_out(&self, id: TaskId, why: Switch) {
        let mut baton = self.lock_baton();
        debug_assert!(
            matches!(*baton, Baton::Task(t) if t == id),
            "switch_out by a task that does not hold the group"
        );
        *baton = Baton::Returned(why);
        self.turn.notify_all();
        if matches!(why, Switch::Exit | Switch::Migrate) {
            return;
        }
        drop(self.wait_turn(baton, id));
    }

    /// Thread side: wait until the driver hands us the baton
    pub(crate) fn await_turn(&self, id: TaskId) {
        let baton = self.lock_baton();
        drop(self.wait_turn(baton, id));
    }

    /// Driver side: run thread `task` until it hands the baton back
    fn resume(&self, task: &Task) -> Switch {
        let mut baton = self.lock_baton();
        *baton = Baton::Task(task.id);
        self.turn.notify_all();
        loop {
            if let Baton::Returned(why) = *baton {
                *baton = Baton::Driver;
                return why;
            }
            baton = self.turn.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_shut_down(&self) -> bool {
        self.runtime.upgrade().map_or(true, |rt| rt.is_shut_down())
    }

    fn should_exit(&self) -> bool {
        self.is_shut_down()
            || (self.released.load(Ordering::Acquire) && self.members.load(Ordering::Acquire) == 0)
    }

    /// Driver main loop
    pub(crate) fn drive(self: Arc<Self>) {
        tracing::debug!(group = %self.name, "driver started");
        loop {
            while let Some(task) = self.ready.pop() {
                self.run_task(task);
            }
            if self.should_exit() {
                break;
            }
            self.idle();
        }
        tracing::debug!(group = %self.name, "driver stopped");
    }

    fn run_task(&self, task: Arc<Task>) {
        {
            let mut s = task.sched();
            s.queued = false;
            if s.state != TaskState::Ready || !s.in_group(self) {
                return;
            }
            s.state = TaskState::Running;
        }
        match task.kind {
            TaskKind::Fsm => {
                if let Err(payload) = fsm::dispatch(&task) {
                    tracing::error!(
                        group = %self.name,
                        task = %task.id,
                        "FSM step panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
            TaskKind::Thread => {
                tracing::trace!(group = %self.name, task = %task.id, "resume");
                if self.resume(&task) == Switch::Yield {
                    task.requeue();
                }
            }
        }
    }

    /// Nothing runnable: sleep until a descriptor, deadline or wake arrives
    fn idle(&self) {
        let mut set = PollSet::new();
        set.add(self.notifier.fd(), libc::POLLIN);
        let mut fd_waits: Vec<(Arc<Task>, u64, Outcome)> = Vec::new();
        let mut timers: Vec<(Arc<Task>, u64, Instant, Outcome)> = Vec::new();
        let mut deadline: Option<Instant> = None;

        self.waiting.lock().retain(|_, task| {
            let s = task.sched();
            if s.state != TaskState::Blocked || !s.in_group(self) {
                return false;
            }
            for w in &s.waits.fds {
                set.add(w.fd, w.events);
                fd_waits.push((Arc::clone(task), s.epoch, w.outcome.clone()));
            }
            for t in &s.waits.timers {
                deadline = Some(deadline.map_or(t.deadline, |d| d.min(t.deadline)));
                timers.push((Arc::clone(task), s.epoch, t.deadline, t.outcome.clone()));
            }
            true
        });

        let now = Instant::now();
        let timeout = match deadline {
            Some(d) => self.max_poll_wait.min(d.saturating_duration_since(now)),
            None => self.max_poll_wait,
        };

        self.polling.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if !self.ready.is_empty() || self.should_exit() {
            self.polling.store(false, Ordering::SeqCst);
            return;
        }
        tracing::trace!(group = %self.name, fds = set.len() - 1, ?timeout, "idle poll");
        let result = set.poll(Some(timeout));
        self.polling.store(false, Ordering::SeqCst);

        match result {
            Ok(0) => {}
            Ok(_) => {
                if set.revents(0) != 0 {
                    self.notifier.drain();
                }
                for (i, (task, epoch, outcome)) in fd_waits.iter().enumerate() {
                    let revents = set.revents(i + 1);
                    if revents & libc::POLLNVAL != 0 {
                        tracing::warn!(
                            group = %self.name,
                            task = %task.id,
                            "descriptor closed while a task waits on it; call fd_closed() first"
                        );
                    }
                    if revents != 0 {
                        task.fire(*epoch, outcome, i32::from(revents));
                    }
                }
            }
            Err(e) => tracing::error!(group = %self.name, error = %e, "poll failed"),
        }

        let now = Instant::now();
        for (task, epoch, at, outcome) in &timers {
            if *at <= now {
                task.fire(*epoch, outcome, 1);
            }
        }
    }

    /// Wake every task blocked here on `fd` with POLLNVAL
    pub(crate) fn fd_closed(&self, fd: RawFd) {
        let waiting: Vec<Arc<Task>> = self.waiting.lock().values().cloned().collect();
        for task in waiting {
            let hits: Vec<(u64, Outcome)> = {
                let s = task.sched();
                if s.state != TaskState::Blocked {
                    continue;
                }
                s.waits
                    .fds
                    .iter()
                    .filter(|w| w.fd == fd)
                    .map(|w| (s.epoch, w.outcome.clone()))
                    .collect()
            };
            for (epoch, outcome) in hits {
                task.fire(epoch, &outcome, i32::from(libc::POLLNVAL));
            }
        }
    }

    fn runtime(&self) -> SchedResult<Arc<RuntimeShared>> {
        match self.runtime.upgrade() {
            Some(rt) if !rt.is_shut_down() => Ok(rt),
            _ => Err(SchedError::ShutDown),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a thread group
///
/// Cheap to clone. Tasks spawned into one group never run concurrently
/// with each other; tasks in different groups run in parallel.
#[derive(Clone)]
pub struct Group {
    pub(crate) inner: Arc<GroupInner>,
}

impl Group {
    pub(crate) fn from_inner(inner: Arc<GroupInner>) -> Self {
        Group { inner }
    }

    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of live tasks currently in the group
    pub fn member_count(&self) -> usize {
        self.inner.members.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Let the group's driver stop once its last task leaves
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::Release);
        self.inner.kick();
    }

    /// Spawn a cooperative thread
    ///
    /// The closure receives the thread's cancellation token. The returned
    /// handle can be joined from any task or OS thread.
    pub fn spawn<F, T>(&self, f: F) -> SchedResult<JoinHandle<T>>
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_inner(None, f)
    }

    /// Spawn a cooperative thread with a name (used for logs and the OS thread)
    pub fn spawn_named<F, T>(&self, name: &str, f: F) -> SchedResult<JoinHandle<T>>
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_inner(Some(name), f)
    }

    fn spawn_inner<F, T>(&self, name: Option<&str>, f: F) -> SchedResult<JoinHandle<T>>
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let rt = self.inner.runtime()?;
        if self.is_released() {
            return Err(SchedError::GroupReleased);
        }

        let task = Task::new(
            TaskKind::Thread,
            name,
            Some(Arc::clone(&self.inner)),
            rt.config.native_poll_slice,
        );
        let slot = Arc::new(SpinLock::new(None));
        let handle = JoinHandle::new(Arc::clone(&task), Arc::clone(&slot));

        let group = Arc::clone(&self.inner);
        let thread_task = Arc::clone(&task);
        let _thread = std::thread::Builder::new()
            .name(format!("{}/{}", self.inner.name, task.name))
            .stack_size(rt.config.thread_stack_size)
            .spawn(move || {
                tls::swap_current(Some(Arc::clone(&thread_task)));
                group.await_turn(thread_task.id);

                let token = thread_task.token.clone();
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(&token)));
                if let Err(payload) = &result {
                    tracing::error!(
                        task = %thread_task.id,
                        name = %thread_task.name,
                        "cooperative thread panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
                *slot.lock() = Some(result);

                let last = thread_task.retire();
                tls::swap_current(None);
                if let Some(g) = last {
                    g.switch_out(thread_task.id, Switch::Exit);
                }
            })?;

        self.inner.join();
        task.requeue();
        tracing::trace!(group = %self.inner.name, task = %task.id, "spawned thread");
        Ok(handle)
    }

    /// Spawn an FSM whose first step is `step`
    pub fn spawn_fsm<F>(&self, step: F) -> SchedResult<Fsm>
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.runtime()?;
        if self.is_released() {
            return Err(SchedError::GroupReleased);
        }
        let task = Task::new(
            TaskKind::Fsm,
            None,
            Some(Arc::clone(&self.inner)),
            Duration::ZERO,
        );
        task.fsm.lock().install(Box::new(step));
        self.inner.join();
        task.requeue();
        tracing::trace!(group = %self.inner.name, task = %task.id, "spawned fsm");
        Ok(Fsm::from_task(task))
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Group {}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("members", &self.member_count())
            .finish()
    }
}
