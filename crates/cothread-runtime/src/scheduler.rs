//! Scheduler entry points for the current task
//!
//! Registration calls (`fd_wait`, `timer_wait`, primitive `wait`s) add to
//! the current task's wait set and return an [`Outcome`]. One `suspend()`
//! consumes the whole set and returns once at least one of them fired:
//!
//! ```ignore
//! let readable = fd_read_wait(sock);
//! let timeout = timer_wait(deadline);
//! suspend();
//! if timeout.is_set() { /* gave up */ }
//! ```

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cothread_core::{TaskKind, TaskState};

use crate::fsm::{self, Disposition};
use crate::group::{Group, Switch};
use crate::poller::PollSet;
use crate::sync::waitqueue;
use crate::task::Outcome;
use crate::tls;

/// Readiness a descriptor wait asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    pub(crate) fn events(self) -> i16 {
        match self {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        }
    }
}

/// Register interest in `fd`; the outcome carries `revents`
pub fn fd_wait(fd: RawFd, interest: Interest) -> Outcome {
    tls::current().register_fd(fd, interest.events())
}

pub fn fd_read_wait(fd: RawFd) -> Outcome {
    fd_wait(fd, Interest::Read)
}

pub fn fd_write_wait(fd: RawFd) -> Outcome {
    fd_wait(fd, Interest::Write)
}

/// Register an absolute deadline; an expired one fires on the next `suspend()`
pub fn timer_wait(deadline: Instant) -> Outcome {
    tls::current().register_timer(deadline)
}

/// Make the next `suspend()` return at once
pub fn immediate_wake() -> Outcome {
    waitqueue::immediate(0)
}

/// Block until at least one registration fires
///
/// Without registrations a thread blocks forever. Inside an FSM step this
/// only records the disposition; the step must return afterwards.
pub fn suspend() {
    debug_assert_eq!(tls::critical_depth(), 0, "suspend inside a critical section");
    let task = tls::current();
    match task.kind {
        TaskKind::Fsm => fsm::set_disposition(&task, Disposition::Block),
        TaskKind::Thread => task.suspend_thread(),
    }
}

/// Let the other tasks of the group run
pub fn yield_now() {
    let task = tls::current();
    if task.kind == TaskKind::Fsm {
        return fsm::set_disposition(&task, Disposition::Yield);
    }
    tls::might_yield();
    match task.group() {
        Some(group) => group.switch_out(task.id, Switch::Yield),
        None => std::thread::yield_now(),
    }
}

/// Check registrations without suspending
///
/// Returns true if one already fired, i.e. `suspend()` would return at once.
pub fn poll() -> bool {
    let task = tls::current();
    let (epoch, fds, timers) = task.snapshot_waits();
    let now = Instant::now();
    let mut fired = false;
    for t in timers.iter().filter(|t| t.deadline <= now) {
        fired |= task.fire(epoch, &t.outcome, 1);
    }
    if !fds.is_empty() {
        let mut set = PollSet::new();
        for w in &fds {
            set.add(w.fd, w.events);
        }
        match set.poll(Some(Duration::ZERO)) {
            Ok(0) => {}
            Ok(_) => {
                for (i, w) in fds.iter().enumerate() {
                    let revents = set.revents(i);
                    if revents != 0 {
                        fired |= task.fire(epoch, &w.outcome, i32::from(revents));
                    }
                }
            }
            Err(e) => tracing::error!(task = %task.id, error = %e, "poll failed"),
        }
    }
    fired || task.sched().woken_early
}

pub fn sleep(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

pub fn sleep_until(deadline: Instant) {
    tls::might_yield();
    timer_wait(deadline);
    suspend();
}

/// Wait for one readiness on `fd`; returns `revents`
pub fn fd_block(fd: RawFd, interest: Interest) -> i16 {
    tls::might_yield();
    let outcome = fd_wait(fd, interest);
    suspend();
    outcome.get().map_or(0, |v| v as i16)
}

/// Wake every task blocked on `fd` with POLLNVAL
///
/// Call before closing a descriptor another task may be waiting on. Covers
/// every group of the caller's runtime; a no-op outside any group.
pub fn fd_closed(fd: RawFd) {
    if let Some(rt) = tls::current().group().and_then(|g| g.runtime.upgrade()) {
        rt.fd_closed(fd);
    }
}

/// Move the current thread to `target`, or out of every group for `None`
///
/// Returns the group the thread was in. While the thread is out, the rest
/// of its old group keeps running.
pub fn migrate(target: Option<&Group>) -> Option<Group> {
    migrate_inner(target, true)
}

/// Migration that discards pending registrations instead of asserting
pub(crate) fn migrate_unchecked(target: Option<&Group>) -> Option<Group> {
    migrate_inner(target, false)
}

fn migrate_inner(target: Option<&Group>, checked: bool) -> Option<Group> {
    let task = tls::current();
    assert_eq!(task.kind, TaskKind::Thread, "FSMs cannot migrate");
    if checked {
        tls::might_yield();
    } else {
        task.discard_waits();
    }

    let target_inner = target.map(|g| Arc::clone(&g.inner));
    let previous = {
        let mut s = task.sched();
        let same = match (&s.group, &target_inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return s.group.clone().map(Group::from_inner);
        }
        let previous = std::mem::replace(&mut s.group, target_inner.clone());
        match &target_inner {
            Some(_) => {
                s.state = TaskState::Ready;
                s.queued = true;
            }
            None => s.state = TaskState::Native,
        }
        previous
    };

    if let Some(old) = &previous {
        old.leave();
        old.switch_out(task.id, Switch::Migrate);
    }
    if let Some(new) = &target_inner {
        new.join();
        new.push_ready(Arc::clone(&task));
        new.await_turn(task.id);
    }
    tracing::trace!(
        task = %task.id,
        from = previous.as_ref().map_or("native", |g| g.name.as_str()),
        to = target_inner.as_ref().map_or("native", |g| g.name.as_str()),
        "migrated"
    );
    previous.map(Group::from_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap()
    }

    #[test]
    fn test_native_sleep() {
        let start = Instant::now();
        sleep(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_immediate_wake_returns_at_once() {
        let o = immediate_wake();
        assert!(poll());
        suspend();
        assert_eq!(o.get(), Some(0));
    }

    #[test]
    fn test_poll_sees_expired_timer() {
        let o = timer_wait(Instant::now());
        assert!(poll());
        assert_eq!(o.get(), Some(1));
        suspend();
    }

    #[test]
    fn test_suspend_returns_on_earliest_event() {
        let rt = runtime();
        let g = rt.default_group();
        let (mut a, b) = UnixStream::pair().unwrap();
        let h = g
            .spawn(move |_| {
                let readable = fd_read_wait(b.as_raw_fd());
                let timeout = timer_wait(Instant::now() + Duration::from_secs(5));
                suspend();
                (readable.is_set(), timeout.is_set())
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        a.write_all(b"x").unwrap();
        assert_eq!(h.join(), (true, false));
    }

    #[test]
    fn test_timer_wakes_group_thread() {
        let rt = runtime();
        let g = rt.default_group();
        let h = g
            .spawn(|_| {
                let start = Instant::now();
                sleep(Duration::from_millis(30));
                start.elapsed()
            })
            .unwrap();
        assert!(h.join() >= Duration::from_millis(30));
    }

    #[test]
    fn test_yield_interleaves_threads() {
        let rt = runtime();
        let g = rt.default_group();
        let log = Arc::new(cothread_core::SpinLock::new(Vec::new()));
        // Spawn from inside the group so neither thread starts before both exist.
        rt.block_on(&g, || {
            let mut handles = Vec::new();
            for n in 0..2 {
                let log = Arc::clone(&log);
                handles.push(
                    g.spawn(move |_| {
                        for i in 0..3 {
                            log.lock().push((n, i));
                            yield_now();
                        }
                    })
                    .unwrap(),
                );
            }
            for h in handles {
                h.join();
            }
        });
        let log = log.lock();
        assert_eq!(log.len(), 6);
        // Strict alternation: nobody runs twice in a row while the other is ready.
        for pair in log.windows(2) {
            assert_ne!(pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn test_fd_closed_wakes_with_nval() {
        let rt = runtime();
        let g = rt.default_group();
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();
        let h = g.spawn(move |_| fd_block(fd, Interest::Read)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        rt.fd_closed(fd);
        assert_ne!(h.join() & libc::POLLNVAL, 0);
    }

    #[test]
    fn test_migrate_out_and_back() {
        let rt = runtime();
        let g = rt.default_group();
        let g2 = g.clone();
        let h = g
            .spawn(move |_| {
                let prev = migrate(None);
                let native = tls::current().group().is_none();
                std::thread::sleep(Duration::from_millis(5));
                migrate(prev.as_ref());
                (native, tls::current().group().map(Group::from_inner) == Some(g2))
            })
            .unwrap();
        assert_eq!(h.join(), (true, true));
    }

    #[test]
    fn test_migrate_between_groups() {
        let rt = runtime();
        let a = rt.default_group();
        let b = rt.create_group("other").unwrap();
        let b2 = b.clone();
        let h = a
            .spawn(move |_| {
                migrate(Some(&b2));
                tls::current().group().map(|g| g.name.clone())
            })
            .unwrap();
        assert_eq!(h.join().as_deref(), Some("other"));
        assert_eq!(a.member_count(), 0);
    }
}
