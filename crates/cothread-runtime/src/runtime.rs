//! Runtime: owner of thread groups and their driver threads
//!
//! There is no process-wide scheduler. Each `Runtime` value owns its
//! groups, so independent runtimes can coexist in one process (and in one
//! test binary).

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle as OsJoinHandle;

use cothread_core::{SchedError, SchedResult, SpinLock};

use crate::config::RuntimeConfig;
use crate::group::{Group, GroupInner};
use crate::scheduler;

pub(crate) struct RuntimeShared {
    pub(crate) config: RuntimeConfig,
    groups: SpinLock<Vec<Arc<GroupInner>>>,
    drivers: Mutex<Vec<OsJoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl RuntimeShared {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn fd_closed(&self, fd: RawFd) {
        let groups: Vec<Arc<GroupInner>> = self.groups.lock().clone();
        for g in groups {
            g.fd_closed(fd);
        }
    }
}

/// A set of thread groups plus the driver threads that run them
///
/// ```ignore
/// let rt = Runtime::new(RuntimeConfig::from_env())?;
/// let group = rt.default_group();
/// let answer = rt.block_on(&group, || {
///     let h = group.spawn(|_| 6 * 7).unwrap();
///     h.join()
/// });
/// ```
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    default_group: Group,
}

impl Runtime {
    /// Create a runtime and start its default group
    pub fn new(config: RuntimeConfig) -> SchedResult<Self> {
        config.validate().map_err(|e| SchedError::Config(e.to_string()))?;
        let default_name = config.default_group_name.clone();
        let shared = Arc::new(RuntimeShared {
            config,
            groups: SpinLock::new(Vec::new()),
            drivers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        let default_group = Self::start_group(&shared, &default_name)?;
        tracing::debug!(group = %default_name, "runtime started");
        Ok(Self { shared, default_group })
    }

    /// Create a runtime from library defaults plus `COT_*` overrides
    pub fn from_env() -> SchedResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    fn start_group(shared: &Arc<RuntimeShared>, name: &str) -> SchedResult<Group> {
        if shared.is_shut_down() {
            return Err(SchedError::ShutDown);
        }
        let inner = GroupInner::new(name, Arc::downgrade(shared), shared.config.max_poll_wait)?;
        let driver = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("cot-{}", name))
            .spawn(move || driver.drive())?;
        shared.groups.lock().push(Arc::clone(&inner));
        shared
            .drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(Group::from_inner(inner))
    }

    /// The group created at startup
    pub fn default_group(&self) -> Group {
        self.default_group.clone()
    }

    /// Create a new thread group with its own driver thread
    pub fn create_group(&self, name: &str) -> SchedResult<Group> {
        Self::start_group(&self.shared, name)
    }

    /// All groups created by this runtime, including released ones
    pub fn groups(&self) -> Vec<Group> {
        self.shared
            .groups
            .lock()
            .iter()
            .map(|g| Group::from_inner(Arc::clone(g)))
            .collect()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Run `f` on the calling OS thread as a cooperative thread of `group`
    ///
    /// The caller joins the group for the duration of `f` and is migrated
    /// back out afterwards, also when `f` panics.
    pub fn block_on<R>(&self, group: &Group, f: impl FnOnce() -> R) -> R {
        assert!(!self.shared.is_shut_down(), "block_on on a shut down runtime");
        let previous = scheduler::migrate(Some(group));
        let _back = MigrateBack(previous);
        f()
    }

    /// Wake every task of this runtime blocked on `fd`, with POLLNVAL
    ///
    /// Call before closing a descriptor other tasks may be waiting on.
    pub fn fd_closed(&self, fd: RawFd) {
        self.shared.fd_closed(fd);
    }

    /// Stop all drivers once their ready queues drain
    ///
    /// Tasks still blocked are abandoned.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("runtime shutting down");
        for g in self.shared.groups.lock().iter() {
            g.kick();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        let drivers = std::mem::take(
            &mut *self.shared.drivers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let me = std::thread::current().id();
        for d in drivers {
            if d.thread().id() != me {
                let _ = d.join();
            }
        }
    }
}

/// Migrates the caller back where it came from, even while unwinding
struct MigrateBack(Option<Group>);

impl Drop for MigrateBack {
    fn drop(&mut self) {
        scheduler::migrate_unchecked(self.0.as_ref());
    }
}
