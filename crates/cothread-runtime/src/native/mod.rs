//! Native-migration bridge
//!
//! System calls without a usable non-blocking mode run with the calling
//! thread migrated out of its group, so the rest of the group keeps going
//! while the call blocks.
//!
//! ```text
//!   group g: [t1] [t2] [t3]          group g: [t1] [t3]
//!                  │    enter()                 ▲
//!                  ▼                            │ drop
//!            t2 on its own OS thread ── open() ─┘
//! ```

pub mod file;

use std::marker::PhantomData;

use crate::group::Group;
use crate::scheduler;

/// Scope during which the current thread runs outside any group
pub struct NativeSection {
    previous: Option<Group>,
    _not_send: PhantomData<*const ()>,
}

impl NativeSection {
    pub fn enter() -> Self {
        let previous = scheduler::migrate(None);
        NativeSection { previous, _not_send: PhantomData }
    }

    /// The group the thread returns to when the section ends
    pub fn previous_group(&self) -> Option<&Group> {
        self.previous.as_ref()
    }
}

impl Drop for NativeSection {
    fn drop(&mut self) {
        if std::thread::panicking() {
            scheduler::migrate_unchecked(self.previous.as_ref());
        } else {
            scheduler::migrate(self.previous.as_ref());
        }
    }
}

/// Run `f` inside a [`NativeSection`]
pub fn run_native<R>(f: impl FnOnce() -> R) -> R {
    let _section = NativeSection::enter();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::scheduler::yield_now;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_group_keeps_running_while_migrated() {
        let rt = Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap();
        let g = rt.default_group();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let g2 = g.clone();
        let blocker = g
            .spawn(move |_| {
                let seen = run_native(|| {
                    // A blocking call: the group must not stall behind it.
                    std::thread::sleep(Duration::from_millis(50));
                    t.load(Ordering::SeqCst)
                });
                (seen, crate::tls::current().group().map(Group::from_inner) == Some(g2))
            })
            .unwrap();
        let ticks2 = Arc::clone(&ticks);
        let ticker = g
            .spawn(move |_| {
                for _ in 0..10 {
                    ticks2.fetch_add(1, Ordering::SeqCst);
                    crate::scheduler::sleep(Duration::from_millis(1));
                    yield_now();
                }
            })
            .unwrap();
        let (seen, back_home) = blocker.join();
        ticker.join();
        assert!(seen > 0);
        assert!(back_home);
    }

    #[test]
    fn test_section_outside_group_is_noop() {
        let s = NativeSection::enter();
        assert!(s.previous_group().is_none());
    }
}
