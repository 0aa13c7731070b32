use cothread_core::SpinLock;

use super::waitqueue::{immediate, WaitQueue};
use crate::scheduler::suspend;
use crate::task::Outcome;
use crate::tls;

struct State {
    arrived: usize,
    queue: WaitQueue,
}

/// Releases `count` arrivals together once the last one arrives
///
/// Reusable: the next round starts as soon as one is released.
pub struct Barrier {
    count: usize,
    state: SpinLock<State>,
}

impl Barrier {
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "barrier count must be positive");
        Barrier { count, state: SpinLock::new(State { arrived: 0, queue: WaitQueue::new() }) }
    }

    /// Arrive; the outcome is 1 for the arrival that completed the round
    pub fn wait(&self) -> Outcome {
        let mut s = self.state.lock();
        s.arrived += 1;
        if s.arrived == self.count {
            s.arrived = 0;
            s.queue.wake_all(0);
            immediate(1)
        } else {
            s.queue.enqueue_current()
        }
    }

    /// Arrive and wait for the round; true for exactly one arrival
    pub fn block(&self) -> bool {
        tls::might_yield();
        let released = self.wait();
        suspend();
        released.get() == Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_single_arrival_passes() {
        let b = Barrier::new(1);
        assert!(b.block());
        assert!(b.block());
    }

    #[test]
    fn test_releases_all_together() {
        let rt = Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap();
        let barrier = Arc::new(Barrier::new(4));
        let before = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = Arc::clone(&barrier);
                let before = Arc::clone(&before);
                rt.default_group()
                    .spawn(move |_| {
                        before.fetch_add(1, Ordering::SeqCst);
                        let leader = b.block();
                        // Nobody gets past before everyone arrived.
                        assert_eq!(before.load(Ordering::SeqCst), 4);
                        leader
                    })
                    .unwrap()
            })
            .collect();
        let leaders = handles.into_iter().map(|h| h.join()).filter(|l| *l).count();
        assert_eq!(leaders, 1);
    }
}
