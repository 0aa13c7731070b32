use cothread_core::SpinLock;

use super::waitqueue::{immediate, WaitQueue};
use crate::scheduler::suspend;
use crate::task::Outcome;
use crate::tls;

struct State {
    value: usize,
    queue: WaitQueue,
}

/// Counting semaphore
///
/// `up()` hands its permit directly to the longest-waiting `down()`, so
/// the Nth `down()` is satisfied by the Nth `up()`.
pub struct Semaphore {
    state: SpinLock<State>,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Semaphore { state: SpinLock::new(State { value, queue: WaitQueue::new() }) }
    }

    /// Permits available right now
    pub fn value(&self) -> usize {
        self.state.lock().value
    }

    pub fn up(&self) {
        let mut s = self.state.lock();
        if s.queue.wake_one(0).is_none() {
            s.value += 1;
        }
    }

    pub fn try_down(&self) -> bool {
        let mut s = self.state.lock();
        if s.value > 0 {
            s.value -= 1;
            true
        } else {
            false
        }
    }

    /// Register for a permit; a set outcome means the permit is ours
    pub fn wait(&self) -> Outcome {
        let mut s = self.state.lock();
        if s.value > 0 {
            s.value -= 1;
            immediate(0)
        } else {
            s.queue.enqueue_current()
        }
    }

    pub fn down(&self) {
        tls::might_yield();
        loop {
            let permit = self.wait();
            suspend();
            if permit.is_set() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use crate::scheduler::{sleep, timer_wait, yield_now};
    use cothread_core::SpinLock;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(50))).unwrap()
    }

    #[test]
    fn test_try_down() {
        let s = Semaphore::new(1);
        assert!(s.try_down());
        assert!(!s.try_down());
        s.up();
        assert_eq!(s.value(), 1);
    }

    #[test]
    fn test_down_uses_available_permit() {
        let s = Semaphore::new(2);
        s.down();
        s.down();
        assert_eq!(s.value(), 0);
    }

    fn fifo_order(yield_between_ups: bool) -> Vec<usize> {
        let rt = runtime();
        let g = rt.default_group();
        let sema = Arc::new(Semaphore::new(0));
        let order = Arc::new(SpinLock::new(Vec::new()));
        rt.block_on(&g, || {
            let mut handles = Vec::new();
            for i in 0..10 {
                let sema = Arc::clone(&sema);
                let order = Arc::clone(&order);
                handles.push(
                    g.spawn(move |_| {
                        sema.down();
                        order.lock().push(i);
                    })
                    .unwrap(),
                );
            }
            // Let every thread block in down() in spawn order.
            yield_now();
            for _ in 0..10 {
                sema.up();
                if yield_between_ups {
                    yield_now();
                }
            }
            for h in handles {
                h.join();
            }
        });
        let v = order.lock().clone();
        v
    }

    #[test]
    fn test_fifo_wakeup() {
        assert_eq!(fifo_order(false), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_fifo_wakeup_with_yield() {
        assert_eq!(fifo_order(true), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_alternating_wakers() {
        // Two producers on different groups feeding one consumer.
        let rt = runtime();
        let other = rt.create_group("producer").unwrap();
        let sema = Arc::new(Semaphore::new(0));
        let s1 = Arc::clone(&sema);
        let consumer = rt
            .default_group()
            .spawn(move |_| {
                for _ in 0..20 {
                    s1.down();
                }
            })
            .unwrap();
        let mut producers = Vec::new();
        for g in [rt.default_group(), other] {
            let s = Arc::clone(&sema);
            producers.push(
                g.spawn(move |_| {
                    for _ in 0..10 {
                        s.up();
                        yield_now();
                    }
                })
                .unwrap(),
            );
        }
        for p in producers {
            p.join();
        }
        consumer.join();
        assert_eq!(sema.value(), 0);
    }

    #[test]
    fn test_up_skips_timed_out_waiter() {
        let rt = runtime();
        let g = rt.default_group();
        let sema = Arc::new(Semaphore::new(0));
        rt.block_on(&g, || {
            let s = Arc::clone(&sema);
            let timed = g
                .spawn(move |_| {
                    let permit = s.wait();
                    timer_wait(Instant::now() + Duration::from_millis(20));
                    suspend();
                    permit.is_set()
                })
                .unwrap();
            yield_now();
            let s = Arc::clone(&sema);
            let patient = g.spawn(move |_| s.down()).unwrap();
            yield_now();

            sleep(Duration::from_millis(60));
            assert!(!timed.join());
            // The permit goes to the live waiter, not the expired one.
            sema.up();
            patient.join();
            assert_eq!(sema.value(), 0);
            sema.up();
            assert_eq!(sema.value(), 1);
        });
    }
}
