//! Semaphore fairness demo
//!
//! Waiters queue on a zero-valued semaphore one after another; each `up()`
//! hands the unit straight to the longest waiter, so they finish in the
//! order they arrived.
//!
//! ```text
//! cargo run -p cothread-coop-sema -- 8
//! ```

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use cothread::{yield_now, Runtime, SchedResult, Semaphore};
use tracing::info;

fn main() -> SchedResult<()> {
    cothread::init_logging();

    let waiters: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let runtime = Runtime::from_env()?;
    let group = runtime.default_group();
    let sema = Arc::new(Semaphore::new(0));
    let order = Arc::new(StdMutex::new(Vec::with_capacity(waiters)));

    runtime.block_on(&group, || -> SchedResult<()> {
        let mut handles = Vec::with_capacity(waiters);
        for i in 0..waiters {
            let sema = Arc::clone(&sema);
            let order = Arc::clone(&order);
            handles.push(group.spawn_named(&format!("waiter-{i}"), move |_token| {
                sema.down();
                order.lock().unwrap_or_else(PoisonError::into_inner).push(i);
            })?);
        }
        // Every waiter blocks in down() in spawn order.
        yield_now();
        for _ in 0..waiters {
            sema.up();
        }
        for h in handles {
            h.join();
        }
        Ok(())
    })?;

    let order = order.lock().unwrap_or_else(PoisonError::into_inner).clone();
    let fair = order.windows(2).all(|w| w[0] < w[1]);
    info!(waiters, ?order, fair, "semaphore drained");
    println!("wake order: {:?}", order);
    println!("{}", if fair { "FIFO: ok" } else { "FIFO: VIOLATED" });
    if !fair {
        std::process::exit(1);
    }
    Ok(())
}
