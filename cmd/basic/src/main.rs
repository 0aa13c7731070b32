//! Basic cothread example
//!
//! Two thread groups, a few cooperative threads sharing a mutex, an FSM
//! counting timer ticks and a thread that migrates out of its group around
//! a blocking call.
//!
//! # Environment Variables
//!
//! - `COT_LOG=debug` - log filter (EnvFilter syntax)
//! - `COT_MAX_POLL_WAIT_MS` - upper bound of one idle poll

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cothread::{fsm, suspend, timer_wait, yield_now, Mutex, NativeSection, Runtime, SchedResult};
use tracing::{debug, info};

// COT_LOG=debug cargo run -p cothread-basic
fn main() -> SchedResult<()> {
    cothread::init_logging();
    println!("=== cothread Basic Example ===\n");

    let runtime = Runtime::from_env()?;
    let main_group = runtime.default_group();
    let side_group = runtime.create_group("side")?;

    // Three threads of one group bumping a shared counter; only one of
    // them runs at any instant, the mutex guards against the side group.
    let total = Arc::new(Mutex::new(0usize));
    let mut handles = Vec::new();
    for i in 1..=3 {
        let total = Arc::clone(&total);
        let h = main_group.spawn_named(&format!("worker-{i}"), move |_token| {
            for j in 0..3 {
                *total.lock() += 1;
                debug!(worker = i, iteration = j, "bumped");
                yield_now();
            }
            i
        })?;
        println!("Spawned worker {} (ID={})", i, h.id());
        handles.push(h);
    }

    let side_total = Arc::clone(&total);
    let side = side_group.spawn(move |_token| {
        *side_total.lock() += 10;
        "side done"
    })?;

    // An FSM that re-arms a timer five times and exits.
    let ticks = Arc::new(AtomicUsize::new(0));
    let fsm_ticks = Arc::clone(&ticks);
    let ticker = main_group.spawn_fsm(move || {
        if fsm_ticks.fetch_add(1, Ordering::SeqCst) == 4 {
            fsm::exit();
            return;
        }
        timer_wait(Instant::now() + Duration::from_millis(10));
        suspend();
    })?;

    // A thread stepping outside its group for a blocking sleep.
    let migrated = main_group.spawn(|_token| {
        let section = NativeSection::enter();
        let from = section.previous_group().map(|g| g.name().to_owned());
        std::thread::sleep(Duration::from_millis(20));
        drop(section);
        from
    })?;

    for h in handles {
        let i = h.join();
        println!("worker {} finished", i);
    }
    println!("{}", side.join());
    println!("migrated thread came back from {:?}", migrated.join());
    ticker.join_completion().block();

    info!(total = *total.lock(), ticks = ticks.load(Ordering::SeqCst), "all tasks finished");
    println!("\ncounter = {} (expected 19), fsm steps = {}", *total.lock(), ticks.load(Ordering::SeqCst));
    println!("\n=== Example Complete ===");
    Ok(())
}
