use fiberpool::{is_interrupted, sleep, Pool, State};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Interruption is cooperative: a flag set before the first schedule skips
// the body entirely, a flag set mid-flight is observed at the next poll, and
// shutdown interrupts every cooperative fiber. Phases run in order on one
// pool; shutdown is terminal.
#[test]
fn interruption_protocol() {
    let pool = Pool::builder().threads(1).build();

    // --- A fiber interrupted before its first schedule never runs its body.
    // One worker, kept busy by a gate, guarantees the victim is still queued
    // when the interrupt lands.
    let gate = Arc::new(AtomicBool::new(false));
    let gate_in = gate.clone();
    pool.post(move || {
        while !gate_in.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
    })
    .expect("pool is running");

    let victim_ran = Arc::new(AtomicBool::new(false));
    let victim_ran_in = victim_ran.clone();
    let victim = pool
        .post(move || {
            victim_ran_in.store(true, Ordering::SeqCst);
        })
        .expect("pool is running");

    victim.interrupt();
    gate.store(true, Ordering::SeqCst);
    victim.join();
    assert!(victim.finished());
    assert!(!victim_ran.load(Ordering::SeqCst), "skipped body must not run");

    // --- A targeted interrupt stops a polling loop.
    let laps = Arc::new(AtomicBool::new(false));
    let laps_in = laps.clone();
    let looper = pool
        .post(move || {
            while !is_interrupted() {
                laps_in.store(true, Ordering::SeqCst);
                sleep(Duration::from_millis(5));
            }
        })
        .expect("pool is running");

    // Let it make at least one lap, then interrupt.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !laps.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "looper never started");
        std::thread::sleep(Duration::from_millis(1));
    }
    looper.interrupt();
    looper.join();
    assert!(looper.finished());

    // --- Shutdown interrupts a sleeping loop: the fiber observes
    // is_interrupted() on its next wakeup, so shutdown(wait = true)
    // completes within roughly one sleep interval.
    pool.post(|| loop {
        sleep(Duration::from_millis(500));
        if is_interrupted() {
            break;
        }
    })
    .expect("pool is running");

    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    pool.shutdown(true);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown must complete within one sleep interval plus drain slack, took {:?}",
        started.elapsed()
    );
    assert_eq!(pool.state(), State::Stopped);
    assert_eq!(pool.fiber_count(), 0);
}
