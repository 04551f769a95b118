use fiberpool::{bind_to_this_thread, get_pool, is_interrupted, sleep, yield_now};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("fiberpool - pooled user-space fiber runtime\n");

    let pool = get_pool(Some(4));
    println!("pool started ({:?})\n", pool.state());

    // Example 1: fire-and-forget posts
    println!("Example 1: parallel posts");
    let sum = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for i in 0..10_000 {
        let sum = sum.clone();
        pool.post(move || {
            sum.fetch_add(i, Ordering::Relaxed);
        })
        .expect("pool is running");
    }
    while pool.fiber_count() > 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!(
        "  10000 tasks in {:?}, sum = {} (expected {})\n",
        start.elapsed(),
        sum.load(Ordering::Relaxed),
        (0..10_000usize).sum::<usize>()
    );

    // Example 2: a result through a future
    println!("Example 2: submit with a result");
    let future = pool.submit(|| 6).expect("pool is running");
    println!("  submit(|| 6) resolved to {}\n", future.get().unwrap());

    // Example 3: pinning and cooperative interruption
    println!("Example 3: pinned fiber polling for interruption");
    pool.post(|| {
        bind_to_this_thread().expect("running on a worker");
        let mut laps = 0u32;
        while !is_interrupted() {
            laps += 1;
            if laps % 100 == 0 {
                sleep(Duration::from_millis(1));
            } else {
                yield_now();
            }
        }
        println!("  pinned fiber interrupted after {} laps", laps);
    })
    .expect("pool is running");

    std::thread::sleep(Duration::from_millis(50));
    pool.shutdown(true);
    println!("\npool state: {:?}", pool.state());
}
