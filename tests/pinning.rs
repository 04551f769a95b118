use fiberpool::{bind_to_this_thread, sleep, PinError, Pool, State};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// A pinned fiber, once it has yielded post-pin, resumes only on the worker
// it was pinned to. Violations are counted instead of asserted inside the
// fiber: panics in fiber bodies are swallowed by design.
#[test]
fn pinned_fibers_never_migrate() {
    let pool = Pool::builder().threads(4).build();

    // The constructing thread is the main thread; pinning here must fail.
    assert_eq!(bind_to_this_thread(), Err(PinError));

    let violations = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..10 {
        let violations = violations.clone();
        let completed = completed.clone();
        let handle = pool
            .post(move || {
                bind_to_this_thread().expect("worker threads accept pins");
                let home = std::thread::current().id();
                for _ in 0..100 {
                    sleep(Duration::from_millis(2));
                    if std::thread::current().id() != home {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .expect("pool is running");
        handles.push(handle);
    }

    for handle in &handles {
        handle.join();
        assert!(handle.finished());
    }

    assert_eq!(completed.load(Ordering::SeqCst), 10, "every pinned fiber ran to completion");
    assert_eq!(violations.load(Ordering::SeqCst), 0, "pinned fibers resumed off their worker");

    pool.shutdown(true);
    assert_eq!(pool.state(), State::Stopped);
}
