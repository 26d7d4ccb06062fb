//! End-to-end concurrency scenarios: multiple threads contending for one
//! [`Lock`] over a shared lockfile path, using a test time unit `T` and a
//! polling cadence much shorter than it so ordering assertions aren't
//! flaky.
//!
//! Wires up `tracing-subscriber` for test output (`TWLOCK_LOG=debug cargo
//! test -- --nocapture` to see it).

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use twlock::{Lock, Mode};

const T: Duration = Duration::from_millis(20);
const POLL: Duration = Duration::from_millis(2);

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt as _, EnvFilter, Layer as _, Registry};

    let _ = tracing::subscriber::set_global_default(
        Registry::default().with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(tracing::level_filters::LevelFilter::WARN.into())
                        .parse_lossy(std::env::var("TWLOCK_LOG").unwrap_or_default()),
                ),
        ),
    );
}

fn new_lock() -> (tempfile::TempDir, Arc<Lock>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lockfile");
    let lock = Lock::with_poll_interval(path, POLL).unwrap();
    (dir, Arc::new(lock))
}

/// Two independent [`Lock`] objects bound to the same path, the way two
/// unrelated processes would each construct their own, as opposed to
/// [`new_lock`], which is shared (via `Arc`) to test in-process threading.
fn two_locks_on_same_path() -> (tempfile::TempDir, Lock, Lock) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lockfile");
    let a = Lock::with_poll_interval(&path, POLL).unwrap();
    let b = Lock::with_poll_interval(&path, POLL).unwrap();
    (dir, a, b)
}

#[test]
fn writers_serialise() {
    init_tracing();
    let (_dir, lock) = new_lock();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let lock = lock.clone();
            let order = order.clone();
            thread::spawn(move || {
                let _guard = lock.exclusive(None, None).unwrap();
                order.lock().unwrap().push((i, "enter"));
                thread::sleep(T * 10);
                order.lock().unwrap().push((i, "leave"));
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 10);
    for pair in order.chunks(2) {
        let [(enter_i, enter_tag), (leave_i, leave_tag)] = pair else {
            panic!("expected enter/leave pairs")
        };
        assert_eq!(*enter_tag, "enter");
        assert_eq!(*leave_tag, "leave");
        assert_eq!(enter_i, leave_i, "a writer observed inside another writer's span");
    }
}

#[test]
fn readers_overlap() {
    init_tracing();
    let (_dir, lock) = new_lock();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let lock = lock.clone();
            let order = order.clone();
            thread::spawn(move || {
                thread::sleep(T * i);
                let _guard = lock.concurrent(None, None).unwrap();
                order.lock().unwrap().push(i);
                thread::sleep(T * 10);
                order.lock().unwrap().push(i);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 10);
    // Each reader leaves in its entry position: proof they overlapped
    // rather than running one at a time.
    assert_eq!(&order[..5], &order[5..]);
}

#[test]
fn reader_writer_ordering() {
    init_tracing();
    let (_dir, lock) = new_lock();
    let enters: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let leaves: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let spawn_reader = |name: &'static str, delay: Duration, hold: Duration| {
        let lock = lock.clone();
        let enters = enters.clone();
        let leaves = leaves.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _guard = lock.concurrent(None, None).unwrap();
            enters.lock().unwrap().push(name);
            thread::sleep(hold);
            leaves.lock().unwrap().push(name);
        })
    };
    let spawn_writer = |name: &'static str, delay: Duration, hold: Duration| {
        let lock = lock.clone();
        let enters = enters.clone();
        let leaves = leaves.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _guard = lock.exclusive(None, None).unwrap();
            enters.lock().unwrap().push(name);
            thread::sleep(hold);
            leaves.lock().unwrap().push(name);
        })
    };

    let r1 = spawn_reader("R1", Duration::ZERO, T * 3);
    let w1 = spawn_writer("W1", T, T * 2);
    let r2 = spawn_reader("R2", T * 2, T * 2);
    let r3 = spawn_reader("R3", T * 3, T * 4);
    let r4 = spawn_reader("R4", T * 4, T * 6);

    for h in [r1, w1, r2, r3, r4] {
        h.join().unwrap();
    }

    let enters = enters.lock().unwrap();
    assert_eq!(&enters[..2], &["R1", "W1"]);

    let leaves = leaves.lock().unwrap();
    assert_eq!(&leaves[..], &["R1", "W1", "R2", "R3", "R4"]);
}

#[test]
fn nested_readers_block_writer_until_all_exit() {
    init_tracing();
    let (_dir, lock) = new_lock();

    // Five nested concurrent scopes on one object: the reentrancy count
    // should track each `concurrent()` call independently.
    let g1 = lock.concurrent(None, None).unwrap();
    let g2 = lock.concurrent(None, None).unwrap();
    let g3 = lock.concurrent(None, None).unwrap();
    let g4 = lock.concurrent(None, None).unwrap();
    let g5 = lock.concurrent(None, None).unwrap();
    assert_eq!(lock.state().concurrent, 5);

    let writer_done = Arc::new(Mutex::new(false));
    let writer_lock = lock.clone();
    let writer_flag = writer_done.clone();
    let writer = thread::spawn(move || {
        let _guard = writer_lock.exclusive(None, Some(T * 100)).unwrap();
        *writer_flag.lock().unwrap() = true;
    });

    thread::sleep(T * 2);
    assert!(!*writer_done.lock().unwrap(), "writer acquired before readers released");

    drop(g1);
    drop(g2);
    drop(g3);
    drop(g4);
    drop(g5);

    writer.join().unwrap();
    assert!(*writer_done.lock().unwrap());
}

#[test]
fn concurrent_acquire_never_times_out_against_other_concurrent_holders() {
    init_tracing();
    let (_dir, a, b) = two_locks_on_same_path();

    let _held = a.concurrent(None, None).unwrap();
    let result = b.acquire(Mode::Concurrent, None, Some(T * 2));
    assert!(result.is_ok());
    b.release().unwrap();
}

#[test]
fn concurrent_waiter_times_out_against_exclusive_holder() {
    init_tracing();
    let (_dir, a, b) = two_locks_on_same_path();

    let _held = a.exclusive(None, None).unwrap();

    let start = std::time::Instant::now();
    let result = b.acquire(Mode::Concurrent, None, Some(T * 2));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(twlock::LockError::Timeout { .. })));
    assert!(elapsed >= T * 2);
    assert!(elapsed < T * 10, "timeout fired far later than the deadline");
}

#[test]
fn exclusive_waiter_times_out_against_concurrent_holder() {
    init_tracing();
    let (_dir, a, b) = two_locks_on_same_path();

    let _held = a.concurrent(None, None).unwrap();

    let start = std::time::Instant::now();
    let result = b.acquire(Mode::Exclusive, None, Some(T * 2));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(twlock::LockError::Timeout { .. })));
    assert!(elapsed >= T * 2);
    assert!(elapsed < T * 10, "timeout fired far later than the deadline");

    // The object must not be left mid-acquisition after a failed attempt.
    assert_eq!(b.mode(), Mode::None);
}

#[test]
fn exclusive_waiter_times_out_against_exclusive_holder() {
    init_tracing();
    let (_dir, a, b) = two_locks_on_same_path();

    let _held = a.exclusive(None, None).unwrap();

    let start = std::time::Instant::now();
    let result = b.acquire(Mode::Exclusive, None, Some(T * 2));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(twlock::LockError::Timeout { .. })));
    assert!(elapsed >= T * 2);
    assert!(elapsed < T * 10, "timeout fired far later than the deadline");
}
