use kernel_sync::SyncOnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn set_then_get() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(5u32), Ok(()));
    assert_eq!(cell.get(), Some(&5));
}

#[test]
fn second_set_hands_the_value_back() {
    let cell = SyncOnceCell::new();
    cell.set(String::from("kernel")).unwrap();
    assert_eq!(cell.set(String::from("user")), Err(String::from("user")));
    assert_eq!(cell.get().map(String::as_str), Some("kernel"));
}

#[test]
fn get_or_init_runs_once_under_contention() {
    let threads = 8;
    let cell = Arc::new(SyncOnceCell::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                *cell.get_or_init(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
        })
        .collect();

    let seen: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn value_is_dropped_with_the_cell() {
    let marker = Arc::new(());
    {
        let cell = SyncOnceCell::new();
        cell.set(Arc::clone(&marker)).unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}
