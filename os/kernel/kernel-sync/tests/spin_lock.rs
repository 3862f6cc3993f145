use kernel_sync::SpinLock;
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_holds_the_lock_until_dropped() {
    let free_pages = SpinLock::new(Vec::from([0x1000_u64, 0x2000]));

    let mut stack = free_pages.lock();
    assert!(free_pages.is_locked());
    assert!(free_pages.try_lock().is_none());
    stack.push(0x3000);
    drop(stack);

    assert!(!free_pages.is_locked());
    assert_eq!(free_pages.with_lock(|s| s.pop()), Some(0x3000));
    assert_eq!(free_pages.into_inner(), [0x1000, 0x2000]);
}

#[test]
fn exclusive_borrow_skips_locking() {
    let mut pins = SpinLock::new(0_u32);
    *pins.get_mut() += 2;
    assert_eq!(*pins.lock(), 2);
}

#[test]
fn debug_never_waits_for_the_lock() {
    let lock = SpinLock::new(7_u8);
    assert_eq!(format!("{lock:?}"), "SpinLock { value: 7 }");

    let _held = lock.lock();
    assert_eq!(format!("{lock:?}"), "SpinLock { value: <held> }");
}

#[test]
fn pops_never_hand_out_the_same_entry_twice() {
    const THREADS: usize = 8;
    const ENTRIES: usize = 4_000;

    let stack = Arc::new(SpinLock::new((0..ENTRIES).collect::<Vec<_>>()));
    let start = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let stack = stack.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let mut taken = Vec::new();
                while let Some(entry) = stack.with_lock(Vec::pop) {
                    taken.push(entry);
                }
                taken
            })
        })
        .collect();

    let mut all: Vec<_> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..ENTRIES).collect::<Vec<_>>());
}

#[test]
fn panicking_holder_still_releases() {
    let lock = SpinLock::new(0_u32);

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|v| {
            *v = 9;
            panic!("fault while holding the lock");
        });
    }));

    assert!(outcome.is_err());
    assert!(!lock.is_locked());
    assert_eq!(*lock.lock(), 9);
}
