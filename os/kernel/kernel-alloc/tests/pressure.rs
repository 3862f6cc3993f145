mod common;

use common::Machine;
use kernel_alloc::boot::Backend;
use kernel_alloc::{MemoryPressureHandler, PageAllocator, PageAllocatorConfig, PressurePriority};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{SpinLock, register_cpu_id_source};
use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::thread;
use std::time::Duration;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// Each test thread plays a CPU of its own.
fn cpu_id() -> usize {
    CPU.with(Cell::get)
}

/// A cache that takes its time giving pages back.
struct SlowCache {
    pages: Weak<PageAllocator>,
    held: SpinLock<Vec<PhysicalAddress>>,
    released: AtomicBool,
}

impl MemoryPressureHandler for SlowCache {
    fn description(&self) -> &str {
        "slow cache"
    }

    fn compact(&self) -> bool {
        thread::sleep(Duration::from_millis(50));
        let Some(pages) = self.pages.upgrade() else {
            return false;
        };
        let held: Vec<_> = self.held.lock().drain(..).collect();
        let released = !held.is_empty();
        for page in held {
            pages.free_page(page);
        }
        if released {
            self.released.store(true, Ordering::SeqCst);
        }
        released
    }
}

#[test]
fn allocators_wait_for_a_round_running_on_another_cpu() {
    register_cpu_id_source(cpu_id).unwrap();

    let machine = Machine::four_pages(
        Backend::Hosted,
        PageAllocatorConfig::new().with_high_watermark(1),
    );
    let cache = Arc::new(SlowCache {
        pages: Arc::downgrade(&machine.pages),
        held: SpinLock::new(vec![
            machine.pages.allocate_page(),
            machine.pages.allocate_page(),
        ]),
        released: AtomicBool::new(false),
    });
    machine
        .pages
        .pressure()
        .register(cache.clone(), PressurePriority::Normal);

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = (1..=2)
        .map(|cpu| {
            let pages = machine.pages.clone();
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                CPU.with(|id| id.set(cpu));
                barrier.wait();
                let got: Vec<_> = std::iter::from_fn(|| pages.try_allocate_page().ok()).collect();
                assert!(
                    cache.released.load(Ordering::SeqCst),
                    "cpu {cpu} ran out while the cache still held pages"
                );
                got
            })
        })
        .collect();

    let got: Vec<_> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();
    assert_eq!(got.len(), 4);
    assert_eq!(got.iter().collect::<HashSet<_>>().len(), 4);
    assert!(cache.held.lock().is_empty());
}
