use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const FULL: u8 = 2;

/// Write-once storage for boot-time singletons: the kernel address space,
/// the CPU id source.
///
/// Readers never block; a reader racing the single writer simply sees the
/// cell as empty.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    slot: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the slot is written once, before `FULL` is published, and only
// read after observing `FULL`.
unsafe impl<T: Send + Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: `FULL` was stored with release ordering after the write.
        (self.state.load(Ordering::Acquire) == FULL)
            .then(|| unsafe { (*self.slot.get()).assume_init_ref() })
    }

    /// Store `value` if the cell is still empty.
    ///
    /// # Errors
    /// Hands `value` back if the cell was filled, or is being filled, first.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self.claim() {
            self.publish(value);
            Ok(())
        } else {
            Err(value)
        }
    }

    /// The stored value, running `init` to produce it if the cell is empty.
    /// Concurrent callers wait for whichever one got to run `init`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if self.claim() {
            self.publish(init());
        }
        loop {
            if let Some(value) = self.get() {
                return value;
            }
            spin_loop();
        }
    }

    /// Become the one writer.
    fn claim(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn publish(&self, value: T) {
        // SAFETY: `claim` succeeded, so no one else writes or reads the slot.
        unsafe { (*self.slot.get()).write(value) };
        self.state.store(FULL, Ordering::Release);
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == FULL {
            // SAFETY: the slot was written and nothing moved it out.
            unsafe { self.slot.get_mut().assume_init_drop() }
        }
    }
}
