//! # Where page-table frames come from
//!
//! Address spaces need physical frames for two things: the leaf pages they
//! back lazily (stack pages, copy-on-write copies) and the intermediate
//! paging structures a new mapping may require. Both are drawn from a
//! [`FrameSource`], which in the kernel is the page allocator.
//!
//! Paging structures are the tricky part. The page allocator itself maps
//! pages into the kernel space while holding its own lock, so an address
//! space must never call back into the allocator while holding *its* lock.
//! Instead, every map operation first tops up a per-CPU [`Escrow`] slot
//! (outside any space lock) and the backend later takes the frame from
//! there if a new table turns out to be necessary.

use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::PerCpu;

/// Supplier of physical 4 KiB frames for address spaces.
pub trait FrameSource: Send + Sync {
    /// A free frame, or `None` if memory is exhausted.
    ///
    /// May ask other subsystems to give memory back first.
    fn allocate_frame(&self) -> Option<PhysicalAddress>;

    /// A free frame without reclaiming anything or waiting on another CPU.
    ///
    /// Fault handlers and the [`Escrow`] draw from here.
    fn take_frame(&self) -> Option<PhysicalAddress> {
        self.allocate_frame()
    }

    /// Give a frame back. Pinned frames only drop one pin.
    fn release_frame(&self, frame: PhysicalAddress);

    /// Add a pin so the next [`release_frame`](Self::release_frame) keeps
    /// the frame alive. Used when two address spaces share a frame.
    fn pin_frame(&self, frame: PhysicalAddress);

    /// Whether the frame currently carries at least one pin.
    fn is_frame_pinned(&self, frame: PhysicalAddress) -> bool;

    /// The per-CPU reserve for paging structures.
    fn escrow(&self) -> &Escrow;
}

/// Slot value for "no frame held".
const EMPTY: u64 = 0;

/// Marks an occupied slot, so that frame `0x0` can be held too.
const HELD: u64 = 1;

/// One reserved frame per CPU for paging structures.
///
/// Slots hold `frame | HELD`; frames are page aligned, so the low bit is free.
pub struct Escrow {
    slots: PerCpu<AtomicU64>,
}

impl Escrow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: PerCpu::from_fn(|_| AtomicU64::new(EMPTY)),
        }
    }

    /// Make sure the current CPU's slot holds a frame.
    ///
    /// Must be called without any address-space lock held. Returns `false`
    /// if the slot is empty and `frames` has nothing left to give.
    pub fn refill(&self, frames: &dyn FrameSource) -> bool {
        let slot = self.slots.current();
        if slot.load(Ordering::Acquire) != EMPTY {
            return true;
        }

        let Some(frame) = frames.take_frame() else {
            return false;
        };

        if slot
            .compare_exchange(EMPTY, frame.as_u64() | HELD, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another context on this CPU got there first.
            frames.release_frame(frame);
        }
        true
    }

    /// Take the current CPU's frame, leaving the slot empty.
    ///
    /// The frame's contents are undefined; zero it before use.
    pub fn take(&self) -> Option<PhysicalAddress> {
        match self.slots.current().swap(EMPTY, Ordering::AcqRel) {
            EMPTY => None,
            raw => Some(PhysicalAddress::new(raw & !HELD)),
        }
    }

    /// Number of frames currently parked across all CPUs.
    #[must_use]
    pub fn held(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != EMPTY)
            .count()
    }

    /// Return every parked frame to `frames`.
    pub fn drain(&self, frames: &dyn FrameSource) {
        for slot in self.slots.iter() {
            let raw = slot.swap(EMPTY, Ordering::AcqRel);
            if raw != EMPTY {
                frames.release_frame(PhysicalAddress::new(raw & !HELD));
            }
        }
    }
}

impl Default for Escrow {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Escrow {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Escrow").field("held", &self.held()).finish()
    }
}
