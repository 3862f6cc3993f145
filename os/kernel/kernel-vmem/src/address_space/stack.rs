use super::error::StackError;
use alloc::collections::BTreeMap;
use kernel_info::memory::Window;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_ranges::{Constraints, RangeError, RangeTracker};

/// A live stack: one guard page at `guard`, usable memory above it up to `top`.
///
/// ```text
///   guard          guard + 4K                          top
///     │ no mapping  │ backed on first touch ...  │ eager │
///     └─────────────┴────────────────────────────┴───────┘
///                   stack grows downwards  ◄────────────
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StackRecord {
    pub guard: VirtualAddress,
    pub top: VirtualAddress,
}

impl StackRecord {
    /// Lowest usable address.
    #[must_use]
    pub fn bottom(&self) -> VirtualAddress {
        self.guard + PAGE_SIZE
    }

    /// Usable size in bytes, excluding the guard page.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.top.offset_from(self.bottom())
    }

    #[must_use]
    pub fn is_guard(&self, va: VirtualAddress) -> bool {
        va >= self.guard && va < self.bottom()
    }

    #[must_use]
    pub fn is_usable(&self, va: VirtualAddress) -> bool {
        va >= self.bottom() && va < self.top
    }
}

/// Stack ranges of one address space.
#[derive(Clone)]
pub(crate) struct StackAllocator {
    window: RangeTracker,
    /// Keyed by top address.
    live: BTreeMap<u64, StackRecord>,
}

impl StackAllocator {
    pub fn new(window: Window) -> Self {
        Self {
            window: RangeTracker::with_range(window.base, window.size),
            live: BTreeMap::new(),
        }
    }

    /// Carve a range for a stack of (at least) `size` usable bytes.
    pub fn reserve(&mut self, size: u64) -> Result<StackRecord, StackError> {
        let span = size
            .max(1)
            .checked_next_multiple_of(PAGE_SIZE)
            .and_then(|usable| usable.checked_add(PAGE_SIZE))
            .ok_or(RangeError::Overflow(size))?;
        let base = self.window.allocate(span, Constraints::NONE)?;
        let record = StackRecord {
            guard: VirtualAddress::new(base),
            top: VirtualAddress::new(base + span),
        };
        self.live.insert(record.top.as_u64(), record);
        Ok(record)
    }

    pub fn remove(&mut self, top: VirtualAddress) -> Option<StackRecord> {
        self.live.remove(&top.as_u64())
    }

    /// Hand a removed stack's range back to the window.
    pub fn release(&mut self, record: StackRecord) {
        self.window
            .free(record.guard.as_u64(), record.top.offset_from(record.guard));
    }

    /// The stack whose guard or usable range contains `va`.
    pub fn containing(&self, va: VirtualAddress) -> Option<StackRecord> {
        self.live
            .range(va.as_u64().saturating_add(1)..)
            .next()
            .map(|(_, record)| *record)
            .filter(|record| va >= record.guard)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }
}
