//! # The free-page stack
//!
//! Free physical pages are kept as a LIFO array of 64-bit addresses in a
//! fixed kernel window ([`PAGE_STACK_WINDOW`](kernel_info::memory::PAGE_STACK_WINDOW)).
//! The array is backed lazily, one page at a time, by pages the stack is
//! itself asked to hold:
//!
//! ```text
//!  window.base                         capacity              window.end
//!  ┌────────┬────────┬────────┬────────┬─────────────────────────────┐
//!  │ page 0 │ page 1 │ ...    │ page n │  unmapped                   │
//!  └────────┴────────┴────────┴────────┴─────────────────────────────┘
//!  ▲ entries [0, len) are free pages    ▲ next page freed while full
//!                                         becomes storage (or its
//!                                         page table) instead
//! ```
//!
//! Every entry is read and written through the kernel address space, the
//! same way the CPU would reach it.

use kernel_info::memory::Window;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{AccessError, AddressSpace, MappingFlags};
use log::debug;

const ENTRY_BYTES: u64 = size_of::<u64>() as u64;

/// Free-page entries one storage page holds.
pub const ENTRIES_PER_PAGE: u64 = PAGE_SIZE / ENTRY_BYTES;

/// What happened to a page offered to [`PageStack::grow_with`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Growth {
    /// The page now backs the next slice of the stack.
    Storage,
    /// The page became the page table the next storage page needs.
    Structure,
    /// The next storage page was already mapped; the page was not used.
    AlreadyBacked,
    /// The window is exhausted or the kernel space refused the page.
    Refused,
}

impl Growth {
    pub const fn consumed(self) -> bool {
        matches!(self, Self::Storage | Self::Structure)
    }
}

pub(crate) struct PageStack {
    window: Window,
    /// Entries currently on the stack.
    len: u64,
    /// Entries the mapped storage can hold.
    capacity: u64,
    /// Pages permanently used for storage and its page tables.
    storage_pages: usize,
}

impl PageStack {
    pub const fn new(window: Window) -> Self {
        Self {
            window,
            len: 0,
            capacity: 0,
            storage_pages: 0,
        }
    }

    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub const fn storage_pages(&self) -> usize {
        self.storage_pages
    }

    const fn slot(&self, index: u64) -> VirtualAddress {
        VirtualAddress::new(self.window.base + index * ENTRY_BYTES)
    }

    /// Try to extend the storage by one page using `page`.
    pub fn grow_with(&mut self, kernel: &dyn AddressSpace, page: PhysicalAddress) -> Growth {
        let offset = self.capacity * ENTRY_BYTES;
        if offset >= self.window.size {
            return Growth::Refused;
        }

        let next = VirtualAddress::new(self.window.base + offset);
        let growth = if kernel.map_page_structures(page, next, MappingFlags::KERNEL_DATA) {
            self.storage_pages += 1;
            if kernel.is_mapped(next) {
                Growth::Storage
            } else {
                Growth::Structure
            }
        } else if kernel.is_mapped(next) {
            Growth::AlreadyBacked
        } else {
            Growth::Refused
        };

        match growth {
            Growth::Storage | Growth::AlreadyBacked => {
                self.capacity += ENTRIES_PER_PAGE;
                debug!(
                    "free-page stack storage at {next} ({} entries)",
                    self.capacity
                );
            }
            Growth::Structure => debug!("free-page stack page table at {page}"),
            Growth::Refused => {}
        }
        growth
    }

    /// Push onto storage that has room.
    pub fn push(&mut self, kernel: &dyn AddressSpace, page: PhysicalAddress) -> Result<(), AccessError> {
        debug_assert!(!self.is_full());
        kernel.write_bytes(self.slot(self.len), &page.as_u64().to_ne_bytes())?;
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self, kernel: &dyn AddressSpace) -> Result<Option<PhysicalAddress>, AccessError> {
        if self.len == 0 {
            return Ok(None);
        }

        let mut raw = [0; ENTRY_BYTES as usize];
        kernel.read_bytes(self.slot(self.len - 1), &mut raw)?;
        self.len -= 1;
        Ok(Some(PhysicalAddress::new(u64::from_ne_bytes(raw))))
    }
}
