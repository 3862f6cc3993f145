use crate::phys::PhysMapper;
use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;

/// Entries per page directory or page table.
pub const ENTRIES: usize = 1024;

/// A 4 KiB frame viewed as 1024 raw 32-bit paging entries.
///
/// Entries are read and written through raw pointers, never through
/// references, since the hardware walker may look at the frame at any time.
/// Whoever holds a `TableFrame` must hold the owning space's lock.
#[derive(Copy, Clone)]
pub struct TableFrame {
    entries: NonNull<u32>,
}

impl TableFrame {
    pub fn open(ram: &dyn PhysMapper, frame: PhysicalAddress) -> Option<Self> {
        ram.frame_ptr(frame).map(|ptr| Self {
            entries: ptr.cast(),
        })
    }

    #[inline]
    pub fn read(self, index: usize) -> u32 {
        assert!(index < ENTRIES);
        // SAFETY: the frame is valid for ENTRIES entries and page aligned.
        unsafe { self.entries.add(index).read_volatile() }
    }

    #[inline]
    pub fn write(self, index: usize, value: u32) {
        assert!(index < ENTRIES);
        // SAFETY: as above; exclusive use is guaranteed by the space lock.
        unsafe { self.entries.add(index).write_volatile(value) }
    }
}
