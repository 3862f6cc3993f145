//! # 32-bit paging entries
//!
//! Without PAE, both levels use the same 32-bit entry layout:
//!
//! | Bits  | Name      | Meaning |
//! |-------|-----------|---------|
//! | 0     | `P`       | Present |
//! | 1     | `RW`      | Writable |
//! | 2     | `US`      | User accessible |
//! | 3     | `PWT`     | Write-through |
//! | 4     | `PCD`     | Cache disable |
//! | 5     | `A`       | Accessed |
//! | 6     | `D`       | Dirty (leaf only) |
//! | 7     | `PS`/`PAT`| 4 MiB section in a PDE, PAT in a PTE |
//! | 8     | `G`       | Global (leaf only) |
//! | 9     | avail     | *swapped placeholder* (ours) |
//! | 10    | avail     | *copy-on-write* (ours) |
//! | 11    | avail     | unused |
//! | 12–31 | `addr`    | Physical frame bits `[31:12]` |
//!
//! A swapped placeholder keeps its frame field but has `P` clear, so the
//! hardware faults on any access while the kernel still sees the slot as
//! taken.

use crate::flags::MappingFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A page-table entry (PTE), always a 4 KiB leaf.
#[doc(alias = "PTE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Pte {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat: bool,
    pub global: bool,
    pub swapped: bool,
    pub copy_on_write: bool,
    #[bits(1)]
    __: u8,
    #[bits(20)]
    frame: u32,
}

/// A page-directory entry (PDE): either points at a page table or, with
/// `PS=1`, maps a 4 MiB section directly.
#[doc(alias = "PDE")]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Pde {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub page_size: bool,
    pub global: bool,
    pub swapped: bool,
    pub copy_on_write: bool,
    #[bits(1)]
    __: u8,
    #[bits(20)]
    frame: u32,
}

#[allow(clippy::cast_possible_truncation)]
const fn frame_bits(pa: PhysicalAddress) -> u32 {
    (pa.as_u64() >> 12) as u32
}

impl Pte {
    /// Encode a leaf for `pa` carrying `flags`.
    ///
    /// Kernel-only pages are also marked global; swapped placeholders are
    /// stored not-present. `EXECUTABLE` has no bit to go to.
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, flags: MappingFlags) -> Self {
        let kernel_only = flags.contains(MappingFlags::KERNEL_ONLY);
        let swapped = flags.contains(MappingFlags::SWAPPED);
        Self::new()
            .with_present(!swapped)
            .with_swapped(swapped)
            .with_writable(flags.contains(MappingFlags::WRITABLE))
            .with_user(!kernel_only)
            .with_global(kernel_only)
            .with_copy_on_write(flags.contains(MappingFlags::COPY_ON_WRITE))
            .with_write_through(flags.contains(MappingFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(MappingFlags::CACHE_DISABLE))
            .with_frame(frame_bits(pa))
    }

    /// Decode the flags. Always includes `EXECUTABLE`, since 32-bit paging
    /// cannot forbid instruction fetches.
    #[must_use]
    pub const fn flags(self) -> MappingFlags {
        let mut flags = MappingFlags::EXECUTABLE;
        if self.writable() {
            flags = flags.union(MappingFlags::WRITABLE);
        }
        if !self.user() {
            flags = flags.union(MappingFlags::KERNEL_ONLY);
        }
        if self.swapped() {
            flags = flags.union(MappingFlags::SWAPPED);
        }
        if self.copy_on_write() {
            flags = flags.union(MappingFlags::COPY_ON_WRITE);
        }
        if self.write_through() {
            flags = flags.union(MappingFlags::WRITE_THROUGH);
        }
        if self.cache_disable() {
            flags = flags.union(MappingFlags::CACHE_DISABLE);
        }
        flags
    }

    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.frame() as u64) << 12)
    }

    /// Whether the slot holds a mapping or a swapped placeholder.
    #[must_use]
    pub const fn is_occupied(self) -> bool {
        self.present() || self.swapped()
    }
}

impl Pde {
    /// Point at the page table in `frame`.
    ///
    /// Directory entries are permissive; the leaves decide.
    #[must_use]
    pub const fn table(frame: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(frame_bits(frame))
    }

    /// A 4 MiB section at `base` carrying `flags`.
    #[must_use]
    pub const fn section(base: PhysicalAddress, flags: MappingFlags) -> Self {
        Self::from_bits(Pte::leaf(base, flags).into_bits()).with_page_size(true)
    }

    #[must_use]
    pub const fn is_section(self) -> bool {
        self.present() && self.page_size()
    }

    #[must_use]
    pub const fn is_table(self) -> bool {
        self.present() && !self.page_size()
    }

    /// Flags of a section, decoded like those of a leaf.
    #[must_use]
    pub const fn section_flags(self) -> MappingFlags {
        Pte::from_bits(self.with_page_size(false).into_bits()).flags()
    }

    /// The page table frame, or the section base.
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.frame() as u64) << 12)
    }
}
