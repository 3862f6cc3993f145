use crate::address_newtype;

/// Virtual memory address.
///
/// Only meaningful relative to one address space: the same value may map to
/// different physical pages (or nothing) in two different spaces.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

address_newtype!(VirtualAddress, "VA");

impl VirtualAddress {
    /// Index of the page-directory entry covering this address (bits `[31:22]`).
    #[inline]
    #[must_use]
    pub const fn directory_index(self) -> usize {
        ((self.0 >> 22) & 0x3FF) as usize
    }

    /// Index of the page-table entry covering this address (bits `[21:12]`).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }
}
