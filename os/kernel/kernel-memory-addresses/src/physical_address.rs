use crate::address_newtype;

/// Physical memory address.
///
/// Denotes a location on the memory bus (RAM or MMIO). Physical addresses are
/// only ever dereferenced through a `PhysMapper`; paging code stores them in
/// page-table entries with the low bits reused for flags.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

address_newtype!(PhysicalAddress, "PA");
