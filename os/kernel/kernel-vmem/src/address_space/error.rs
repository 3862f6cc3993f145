use crate::fault::PageFault;
use crate::phys::NotBacked;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_ranges::RangeError;

/// Why a single mapping operation failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("no physical frame left for a paging structure")]
    OutOfMemory,
    #[error("{0} lies inside a 4 MiB section")]
    LargePage(VirtualAddress),
    #[error("{0} belongs to the kernel half and cannot be mapped into a user space")]
    KernelRange(VirtualAddress),
    #[error("address {0:#x} is not page aligned")]
    Misaligned(u64),
    #[error("{0} lies outside the translatable address range")]
    OutOfRange(VirtualAddress),
    #[error("frame {0} lies beyond the physical address limit")]
    FrameOutOfRange(PhysicalAddress),
    #[error("this address space cannot map 4 MiB sections")]
    SectionsUnsupported,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum StackError {
    #[error("no room left in the stack window: {0}")]
    NoVirtualSpace(#[from] RangeError),
    #[error("no physical frame to back the stack")]
    OutOfMemory,
    #[error("no stack with top {0}")]
    UnknownStack(VirtualAddress),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    NotBacked(#[from] NotBacked),
}

/// A simulated CPU access through an address space went wrong.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AccessError {
    /// The access would have raised a page fault.
    #[error("{0}")]
    Fault(PageFault),
    #[error(transparent)]
    NotBacked(#[from] NotBacked),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CloneError {
    #[error("the kernel address space cannot be cloned")]
    KernelSpace,
    #[error(transparent)]
    Map(#[from] MapError),
}
