//! # Page-Fault Resolution
//!
//! What the kernel does with a page fault once the trap layer has decoded
//! the faulting address and error code into a [`PageFault`](kernel_vmem::PageFault).
//!
//! [`PageFaultHandler::handle`] tries, in order:
//!
//! 1. **Lazy stacks**: a not-present access inside a live stack gets a fresh
//!    zeroed page. Guard pages are never backed.
//! 2. **Copy-on-write**: a write to a shared page marked
//!    [`COPY_ON_WRITE`](kernel_vmem::MappingFlags::COPY_ON_WRITE) gives the
//!    faulting space its own copy (see [`resolve_copy_on_write`]).
//! 3. **Trap handlers**: for user-half addresses, every registered
//!    [`MemoryTrapHandler`] in registration order.
//! 4. **Escalation**: the fault is logged and the current process is
//!    terminated through [`ProcessControl`]. Without a process there is
//!    nothing left to blame and the kernel panics.
//!
//! ## Example
//!
//! ```rust
//! use kernel_fault::{FaultResolution, NoProcess, PageFaultHandler};
//! # use std::sync::Arc;
//! # use kernel_alloc::boot::{self, Backend};
//! # use kernel_info::boot::{BootMemoryMap, MemoryExtent};
//! # use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! # use kernel_vmem::{AccessError, AddressSpace, HostedRam};
//! # let ram = Arc::new(HostedRam::new(PhysicalAddress::new(0x10_0000), 64));
//! # let extents = [MemoryExtent::usable(0x10_0000, 64 * 0x1000)];
//! # let mm = boot::initialise(&BootMemoryMap::new(&extents), Backend::Hosted, ram).unwrap();
//! let space = mm.kernel.new_user_sibling().unwrap();
//! let top = space.allocate_stack(0x4000).unwrap();
//!
//! let deep = top - 0x3000;
//! let Err(AccessError::Fault(fault)) = space.write_bytes(deep, b"x") else {
//!     unreachable!("only the top page is backed up front");
//! };
//!
//! let handler = PageFaultHandler::new();
//! assert_eq!(handler.handle(&*space, &fault, &NoProcess), FaultResolution::StackBacked);
//! space.write_bytes(deep, b"x").unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod cow;
mod handler;
mod process;

pub use cow::{CowOutcome, resolve_copy_on_write};
pub use handler::{FaultResolution, MemoryTrapHandler, PageFaultHandler};
pub use process::{NoProcess, ProcessControl, ProcessId};
