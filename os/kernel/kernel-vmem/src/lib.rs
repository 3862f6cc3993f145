//! # Virtual Memory Support
//!
//! Address spaces for a 32-bit x86 kernel, plus a hosted stand-in that lets
//! the same memory manager run as an ordinary process.
//!
//! ## What you get
//! - The [`AddressSpace`] trait: map, unmap, query and re-flag single pages,
//!   lazily backed stacks with guard pages, per-space scratch windows and
//!   fork-style [`clone_space`](AddressSpace::clone_space) with copy-on-write.
//! - [`X86AddressSpace`], editing two-level page tables in physical frames,
//!   including 4 MiB sections.
//! - [`HostedAddressSpace`], keeping a record per page with host protections.
//! - Architecture-neutral [`MappingFlags`].
//! - [`PhysMapper`] for touching frames by physical address, and
//!   [`HostedRam`] simulating RAM on a host.
//! - [`FrameSource`], the interface through which spaces obtain frames, with
//!   its per-CPU [`Escrow`] for paging structures.
//! - [`PageFault`] and the x86 [`PageFaultError`] code.
//!
//! ## Address layout
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────┐
//!             │ user half (per process)  │  user stacks at 0xA000_0000,
//!             │                          │  scratch at 0xBF00_0000
//! 0xC000_0000 ├──────────────────────────┤
//!             │ kernel half (one space)  │  regions, kernel stacks,
//!             │                          │  scratch, free-page stack
//! 0xFFFF_FFFF └──────────────────────────┘
//! ```
//!
//! User spaces never map the kernel half; kernel mappings go through the
//! single kernel space published with [`install_kernel_address_space`].
//!
//! ## Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! # use kernel_sync::SpinLock;
//! use kernel_vmem::{AddressSpace, Escrow, FrameSource, HostedRam, MappingFlags, SpaceKind, X86AddressSpace};
//!
//! /// Hands out frames from a fixed list; enough for an example.
//! struct Frames(SpinLock<Vec<PhysicalAddress>>, Escrow);
//!
//! impl FrameSource for Frames {
//!     fn allocate_frame(&self) -> Option<PhysicalAddress> { self.0.lock().pop() }
//!     fn release_frame(&self, frame: PhysicalAddress) { self.0.lock().push(frame) }
//!     fn pin_frame(&self, _: PhysicalAddress) {}
//!     fn is_frame_pinned(&self, _: PhysicalAddress) -> bool { false }
//!     fn escrow(&self) -> &Escrow { &self.1 }
//! }
//!
//! let ram = Arc::new(HostedRam::new(PhysicalAddress::new(0x10_0000), 8));
//! let frames = (0..8).map(|i| PhysicalAddress::new(0x10_0000 + i * 0x1000)).collect();
//! let frames = Arc::new(Frames(SpinLock::new(frames), Escrow::new()));
//!
//! let space = X86AddressSpace::create(SpaceKind::User, frames.clone(), ram).unwrap();
//! let page = frames.allocate_frame().unwrap();
//! space.map(page, VirtualAddress::new(0x40_0000), MappingFlags::WRITABLE).unwrap();
//!
//! space.write_bytes(VirtualAddress::new(0x40_0010), b"hello").unwrap();
//! let mut buf = [0; 5];
//! space.read_bytes(VirtualAddress::new(0x40_0010), &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod fault;
mod flags;
mod frames;
pub mod hosted;
mod phys;
pub mod x86;

pub use address_space::{
    AccessError, AddressSpace, CloneError, MapError, MapSize, Mapping, SpaceCore, SpaceKind,
    StackError, StackRecord, install_kernel_address_space, kernel_address_space,
};
pub use fault::{PageFault, PageFaultError};
pub use flags::MappingFlags;
pub use frames::{Escrow, FrameSource};
pub use hosted::HostedAddressSpace;
pub use phys::{HostedRam, NotBacked, PhysMapper};
pub use x86::X86AddressSpace;
