//! # Kernel Configuration and Boot Interface
//!
//! The authoritative source for the memory layout the memory manager is built
//! around, plus the shape of the boot-time memory map it is initialised from.
//!
//! ## Memory Layout ([`memory`])
//!
//! The kernel runs with a 3 GiB / 1 GiB split. Every fixed-purpose virtual
//! window is a [`Window`](memory::Window) constant, validated at compile time
//! to be page aligned, non-overlapping and on the correct side of the split:
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  User Space                     │
//! 0xA000_0000 ├─────────────────────────────────┤ USER_STACK_WINDOW
//!             │  User stacks (guarded)          │
//! 0xBF00_0000 ├─────────────────────────────────┤ USER_SCRATCH_WINDOW
//!             │  Copy-on-write scratch mappings │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_SPACE_START
//!             │  Kernel image / heap            │
//! 0xD000_0000 ├─────────────────────────────────┤ REGION_WINDOW
//!             │  MemoryRegion mappings          │
//! 0xE000_0000 ├─────────────────────────────────┤ KERNEL_STACK_WINDOW
//!             │  Kernel stacks (guarded)        │
//! 0xEF00_0000 ├─────────────────────────────────┤ KERNEL_SCRATCH_WINDOW
//! 0xF000_0000 ├─────────────────────────────────┤ PAGE_STACK_WINDOW
//!             │  Free-page stack storage        │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Boot Information ([`boot`])
//!
//! The firmware-provided description of physical memory, reduced to a list of
//! typed extents. All allocator state is rebuilt from it on every boot; nothing
//! is persisted.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
