//! # Physical Memory Allocation
//!
//! Physical page management for the kernel, and the region mappings built on
//! top of it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                RegionAllocator                      │
//! │    • Named mappings in the region window            │
//! │    • Fixed-physical (MMIO) and dynamic regions      │
//! │    • Released on drop                               │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                PageAllocator                        │
//! │    • LIFO free-page stack in the kernel space       │
//! │    • Pins for pages shared between spaces           │
//! │    • Double-free bitmap, pressure handlers          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameSource / map_page_structures
//! ┌─────────────────▼───────────────────────────────────┐
//! │          kernel-vmem AddressSpace (kernel)          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Page Allocator ([`PageAllocator`])
//!
//! * **Self-hosting storage**: the free stack lives in the kernel address
//!   space and grows by consuming the very pages it is asked to hold.
//! * **Pinning**: a page pinned `k` times is only freed by the `k + 1`-th
//!   [`free_page`](PageAllocator::free_page).
//! * **Exhaustion**: [`try_allocate_page`](PageAllocator::try_allocate_page)
//!   reports it, [`allocate_page`](PageAllocator::allocate_page) panics.
//! * **Frame source**: implements [`kernel_vmem::FrameSource`], so address
//!   spaces draw their page tables and lazily backed pages from it.
//!
//! ### Memory Pressure ([`MemoryPressureManager`])
//!
//! Below the configured high watermark, registered handlers are asked to
//! release memory before the next page is handed out.
//!
//! ### Regions ([`RegionAllocator`], [`MemoryRegion`])
//!
//! Scoped kernel mappings for device registers and driver buffers.
//!
//! ### Boot ([`boot`])
//!
//! Builds all of the above from the firmware memory map.
//!
//! ## Features
//!
//! * `double-free-check` (default): keep an allocation bitmap and panic when
//!   a page is freed twice.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_alloc::boot::{self, Backend};
//! use kernel_alloc::RegionRequest;
//! use kernel_info::boot::{BootMemoryMap, MemoryExtent};
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::HostedRam;
//!
//! let ram = Arc::new(HostedRam::new(PhysicalAddress::new(0x10_0000), 64));
//! let extents = [
//!     MemoryExtent::kernel_image(0x10_0000, 0x4000),
//!     MemoryExtent::usable(0x10_4000, 60 * 0x1000),
//! ];
//! let mm = boot::initialise(&BootMemoryMap::new(&extents), Backend::X86, ram).unwrap();
//!
//! let page = mm.pages.allocate_page();
//! mm.pages.free_page(page);
//!
//! let buffer = mm.regions.allocate_region(RegionRequest::new("dma", 2)).unwrap();
//! buffer.write_bytes(0x1FFE, b"ok").unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

#[cfg(feature = "double-free-check")]
mod bitmap;
pub mod boot;
mod page_allocator;
mod page_stack;
mod pins;
mod pressure;
mod region;

pub use page_allocator::{PageAllocError, PageAllocator, PageAllocatorConfig, PageStats};
pub use page_stack::ENTRIES_PER_PAGE;
pub use pressure::{MemoryPressureHandler, MemoryPressureManager, PressurePriority};
pub use region::{
    MemoryRegion, RegionAllocator, RegionConstraints, RegionError, RegionInfo, RegionRequest,
};
