//! # Bringing memory management up
//!
//! [`initialise`] turns the firmware memory map into a working memory
//! subsystem:
//!
//! 1. The physical tracker starts as the whole 32-bit domain; every RAM and
//!    kernel-image extent is removed, leaving the holes regions may claim.
//! 2. Early frames are carved, bump-style, from the first usable RAM above
//!    the kernel image. They become the kernel's page directory and the
//!    first storage of the free-page stack.
//! 3. The kernel address space is created and the page allocator attached.
//! 4. Every other usable page goes onto the free stack.
//! 5. The region allocator takes over the region window.

use crate::page_allocator::{PageAllocError, PageAllocator, PageAllocatorConfig, PageStats};
use crate::region::RegionAllocator;
use alloc::sync::Arc;
use kernel_info::boot::{BootMemoryMap, MemoryKind};
use kernel_info::memory::{PHYSICAL_DOMAIN_END, REGION_WINDOW};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};
use kernel_ranges::{RangeError, RangeTracker};
use kernel_vmem::{
    AddressSpace, HostedAddressSpace, MapError, PhysMapper, SpaceKind, X86AddressSpace,
    install_kernel_address_space,
};
use log::{debug, info};

/// Which address-space implementation the kernel space uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Backend {
    X86,
    Hosted,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("the memory map has no usable RAM above the kernel image")]
    NoUsableMemory,
    #[error("early frames ran out while bootstrapping")]
    EarlyFramesExhausted,
    #[error("cannot reserve RAM in the physical tracker: {0}")]
    PhysicalTracker(#[from] RangeError),
    #[error("cannot create the kernel address space: {0}")]
    KernelSpace(#[from] MapError),
    #[error(transparent)]
    Allocator(#[from] PageAllocError),
    #[error("a kernel address space is already installed")]
    AlreadyInstalled,
}

/// Hands out consecutive frames from one range, never taking them back.
#[derive(Debug)]
pub struct BumpFrames {
    start: u64,
    next: u64,
    end: u64,
}

impl BumpFrames {
    /// Frames at or above 4 GiB are never handed out.
    #[must_use]
    pub const fn new(base: u64, end: u64) -> Self {
        let base = if base < PHYSICAL_DOMAIN_END { base } else { PHYSICAL_DOMAIN_END };
        let end = if end < PHYSICAL_DOMAIN_END { end } else { PHYSICAL_DOMAIN_END };
        let start = align_up(base, PAGE_SIZE);
        Self {
            start,
            next: start,
            end: align_down(end, PAGE_SIZE),
        }
    }

    /// The first usable RAM above every kernel-image extent.
    #[must_use]
    pub fn above_kernel(map: &BootMemoryMap<'_>) -> Option<Self> {
        let kernel_end = map
            .of_kind(MemoryKind::KernelImage)
            .map(|e| e.end())
            .max()
            .unwrap_or(0);

        map.of_kind(MemoryKind::Usable)
            .filter(|e| e.end() > kernel_end)
            .map(|e| Self::new(e.base.max(kernel_end), e.end().min(PHYSICAL_DOMAIN_END)))
            .filter(|bump| bump.next < bump.end)
            .min_by_key(|bump| bump.next)
    }

    pub fn next_frame(&mut self) -> Option<PhysicalAddress> {
        if self.next >= self.end {
            return None;
        }
        let frame = PhysicalAddress::new(self.next);
        self.next += PAGE_SIZE;
        Some(frame)
    }

    /// Whether `addr` was handed out.
    #[must_use]
    pub const fn is_used(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.next
    }

    #[must_use]
    pub const fn used_pages(&self) -> u64 {
        (self.next - self.start) / PAGE_SIZE
    }
}

/// Everything [`initialise`] brings up.
pub struct MemorySubsystem {
    pub ram: Arc<dyn PhysMapper>,
    pub pages: Arc<PageAllocator>,
    pub kernel: Arc<dyn AddressSpace>,
    pub regions: Arc<RegionAllocator>,
}

impl MemorySubsystem {
    /// Make the kernel space reachable through
    /// [`kernel_address_space`](kernel_vmem::kernel_address_space).
    ///
    /// # Errors
    /// [`BootError::AlreadyInstalled`] if another one was installed first.
    pub fn publish(&self) -> Result<(), BootError> {
        install_kernel_address_space(self.kernel.clone()).map_err(|_| BootError::AlreadyInstalled)
    }

    pub fn stats(&self) -> PageStats {
        self.pages.stats()
    }
}

/// Set up physical and kernel virtual memory from `map`.
///
/// `ram` must reach every usable extent of `map`.
///
/// # Errors
/// See [`BootError`].
pub fn initialise(
    map: &BootMemoryMap<'_>,
    backend: Backend,
    ram: Arc<dyn PhysMapper>,
) -> Result<MemorySubsystem, BootError> {
    initialise_with(map, backend, ram, PageAllocatorConfig::default())
}

/// [`initialise`] with explicit allocator tunables.
///
/// # Errors
/// See [`BootError`].
pub fn initialise_with(
    map: &BootMemoryMap<'_>,
    backend: Backend,
    ram: Arc<dyn PhysMapper>,
    config: PageAllocatorConfig,
) -> Result<MemorySubsystem, BootError> {
    let physical = physical_holes(map)?;
    let mut early = BumpFrames::above_kernel(map).ok_or(BootError::NoUsableMemory)?;

    let pages = Arc::new(PageAllocator::new(config));
    let kernel: Arc<dyn AddressSpace> = match backend {
        Backend::X86 => {
            let directory = early.next_frame().ok_or(BootError::EarlyFramesExhausted)?;
            Arc::new(X86AddressSpace::new(
                SpaceKind::Kernel,
                pages.clone(),
                ram.clone(),
                directory,
            )?)
        }
        Backend::Hosted => Arc::new(HostedAddressSpace::new(
            SpaceKind::Kernel,
            pages.clone(),
            ram.clone(),
        )),
    };

    pages
        .attach_kernel(&kernel, || early.next_frame())
        .map_err(|e| match e {
            PageAllocError::OutOfMemory => BootError::EarlyFramesExhausted,
            other => BootError::Allocator(other),
        })?;
    debug!("{} early frames used", early.used_pages());

    for extent in map.of_kind(MemoryKind::Usable) {
        let mut run_start = None;
        // Page-table entries cannot name frames above 4 GiB.
        let start = align_up(extent.base.min(PHYSICAL_DOMAIN_END), PAGE_SIZE);
        let end = align_down(extent.end().min(PHYSICAL_DOMAIN_END), PAGE_SIZE);
        for page in (start..end).step_by(PAGE_SIZE as usize) {
            let reserved = map.is_kernel_image(page) || early.is_used(page);
            match (reserved, run_start) {
                (false, None) => run_start = Some(page),
                (true, Some(from)) => {
                    pages.add_free_range(from, page - from)?;
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(from) = run_start {
            pages.add_free_range(from, end - from)?;
        }
    }

    let regions = RegionAllocator::new(pages.clone(), kernel.clone(), physical, REGION_WINDOW);

    let stats = pages.stats();
    info!(
        "memory: {} KiB usable, {} pages free, {} stack storage pages, {:?} kernel space",
        map.usable_bytes() / 1024,
        stats.free_pages,
        stats.storage_pages,
        backend
    );

    Ok(MemorySubsystem {
        ram,
        pages,
        kernel,
        regions,
    })
}

/// `[0, 4 GiB)` minus every RAM extent.
fn physical_holes(map: &BootMemoryMap<'_>) -> Result<RangeTracker, RangeError> {
    let mut tracker = RangeTracker::with_range(0, PHYSICAL_DOMAIN_END);
    for extent in map.extents().filter(|e| e.is_ram() && e.base < PHYSICAL_DOMAIN_END) {
        let end = extent.end().min(PHYSICAL_DOMAIN_END);
        if end > extent.base {
            tracker.allocate_specific(extent.base, end - extent.base, true)?;
        }
    }
    Ok(tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryExtent;

    #[test]
    fn early_frames_start_above_the_kernel_image() {
        let extents = [
            MemoryExtent::usable(0x1000, 0xF_F000),
            MemoryExtent::kernel_image(0x10_0000, 0x8_0000),
            MemoryExtent::usable(0x18_0000, 0x8_0000),
        ];
        let map = BootMemoryMap::new(&extents);
        let mut early = BumpFrames::above_kernel(&map).unwrap();

        assert_eq!(early.next_frame(), Some(PhysicalAddress::new(0x18_0000)));
        assert_eq!(early.next_frame(), Some(PhysicalAddress::new(0x18_1000)));
        assert!(early.is_used(0x18_1000));
        assert!(!early.is_used(0x18_2000));
        assert_eq!(early.used_pages(), 2);
    }

    #[test]
    fn holes_exclude_ram_but_keep_mmio() {
        let extents = [
            MemoryExtent::usable(0, 0x10_0000),
            MemoryExtent::new(0xFEC0_0000, 0x1000, MemoryKind::Mmio),
        ];
        let holes = physical_holes(&BootMemoryMap::new(&extents)).unwrap();

        assert!(!holes.contains(0x8_0000));
        assert!(holes.contains(0x10_0000));
        assert!(holes.contains(0xFEC0_0000));
        assert_eq!(holes.free_bytes(), PHYSICAL_DOMAIN_END - 0x10_0000);
    }

    #[test]
    fn ram_above_4_gib_is_clipped() {
        let extents = [
            MemoryExtent::usable(0, 0x10_0000),
            MemoryExtent::usable(PHYSICAL_DOMAIN_END - 0x1_0000, 0x2_0000),
            MemoryExtent::usable(PHYSICAL_DOMAIN_END, 0x10_0000),
        ];
        let map = BootMemoryMap::new(&extents);
        let holes = physical_holes(&map).unwrap();
        assert!(!holes.contains(PHYSICAL_DOMAIN_END - 0x1000));
        assert_eq!(holes.free_bytes(), PHYSICAL_DOMAIN_END - 0x11_0000);

        let kernel_end = [MemoryExtent::kernel_image(0, PHYSICAL_DOMAIN_END - 0x1000), extents[2]];
        assert!(BumpFrames::above_kernel(&BootMemoryMap::new(&kernel_end)).is_none());
        assert!(BumpFrames::new(u64::MAX - 1, u64::MAX).next_frame().is_none());
    }
}
