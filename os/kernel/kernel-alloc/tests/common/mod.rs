#![allow(dead_code)]

use kernel_alloc::boot::{self, Backend, BumpFrames, MemorySubsystem};
use kernel_alloc::{PageAllocator, PageAllocatorConfig};
use kernel_info::boot::{BootMemoryMap, MemoryExtent, MemoryKind};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{AddressSpace, HostedAddressSpace, HostedRam, SpaceKind, X86AddressSpace};
use std::sync::Arc;

/// An allocator over simulated RAM starting at physical address zero.
pub struct Machine {
    pub ram: Arc<HostedRam>,
    pub pages: Arc<PageAllocator>,
    pub kernel: Arc<dyn AddressSpace>,
}

impl Machine {
    /// `ram_frames` frames of RAM; the kernel space and the first free-stack
    /// storage are built from frames in `[early_base, early_end)`. No page
    /// is free yet.
    pub fn new(
        backend: Backend,
        ram_frames: usize,
        early_base: u64,
        early_end: u64,
        config: PageAllocatorConfig,
    ) -> Self {
        let ram = Arc::new(HostedRam::new(PhysicalAddress::zero(), ram_frames));
        let pages = Arc::new(PageAllocator::new(config));
        let mut early = BumpFrames::new(early_base, early_end);

        let kernel: Arc<dyn AddressSpace> = match backend {
            Backend::X86 => Arc::new(
                X86AddressSpace::new(
                    SpaceKind::Kernel,
                    pages.clone(),
                    ram.clone(),
                    early.next_frame().unwrap(),
                )
                .unwrap(),
            ),
            Backend::Hosted => Arc::new(HostedAddressSpace::new(
                SpaceKind::Kernel,
                pages.clone(),
                ram.clone(),
            )),
        };
        pages.attach_kernel(&kernel, || early.next_frame()).unwrap();

        Self { ram, pages, kernel }
    }

    /// The four-page machine: free pages `[0x1000, 0x5000)`, bootstrap
    /// frames from `[0x8000, 0x10000)`.
    pub fn four_pages(backend: Backend, config: PageAllocatorConfig) -> Self {
        let machine = Self::new(backend, 16, 0x8000, 0x1_0000, config);
        assert_eq!(machine.pages.add_free_range(0x1000, 0x4000).unwrap(), 4);
        machine
    }

    /// Allocate until exhausted.
    pub fn drain(&self) -> Vec<PhysicalAddress> {
        std::iter::from_fn(|| self.pages.try_allocate_page().ok()).collect()
    }
}

pub const KERNEL_IMAGE: MemoryExtent = MemoryExtent::kernel_image(0x10_0000, 0x8000);
pub const USABLE: MemoryExtent = MemoryExtent::usable(0x10_0000, 0x10_0000);
pub const LOCAL_APIC: MemoryExtent = MemoryExtent::new(0xFEE0_0000, 0x1000, MemoryKind::Mmio);

/// 1 MiB of RAM at 1 MiB whose first 32 KiB hold the kernel image, plus a
/// device window.
pub const EXTENTS: [MemoryExtent; 3] = [USABLE, KERNEL_IMAGE, LOCAL_APIC];

/// Usable pages not covered by the kernel image.
pub const USABLE_PAGES: usize = 256 - 8;

pub fn booted(backend: Backend) -> MemorySubsystem {
    let ram = Arc::new(HostedRam::new(PhysicalAddress::new(USABLE.base), 256));
    boot::initialise_with(
        &BootMemoryMap::new(&EXTENTS),
        backend,
        ram,
        PageAllocatorConfig::new().with_high_watermark(0),
    )
    .unwrap()
}
