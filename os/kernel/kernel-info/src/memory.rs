//! # Memory Layout

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

/// A fixed, page-aligned range of virtual addresses reserved for one purpose.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Window {
    pub base: u64,
    pub size: u64,
}

impl Window {
    #[must_use]
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// Exclusive end of the window.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base && va.as_u64() < self.end()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    const fn is_page_aligned(&self) -> bool {
        self.base.is_multiple_of(PAGE_SIZE) && self.size.is_multiple_of(PAGE_SIZE)
    }
}

/// First kernel-half address; everything below belongs to user space.
pub const KERNEL_SPACE_START: u64 = 0xC000_0000;

/// End of the physical address domain. Frames at or above it cannot be
/// stored in a page-table entry and are never handed to the allocator.
pub const PHYSICAL_DOMAIN_END: u64 = 0x1_0000_0000; // 4 GiB

/// Exclusive end of every address space; nothing above it can be translated.
pub const VIRTUAL_DOMAIN_END: u64 = 0x1_0000_0000; // 4 GiB

/// Virtual range from which user stacks are carved.
pub const USER_STACK_WINDOW: Window = Window::new(0xA000_0000, 0x1000_0000);

/// Per-process window for temporary mappings made while resolving faults.
pub const USER_SCRATCH_WINDOW: Window = Window::new(0xBF00_0000, 0x0040_0000);

/// Virtual range backing memory regions (MMIO windows, DMA buffers).
pub const REGION_WINDOW: Window = Window::new(0xD000_0000, 0x1000_0000);

/// Virtual range from which kernel stacks are carved.
pub const KERNEL_STACK_WINDOW: Window = Window::new(0xE000_0000, 0x0800_0000);

/// Kernel window for temporary mappings made while resolving faults.
pub const KERNEL_SCRATCH_WINDOW: Window = Window::new(0xEF00_0000, 0x0040_0000);

/// Where the free-page stack lives. Grows upwards, one page at a time, using
/// pages taken from the stack itself.
pub const PAGE_STACK_WINDOW: Window = Window::new(0xF000_0000, 0x0040_0000);

/// The size of the kernel stack in debug builds.
#[cfg(debug_assertions)]
pub const KERNEL_STACK_SIZE: u64 = 32 * 1024;

/// The size of the kernel stack in release builds.
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_SIZE: u64 = 32 * 1024;

/// Default size of a user-mode stack.
pub const USER_STACK_SIZE: u64 = 64 * 1024;

/// Below this many free pages the page allocator asks registered pressure
/// handlers to give memory back before handing out more.
pub const PRESSURE_HIGH_WATERMARK_PAGES: usize = 256;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(USER_STACK_SIZE.is_multiple_of(PAGE_SIZE));

    assert!(USER_STACK_WINDOW.is_page_aligned());
    assert!(USER_SCRATCH_WINDOW.is_page_aligned());
    assert!(REGION_WINDOW.is_page_aligned());
    assert!(KERNEL_STACK_WINDOW.is_page_aligned());
    assert!(KERNEL_SCRATCH_WINDOW.is_page_aligned());
    assert!(PAGE_STACK_WINDOW.is_page_aligned());

    assert!(USER_SCRATCH_WINDOW.end() <= KERNEL_SPACE_START);
    assert!(!USER_STACK_WINDOW.overlaps(&USER_SCRATCH_WINDOW));

    assert!(REGION_WINDOW.base >= KERNEL_SPACE_START);
    assert!(!REGION_WINDOW.overlaps(&KERNEL_STACK_WINDOW));
    assert!(!KERNEL_STACK_WINDOW.overlaps(&KERNEL_SCRATCH_WINDOW));
    assert!(!KERNEL_SCRATCH_WINDOW.overlaps(&PAGE_STACK_WINDOW));
    assert!(PAGE_STACK_WINDOW.end() <= VIRTUAL_DOMAIN_END);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds_are_half_open() {
        let w = Window::new(0x1000, 0x2000);
        assert!(w.contains(VirtualAddress::new(0x1000)));
        assert!(w.contains(VirtualAddress::new(0x2FFF)));
        assert!(!w.contains(VirtualAddress::new(0x3000)));
        assert!(w.overlaps(&Window::new(0x2000, 0x1000)));
        assert!(!w.overlaps(&Window::new(0x3000, 0x1000)));
    }
}
