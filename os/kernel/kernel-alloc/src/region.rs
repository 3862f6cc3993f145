//! # Memory regions
//!
//! A [`MemoryRegion`] is a named range of the kernel's region window bound to
//! physical memory for as long as the handle lives:
//!
//! - **fixed-physical** regions map a caller-chosen physical range 1:1, for
//!   device registers and firmware tables;
//! - **dynamic** regions map freshly allocated pages, one at a time.
//!
//! Creation either completes or leaves nothing behind. Dropping the handle
//! unmaps the range and returns whatever the region owned.

use crate::page_allocator::PageAllocator;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use kernel_info::memory::{PHYSICAL_DOMAIN_END, Window};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K, VirtualAddress};
use kernel_ranges::{Constraints, Range, RangeError, RangeTracker};
use kernel_sync::SpinLock;
use kernel_vmem::{AccessError, AddressSpace, MapError, MappingFlags};
use log::{debug, warn};
use utils_accessors_derive::Setters;

bitflags! {
    /// Placement requirements of a region's physical memory.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct RegionConstraints: u32 {
        /// Physically contiguous. Mandatory for fixed-physical regions.
        const CONTINUOUS = 1 << 0;
        /// The physical range is not RAM; reserve it in the physical tracker.
        const NON_RAM = 1 << 1;
        /// Claim the physical range even if the tracker says it is taken.
        const FORCE = 1 << 2;
    }
}

/// What to allocate.
///
/// ```rust
/// use kernel_alloc::{RegionConstraints, RegionRequest};
/// use kernel_memory_addresses::PhysicalAddress;
///
/// let apic = RegionRequest::new("local-apic", 1)
///     .with_constraints(RegionConstraints::CONTINUOUS.union(RegionConstraints::NON_RAM))
///     .with_physical_base(Some(PhysicalAddress::new(0xFEE0_0000)));
/// assert_eq!(apic.pages(), 1);
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Setters)]
pub struct RegionRequest {
    #[setters(get)]
    name: &'static str,
    #[setters(get)]
    pages: u64,
    #[setters(get)]
    constraints: RegionConstraints,
    #[setters(get)]
    flags: MappingFlags,
    /// Fixed-physical mode when set.
    #[setters(get)]
    physical_base: Option<PhysicalAddress>,
}

impl RegionRequest {
    /// A dynamic, kernel-only, writable region of `pages` pages.
    #[must_use]
    pub const fn new(name: &'static str, pages: u64) -> Self {
        Self {
            name,
            pages,
            constraints: RegionConstraints::empty(),
            flags: MappingFlags::KERNEL_DATA,
            physical_base: None,
        }
    }

    /// Bytes covered, or `None` if that does not fit in 64 bits.
    const fn size(&self) -> Option<u64> {
        self.pages.checked_mul(PAGE_SIZE)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("no room in the region window: {0}")]
    NoVirtualSpace(RangeError),
    #[error("physical range unavailable: {0}")]
    PhysicalRangeTaken(RangeError),
    #[error("invalid region request: {0}")]
    Misuse(&'static str),
    #[error("cannot provide {0} physically contiguous pages")]
    ContiguityUnavailable(u64),
    #[error("no physical page left for the region")]
    OutOfMemory,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// A live region, as listed by [`RegionAllocator::regions`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionInfo {
    pub name: &'static str,
    pub virtual_address: VirtualAddress,
    pub pages: u64,
}

impl RegionInfo {
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        let base = self.virtual_address.as_u64();
        va.as_u64() >= base && (va.as_u64() - base) / PAGE_SIZE < self.pages
    }
}

/// Owner of the region window and of the physical holes fixed-physical
/// regions may claim.
pub struct RegionAllocator {
    pages: Arc<PageAllocator>,
    kernel: Arc<dyn AddressSpace>,
    /// Physical addresses that are not RAM and not yet claimed.
    physical: SpinLock<RangeTracker>,
    window: SpinLock<RangeTracker>,
    live: SpinLock<Vec<RegionInfo>>,
}

impl RegionAllocator {
    /// `physical` lists the claimable non-RAM holes; `window` is the kernel
    /// range regions are mapped into.
    #[must_use]
    pub fn new(
        pages: Arc<PageAllocator>,
        kernel: Arc<dyn AddressSpace>,
        physical: RangeTracker,
        window: Window,
    ) -> Arc<Self> {
        Arc::new(Self {
            pages,
            kernel,
            physical: SpinLock::new(physical),
            window: SpinLock::new(RangeTracker::with_range(window.base, window.size)),
            live: SpinLock::new(Vec::new()),
        })
    }

    /// A physical tracker spanning the whole 32-bit domain, for callers that
    /// have no memory map at hand.
    #[must_use]
    pub fn full_physical_domain() -> RangeTracker {
        RangeTracker::with_range(0, PHYSICAL_DOMAIN_END)
    }

    pub const fn kernel(&self) -> &Arc<dyn AddressSpace> {
        &self.kernel
    }

    pub const fn page_allocator(&self) -> &Arc<PageAllocator> {
        &self.pages
    }

    /// Map a new region as described by `request`.
    ///
    /// # Errors
    /// - [`RegionError::Misuse`] for an empty request, or a fixed-physical one
    ///   without [`RegionConstraints::CONTINUOUS`].
    /// - [`RegionError::PhysicalRangeTaken`] if a non-RAM range is taken and
    ///   [`RegionConstraints::FORCE`] is not set.
    /// - [`RegionError::ContiguityUnavailable`] for a dynamic contiguous
    ///   request of more than one page.
    /// - [`RegionError::NoVirtualSpace`], [`RegionError::OutOfMemory`] or
    ///   [`RegionError::Map`] when resources run out midway.
    ///
    /// Nothing stays allocated or mapped when an error is returned.
    pub fn allocate_region(
        self: &Arc<Self>,
        request: RegionRequest,
    ) -> Result<MemoryRegion, RegionError> {
        if request.pages() == 0 {
            return Err(RegionError::Misuse("region of zero pages"));
        }
        let Some(size) = request.size() else {
            warn!("region '{}' of {} pages is too large", request.name(), request.pages());
            return Err(RegionError::NoVirtualSpace(RangeError::Overflow(request.pages())));
        };

        let result = match request.physical_base() {
            Some(base) => self.allocate_fixed(request, base.align_down::<Size4K>(), size),
            None => self.allocate_dynamic(request, size),
        };

        match &result {
            Ok(region) => {
                self.live.lock().push(region.info());
                debug!(
                    "region '{}' at {} ({} pages)",
                    region.name,
                    region.virt,
                    region.pages
                );
            }
            Err(e) => warn!("region '{}' not allocated: {e}", request.name()),
        }
        result
    }

    fn allocate_fixed(
        self: &Arc<Self>,
        request: RegionRequest,
        base: PhysicalAddress,
        size: u64,
    ) -> Result<MemoryRegion, RegionError> {
        let constraints = request.constraints();
        if !constraints.contains(RegionConstraints::CONTINUOUS) {
            return Err(RegionError::Misuse(
                "fixed-physical regions must be continuous",
            ));
        }

        if base
            .as_u64()
            .checked_add(size)
            .is_none_or(|end| end > PHYSICAL_DOMAIN_END)
        {
            return Err(RegionError::PhysicalRangeTaken(RangeError::Overflow(base.as_u64())));
        }

        let forced = if constraints.contains(RegionConstraints::NON_RAM) {
            let mut physical = self.physical.lock();
            match physical.allocate_specific(base.as_u64(), size, false) {
                Ok(()) => false,
                Err(_) if constraints.contains(RegionConstraints::FORCE) => {
                    physical
                        .allocate_specific(base.as_u64(), size, true)
                        .map_err(RegionError::PhysicalRangeTaken)?;
                    true
                }
                Err(e) => return Err(RegionError::PhysicalRangeTaken(e)),
            }
        } else {
            // The caller owns this RAM; never hand it to the tracker.
            true
        };

        let mut region = MemoryRegion {
            owner: self.clone(),
            name: request.name(),
            virt: VirtualAddress::zero(),
            physical: Some(base),
            pages: request.pages(),
            reserved: false,
            mapped: 0,
            non_ram: true,
            forced,
            dynamic: false,
        };

        // From here on, dropping `region` unwinds whatever was done so far.
        region.virt = self.reserve_virtual(size)?;
        region.reserved = true;
        for i in 0..request.pages() {
            self.kernel.map(
                base + i * PAGE_SIZE,
                region.virt + i * PAGE_SIZE,
                request.flags(),
            )?;
            region.mapped += 1;
        }
        Ok(region)
    }

    fn allocate_dynamic(
        self: &Arc<Self>,
        request: RegionRequest,
        size: u64,
    ) -> Result<MemoryRegion, RegionError> {
        if request.constraints().contains(RegionConstraints::CONTINUOUS) && request.pages() > 1 {
            return Err(RegionError::ContiguityUnavailable(request.pages()));
        }

        let mut region = MemoryRegion {
            owner: self.clone(),
            name: request.name(),
            virt: VirtualAddress::zero(),
            physical: None,
            pages: request.pages(),
            reserved: false,
            mapped: 0,
            non_ram: false,
            forced: false,
            dynamic: true,
        };

        region.virt = self.reserve_virtual(size)?;
        region.reserved = true;
        for i in 0..request.pages() {
            let page = self
                .pages
                .try_allocate_page()
                .map_err(|_| RegionError::OutOfMemory)?;
            if let Err(e) = self.kernel.map(page, region.virt + i * PAGE_SIZE, request.flags()) {
                self.pages.free_page(page);
                return Err(e.into());
            }
            if request.pages() == 1 {
                region.physical = Some(page);
            }
            region.mapped += 1;
        }
        Ok(region)
    }

    fn reserve_virtual(&self, size: u64) -> Result<VirtualAddress, RegionError> {
        self.window
            .lock()
            .allocate(size, Constraints::aligned(PAGE_SIZE))
            .map(VirtualAddress::new)
            .map_err(RegionError::NoVirtualSpace)
    }

    /// Undo everything `region` holds. Runs from [`MemoryRegion`]'s `Drop`,
    /// including for half-built regions.
    fn release(&self, region: &MemoryRegion) {
        if region.reserved {
            let mut live = self.live.lock();
            if let Some(at) = live
                .iter()
                .position(|info| info.virtual_address == region.virt)
            {
                live.swap_remove(at);
            }
        }

        for i in 0..region.mapped {
            match self.kernel.unmap(region.virt + i * PAGE_SIZE) {
                Ok(frame) if region.dynamic => self.pages.free_page(frame),
                Ok(_) => {}
                Err(e) => warn!("region '{}': {e}", region.name),
            }
        }

        if region.non_ram
            && !region.forced
            && let Some(base) = region.physical
        {
            self.physical
                .lock()
                .free(base.as_u64(), region.pages * PAGE_SIZE);
        }

        if region.reserved {
            self.window
                .lock()
                .free(region.virt.as_u64(), region.pages * PAGE_SIZE);
        }
    }

    /// The live region whose virtual range contains `va`.
    pub fn region_containing(&self, va: VirtualAddress) -> Option<RegionInfo> {
        self.live.lock().iter().copied().find(|info| info.contains(va))
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.live.lock().clone()
    }

    /// Whether `[base, base + length)` is an unclaimed physical hole.
    pub fn is_physical_free(&self, base: PhysicalAddress, length: u64) -> bool {
        self.physical.lock().is_free(base.as_u64(), length)
    }

    pub fn physical_holes(&self) -> Vec<Range> {
        self.physical.lock().ranges().collect()
    }

    pub fn free_virtual_bytes(&self) -> u64 {
        self.window.lock().free_bytes()
    }
}

/// A mapped region. Unmapped and released on drop.
pub struct MemoryRegion {
    owner: Arc<RegionAllocator>,
    name: &'static str,
    virt: VirtualAddress,
    physical: Option<PhysicalAddress>,
    pages: u64,
    /// Whether `virt` holds a range of the region window yet.
    reserved: bool,
    /// Pages mapped so far; below `pages` only while being built.
    mapped: u64,
    non_ram: bool,
    forced: bool,
    dynamic: bool,
}

impl MemoryRegion {
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn virtual_address(&self) -> VirtualAddress {
        self.virt
    }

    /// Physical base, for fixed-physical and single-page regions.
    pub const fn physical_address(&self) -> Option<PhysicalAddress> {
        self.physical
    }

    pub const fn pages(&self) -> u64 {
        self.pages
    }

    pub const fn size(&self) -> u64 {
        self.pages * PAGE_SIZE
    }

    pub const fn is_non_ram(&self) -> bool {
        self.non_ram
    }

    pub const fn is_forced(&self) -> bool {
        self.forced
    }

    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.info().contains(va)
    }

    const fn info(&self) -> RegionInfo {
        RegionInfo {
            name: self.name,
            virtual_address: self.virt,
            pages: self.pages,
        }
    }

    fn check_bounds(&self, offset: u64, len: usize) {
        let end = offset.checked_add(len as u64);
        assert!(
            end.is_some_and(|end| end <= self.size()),
            "access at {offset:#x}+{len:#x} outside region '{}' of {:#x} bytes",
            self.name,
            self.size()
        );
    }

    /// Read `buf.len()` bytes at `offset` into the region.
    ///
    /// # Errors
    /// [`AccessError`] if the kernel mapping is unreadable.
    ///
    /// # Panics
    /// If the range extends past the region.
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        self.check_bounds(offset, buf.len());
        self.owner.kernel.read_bytes(self.virt + offset, buf)
    }

    /// Write `data` at `offset` into the region.
    ///
    /// # Errors
    /// [`AccessError`] if the mapping is not writable.
    ///
    /// # Panics
    /// If the range extends past the region.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), AccessError> {
        self.check_bounds(offset, data.len());
        self.owner.kernel.write_bytes(self.virt + offset, data)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.owner.release(self);
        if self.mapped == self.pages {
            debug!("region '{}' at {} released", self.name, self.virt);
        }
    }
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("virt", &self.virt)
            .field("physical", &self.physical)
            .field("pages", &self.pages)
            .field("non_ram", &self.non_ram)
            .field("forced", &self.forced)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_bounds_do_not_wrap() {
        let info = RegionInfo {
            name: "top",
            virtual_address: VirtualAddress::new(u64::MAX - 2 * PAGE_SIZE + 1),
            pages: 2,
        };
        assert!(info.contains(VirtualAddress::new(u64::MAX)));
        assert!(!info.contains(VirtualAddress::new(u64::MAX - 2 * PAGE_SIZE)));

        let request = RegionRequest::new("huge", 1 << 53);
        assert_eq!(request.size(), None);
        assert_eq!(RegionRequest::new("two", 2).size(), Some(2 * PAGE_SIZE));
    }
}
