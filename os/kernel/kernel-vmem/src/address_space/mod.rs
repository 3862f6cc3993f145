//! # Address spaces
//!
//! An [`AddressSpace`] is one virtual-to-physical mapping context: the kernel
//! space, or the space of one user process. Two backends implement it:
//!
//! - [`X86AddressSpace`](crate::x86::X86AddressSpace) walks and edits
//!   two-level x86 page tables stored in physical frames;
//! - [`HostedAddressSpace`](crate::hosted::HostedAddressSpace) keeps a table
//!   of mapping records and translates flags into host protections.
//!
//! Backends only supply a handful of primitives operating on single leaf
//! entries under their own lock. Everything built on top (escrow refill,
//! kernel-range checks, stacks with guard pages, scratch windows, fork-style
//! cloning, simulated CPU accesses) is provided by the trait and shared by
//! both.
//!
//! ## Locking
//!
//! A backend holds its lock only inside the primitives. The provided methods
//! never call into the [`FrameSource`] while a primitive is running: frames
//! for new paging structures come from the per-CPU [`Escrow`](crate::Escrow),
//! and frames freed by an unmap are released after the lock is dropped.
//! This is what allows the page allocator to map its own storage into the
//! kernel space while holding the allocator lock.

mod error;
mod kernel;
mod stack;

pub use error::{AccessError, CloneError, MapError, StackError};
pub use kernel::{install_kernel_address_space, kernel_address_space};
pub use stack::StackRecord;

use crate::fault::PageFault;
use crate::flags::MappingFlags;
use crate::frames::FrameSource;
use crate::phys::PhysMapper;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::{
    KERNEL_SCRATCH_WINDOW, KERNEL_SPACE_START, KERNEL_STACK_WINDOW, PHYSICAL_DOMAIN_END,
    USER_SCRATCH_WINDOW, USER_STACK_WINDOW, VIRTUAL_DOMAIN_END, Window,
};
use kernel_memory_addresses::{
    PAGE_SIZE, PageSize, PhysicalAddress, Size4K, Size4M, VirtualAddress,
};
use kernel_ranges::{Constraints, RangeTracker};
use kernel_sync::SpinLock;
use log::{debug, trace};
use stack::StackAllocator;

/// How often [`AddressSpace::map`] refills the escrow before giving up.
///
/// A retry is only needed when another context on the same CPU drained the
/// slot between the refill and the backend taking its lock.
const ESCROW_ATTEMPTS: usize = 4;

/// Which half of the address space a [`SpaceCore`] manages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpaceKind {
    Kernel,
    User,
}

impl SpaceKind {
    #[must_use]
    pub const fn stack_window(self) -> Window {
        match self {
            Self::Kernel => KERNEL_STACK_WINDOW,
            Self::User => USER_STACK_WINDOW,
        }
    }

    #[must_use]
    pub const fn scratch_window(self) -> Window {
        match self {
            Self::Kernel => KERNEL_SCRATCH_WINDOW,
            Self::User => USER_SCRATCH_WINDOW,
        }
    }

    /// Flags every page this kind of space backs on its own carries.
    #[must_use]
    pub const fn private_page_flags(self) -> MappingFlags {
        match self {
            Self::Kernel => MappingFlags::KERNEL_DATA,
            Self::User => MappingFlags::WRITABLE,
        }
    }
}

/// Granularity of a leaf mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapSize {
    /// A 4 KiB page.
    Page,
    /// A 4 MiB section installed with [`AddressSpace::map_section`].
    Section,
}

impl MapSize {
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Page => PAGE_SIZE,
            Self::Section => Size4M::SIZE,
        }
    }
}

/// One leaf mapping, as reported by [`AddressSpace::mappings`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    pub flags: MappingFlags,
    pub size: MapSize,
}

impl Mapping {
    #[must_use]
    pub const fn page(virt: VirtualAddress, phys: PhysicalAddress, flags: MappingFlags) -> Self {
        Self {
            virt,
            phys,
            flags,
            size: MapSize::Page,
        }
    }
}

/// State every backend carries, whatever its page-table format.
pub struct SpaceCore {
    kind: SpaceKind,
    frames: Arc<dyn FrameSource>,
    ram: Arc<dyn PhysMapper>,
    stacks: SpinLock<StackAllocator>,
    scratch: SpinLock<RangeTracker>,
}

impl SpaceCore {
    #[must_use]
    pub fn new(kind: SpaceKind, frames: Arc<dyn FrameSource>, ram: Arc<dyn PhysMapper>) -> Self {
        let scratch = kind.scratch_window();
        Self {
            kind,
            frames,
            ram,
            stacks: SpinLock::new(StackAllocator::new(kind.stack_window())),
            scratch: SpinLock::new(RangeTracker::with_range(scratch.base, scratch.size)),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[must_use]
    pub const fn frames(&self) -> &Arc<dyn FrameSource> {
        &self.frames
    }

    #[must_use]
    pub const fn ram(&self) -> &Arc<dyn PhysMapper> {
        &self.ram
    }
}

/// A virtual-to-physical mapping context.
///
/// Implementors provide the `do_*` primitives plus enumeration; all other
/// operations have default implementations on top of them.
pub trait AddressSpace: Send + Sync {
    fn core(&self) -> &SpaceCore;

    /// Install one 4 KiB leaf. Fails with [`MapError::AlreadyMapped`] if the
    /// slot is occupied (including by a swapped placeholder). A missing
    /// intermediate structure is built from the escrow; if that is empty,
    /// fails with [`MapError::OutOfMemory`].
    ///
    /// # Errors
    /// See above, plus [`MapError::LargePage`] inside a section.
    fn do_map(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError>;

    /// Clear one leaf and return the frame it pointed to.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] or [`MapError::LargePage`].
    fn do_unmap(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError>;

    /// Frame and flags of the 4 KiB page containing `va`.
    fn do_get_mapping(&self, va: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)>;

    /// Replace the flags of an existing mapping, keeping its frame.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if nothing is mapped at `va`.
    fn do_set_flags(&self, va: VirtualAddress, flags: MappingFlags) -> Result<(), MapError>;

    /// Make sure whatever is needed to map `va` exists, using `pa` for it.
    ///
    /// If a paging structure covering `va` is missing, `pa` becomes that
    /// structure. Otherwise, if `va` itself is unmapped, `pa` is mapped there
    /// with `flags`. Returns whether `pa` was consumed. Never allocates.
    fn map_page_structures(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> bool;

    /// Every leaf in `[start, end)`, in address order. A section is listed
    /// once, at its base, if it overlaps the range.
    fn mappings(&self, start: VirtualAddress, end: VirtualAddress) -> Vec<Mapping>;

    /// Install a 4 MiB section. Addresses are already validated.
    ///
    /// # Errors
    /// [`MapError::SectionsUnsupported`] unless the backend overrides this.
    fn do_map_section(
        &self,
        _pa: PhysicalAddress,
        _va: VirtualAddress,
        _flags: MappingFlags,
    ) -> Result<(), MapError> {
        Err(MapError::SectionsUnsupported)
    }

    /// Remove the section covering `va` and return its physical base.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if no section covers `va`.
    fn do_unmap_section(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        Err(MapError::NotMapped(va))
    }

    /// An empty user space with the same backend, frame source and RAM.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the backend needs a root frame and none is left.
    fn new_user_sibling(&self) -> Result<Arc<dyn AddressSpace>, MapError>;

    fn kind(&self) -> SpaceKind {
        self.core().kind()
    }

    /// Map the frame `pa` at `va`.
    ///
    /// # Errors
    /// - [`MapError::Misaligned`] for unaligned addresses.
    /// - [`MapError::OutOfRange`] / [`MapError::FrameOutOfRange`] for
    ///   addresses beyond the 32-bit domains.
    /// - [`MapError::KernelRange`] for a kernel-half address in a user space.
    /// - Whatever [`do_map`](Self::do_map) reports.
    fn map(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        ensure_aligned(pa.as_u64())?;
        ensure_aligned(va.as_u64())?;
        ensure_reachable(self.kind(), va)?;
        ensure_frame(pa)?;

        let frames = &**self.core().frames();
        for _ in 0..ESCROW_ATTEMPTS {
            let refilled = frames.escrow().refill(frames);
            match self.do_map(pa, va, flags) {
                Err(MapError::OutOfMemory) if refilled => {}
                result => {
                    if result.is_ok() {
                        trace!("map {va} -> {pa} {flags:?}");
                    }
                    return result;
                }
            }
        }
        Err(MapError::OutOfMemory)
    }

    /// Remove the mapping at `va` and return its frame. The frame is not freed.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if nothing is mapped at `va`.
    fn unmap(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        ensure_aligned(va.as_u64())?;
        ensure_reachable(self.kind(), va)?;
        let pa = self.do_unmap(va)?;
        trace!("unmap {va} (was {pa})");
        Ok(pa)
    }

    fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.get_mapping(va).is_some()
    }

    /// Frame and flags behind `va`. A user space only answers for the user
    /// half; nothing is mapped beyond the virtual domain.
    fn get_mapping(&self, va: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)> {
        ensure_reachable(self.kind(), va).ok()?;
        self.do_get_mapping(va)
    }

    /// # Errors
    /// [`MapError::NotMapped`] if nothing is mapped at `va`, or the range
    /// errors of [`map`](Self::map).
    fn set_flags(&self, va: VirtualAddress, flags: MappingFlags) -> Result<(), MapError> {
        ensure_reachable(self.kind(), va)?;
        self.do_set_flags(va.align_down::<Size4K>(), flags)
    }

    /// Map a 4 MiB section with a single directory entry.
    ///
    /// Sections map memory the space does not own, such as device windows:
    /// [`clone_space`](Self::clone_space) shares them as they are and
    /// [`release_user_mappings`](Self::release_user_mappings) only unmaps them.
    ///
    /// # Errors
    /// - [`MapError::Misaligned`] unless both addresses are 4 MiB aligned.
    /// - The range errors of [`map`](Self::map).
    /// - [`MapError::AlreadyMapped`] if any part of the section is in use.
    /// - [`MapError::SectionsUnsupported`] on backends without large pages.
    fn map_section(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        if !pa.is_aligned::<Size4M>() {
            return Err(MapError::Misaligned(pa.as_u64()));
        }
        if !va.is_aligned::<Size4M>() {
            return Err(MapError::Misaligned(va.as_u64()));
        }
        ensure_reachable(self.kind(), va)?;
        ensure_frame(pa)?;
        self.do_map_section(pa, va, flags)?;
        debug!("section {va} -> {pa} {flags:?}");
        Ok(())
    }

    /// Remove the section covering `va` and return its physical base.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if `va` is not covered by a section.
    fn unmap_section(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        ensure_reachable(self.kind(), va)?;
        self.do_unmap_section(va)
    }

    /// Reserve a stack of `size` bytes and return its top.
    ///
    /// Only the topmost page is backed right away; the rest is backed on
    /// first touch (see [`back_stack_page`](Self::back_stack_page)). The page
    /// below the stack stays unmapped so that an overflow faults.
    ///
    /// # Errors
    /// [`StackError::NoVirtualSpace`] if the stack window is full,
    /// [`StackError::OutOfMemory`] if the top page cannot be backed.
    fn allocate_stack(&self, size: u64) -> Result<VirtualAddress, StackError> {
        let record = self.core().stacks.lock().reserve(size)?;
        let backed = self
            .core()
            .frames()
            .allocate_frame()
            .ok_or(StackError::OutOfMemory)
            .and_then(|frame| back_page(self, record.top - PAGE_SIZE, frame));
        if let Err(e) = backed {
            let mut stacks = self.core().stacks.lock();
            stacks.remove(record.top);
            stacks.release(record);
            return Err(e);
        }
        debug!(
            "{:?} stack {}..{} ({:#x} bytes)",
            self.kind(),
            record.bottom(),
            record.top,
            record.size()
        );
        Ok(record.top)
    }

    /// Unmap and free every page of the stack ending at `top`.
    ///
    /// # Errors
    /// [`StackError::UnknownStack`] if no live stack ends at `top`.
    fn free_stack(&self, top: VirtualAddress) -> Result<(), StackError> {
        let record = self
            .core()
            .stacks
            .lock()
            .remove(top)
            .ok_or(StackError::UnknownStack(top))?;

        let frames = self.core().frames();
        let mut page = record.bottom();
        while page < record.top {
            if let Ok(frame) = self.unmap(page) {
                frames.release_frame(frame);
            }
            page += PAGE_SIZE;
        }

        self.core().stacks.lock().release(record);
        debug!("freed stack with top {top}");
        Ok(())
    }

    /// The live stack whose guard page or usable range contains `va`.
    fn stack_containing(&self, va: VirtualAddress) -> Option<StackRecord> {
        self.core().stacks.lock().containing(va)
    }

    /// Back the not-yet-touched stack page containing `va`.
    ///
    /// Returns `Ok(false)` if `va` is not inside the usable part of a live
    /// stack or the page is already backed. Runs in fault context, so the
    /// frame comes from [`FrameSource::take_frame`].
    ///
    /// # Errors
    /// [`StackError::OutOfMemory`] if no frame is left.
    fn back_stack_page(&self, va: VirtualAddress) -> Result<bool, StackError> {
        let Some(record) = self.stack_containing(va) else {
            return Ok(false);
        };
        let page = va.align_down::<Size4K>();
        if !record.is_usable(va) || self.is_mapped(page) {
            return Ok(false);
        }

        let frame = self
            .core()
            .frames()
            .take_frame()
            .ok_or(StackError::OutOfMemory)?;
        match back_page(self, page, frame) {
            Ok(()) => {
                trace!("backed stack page {page}");
                Ok(true)
            }
            // Another CPU faulted on the same page first.
            Err(StackError::Map(MapError::AlreadyMapped(_))) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// A free page-sized slot in this space's scratch window.
    fn allocate_scratch(&self) -> Option<VirtualAddress> {
        self.core()
            .scratch
            .lock()
            .allocate(PAGE_SIZE, Constraints::NONE)
            .ok()
            .map(VirtualAddress::new)
    }

    /// Return a slot obtained from [`allocate_scratch`](Self::allocate_scratch).
    /// The slot must be unmapped again by then.
    fn release_scratch(&self, va: VirtualAddress) {
        self.core().scratch.lock().free(va.as_u64(), PAGE_SIZE);
    }

    /// Read through the space as the CPU would, faulting on missing pages.
    ///
    /// # Errors
    /// [`AccessError::Fault`] describing the page fault the read would raise.
    fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), AccessError> {
        let ram = self.core().ram();
        for_each_page_chunk(va, buf.len(), |at, start, len| {
            let (frame, _) = self
                .get_mapping(at)
                .filter(|(_, flags)| flags.is_resident())
                .ok_or(AccessError::Fault(PageFault::not_present(at, false)))?;
            ram.read(frame + at.page_offset::<Size4K>(), &mut buf[start..start + len])?;
            Ok(())
        })
    }

    /// Write through the space as the CPU would, honouring write protection.
    ///
    /// # Errors
    /// [`AccessError::Fault`] describing the page fault the write would raise.
    fn write_bytes(&self, va: VirtualAddress, data: &[u8]) -> Result<(), AccessError> {
        let ram = self.core().ram();
        for_each_page_chunk(va, data.len(), |at, start, len| {
            let frame = writable_frame(self, at)?;
            ram.write(frame + at.page_offset::<Size4K>(), &data[start..start + len])?;
            Ok(())
        })
    }

    /// Copy the page at `src` over the page at `dst`, both in this space.
    ///
    /// # Errors
    /// [`AccessError::Fault`] if `src` is not readable or `dst` not writable.
    fn copy_page(&self, src: VirtualAddress, dst: VirtualAddress) -> Result<(), AccessError> {
        let src = src.align_down::<Size4K>();
        let (from, _) = self
            .get_mapping(src)
            .filter(|(_, flags)| flags.is_resident())
            .ok_or(AccessError::Fault(PageFault::not_present(src, false)))?;
        let to = writable_frame(self, dst.align_down::<Size4K>())?;
        self.core().ram().copy_frame(from, to)?;
        Ok(())
    }

    /// Fork this user space.
    ///
    /// The child gets every user-half mapping except the scratch window,
    /// sharing the same frames. Writable pages lose write permission in both
    /// spaces and are marked copy-on-write; every shared frame gains one pin,
    /// so that both spaces may later release it. Stack bookkeeping is copied,
    /// so the child's stacks keep growing lazily.
    ///
    /// # Errors
    /// [`CloneError::KernelSpace`] for the kernel space, or
    /// [`CloneError::Map`] if the child could not be populated; the partial
    /// child is torn down again in that case.
    fn clone_space(&self) -> Result<Arc<dyn AddressSpace>, CloneError> {
        if self.kind() == SpaceKind::Kernel {
            return Err(CloneError::KernelSpace);
        }

        let child = self.new_user_sibling()?;
        let stacks = self.core().stacks.lock().clone();
        *child.core().stacks.lock() = stacks;

        let frames = self.core().frames();
        let scratch = self.kind().scratch_window();
        let mut shared = 0usize;
        for mapping in self.mappings(VirtualAddress::zero(), VirtualAddress::new(KERNEL_SPACE_START)) {
            if scratch.contains(mapping.virt) {
                continue;
            }
            if mapping.size == MapSize::Section {
                if let Err(e) = child.map_section(mapping.phys, mapping.virt, mapping.flags) {
                    child.release_user_mappings();
                    return Err(e.into());
                }
                shared += 1;
                continue;
            }

            let resident = mapping.flags.is_resident();
            let flags = if resident {
                mapping.flags.shared_for_fork()
            } else {
                mapping.flags
            };
            if flags != mapping.flags {
                self.set_flags(mapping.virt, flags)?;
            }

            if resident {
                frames.pin_frame(mapping.phys);
            }
            if let Err(e) = child.map(mapping.phys, mapping.virt, flags) {
                if resident {
                    frames.release_frame(mapping.phys);
                }
                child.release_user_mappings();
                return Err(e.into());
            }
            shared += 1;
        }

        debug!("cloned user space: {shared} mappings shared");
        Ok(child)
    }

    /// Unmap every user-half page and release the frames behind them.
    ///
    /// Shared frames only lose a pin; sections are unmapped but their memory
    /// is left alone. Stack bookkeeping is reset.
    fn release_user_mappings(&self) {
        let frames = self.core().frames();
        let mut released = 0usize;
        for mapping in self.mappings(VirtualAddress::zero(), VirtualAddress::new(KERNEL_SPACE_START)) {
            if mapping.size == MapSize::Section {
                let _ = self.unmap_section(mapping.virt);
                continue;
            }
            if let Ok(frame) = self.unmap(mapping.virt)
                && mapping.flags.is_resident()
            {
                frames.release_frame(frame);
                released += 1;
            }
        }
        *self.core().stacks.lock() = StackAllocator::new(self.kind().stack_window());
        debug!("released {released} user pages");
    }
}

const fn ensure_aligned(addr: u64) -> Result<(), MapError> {
    if addr.is_multiple_of(PAGE_SIZE) {
        Ok(())
    } else {
        Err(MapError::Misaligned(addr))
    }
}

/// Whether a space of `kind` may touch `va` at all.
const fn ensure_reachable(kind: SpaceKind, va: VirtualAddress) -> Result<(), MapError> {
    if va.as_u64() >= VIRTUAL_DOMAIN_END {
        return Err(MapError::OutOfRange(va));
    }
    if matches!(kind, SpaceKind::User) && va.as_u64() >= KERNEL_SPACE_START {
        return Err(MapError::KernelRange(va));
    }
    Ok(())
}

/// Page-table entries hold 20 frame bits; nothing above 4 GiB fits.
const fn ensure_frame(pa: PhysicalAddress) -> Result<(), MapError> {
    if pa.as_u64() >= PHYSICAL_DOMAIN_END {
        Err(MapError::FrameOutOfRange(pa))
    } else {
        Ok(())
    }
}

/// Back `page` with the fresh `frame`, zeroed and private to `space`.
/// The frame is released again on failure.
fn back_page<S: AddressSpace + ?Sized>(
    space: &S,
    page: VirtualAddress,
    frame: PhysicalAddress,
) -> Result<(), StackError> {
    let core = space.core();

    let result = core
        .ram()
        .zero_frame(frame)
        .map_err(StackError::from)
        .and_then(|()| {
            space
                .map(frame, page, core.kind().private_page_flags())
                .map_err(StackError::from)
        });

    if result.is_err() {
        core.frames().release_frame(frame);
    }
    result
}

/// The frame behind `page` if a write to it would succeed.
fn writable_frame<S: AddressSpace + ?Sized>(
    space: &S,
    at: VirtualAddress,
) -> Result<PhysicalAddress, AccessError> {
    match space.get_mapping(at) {
        Some((frame, flags)) if flags.is_resident() => {
            if flags.contains(MappingFlags::WRITABLE) {
                Ok(frame)
            } else {
                Err(AccessError::Fault(PageFault::write_protected(at)))
            }
        }
        _ => Err(AccessError::Fault(PageFault::not_present(at, true))),
    }
}

/// Split `[va, va + len)` at page boundaries, handing `f` each piece as
/// `(virtual start, offset into the caller's buffer, length)`.
fn for_each_page_chunk(
    va: VirtualAddress,
    len: usize,
    mut f: impl FnMut(VirtualAddress, usize, usize) -> Result<(), AccessError>,
) -> Result<(), AccessError> {
    let mut done = 0;
    while done < len {
        let at = VirtualAddress::new(va.as_u64().saturating_add(done as u64));
        #[allow(clippy::cast_possible_truncation)]
        let room = (PAGE_SIZE - at.page_offset::<Size4K>()) as usize;
        let chunk = room.min(len - done);
        f(at, done, chunk)?;
        done += chunk;
    }
    Ok(())
}
