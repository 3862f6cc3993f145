//! # Copy-on-write
//!
//! After [`clone_space`](kernel_vmem::AddressSpace::clone_space) both spaces
//! map the same frame read-only with
//! [`COPY_ON_WRITE`](MappingFlags::COPY_ON_WRITE), and the frame carries one
//! pin per extra sharer. The first write in either space lands here.
//!
//! ```text
//!   faulting page ──► original frame ◄── scratch slot (read-only)
//!         │
//!   unmap, map copy ──► new frame ◄── copy_page(scratch → page)
//!                                      unmap scratch, release original
//! ```
//!
//! The original frame stays reachable through the scratch slot for the whole
//! time the faulting slot is being rebuilt, and it is only released once the
//! copy exists. Releasing a pinned frame just drops one pin, so the other
//! sharer keeps its data.
//!
//! The scratch mapping is kernel-only in every space. The copy comes from
//! [`FrameSource::take_frame`](kernel_vmem::FrameSource::take_frame), so a
//! fault never waits for memory-pressure handlers.

use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, MappingFlags};
use log::trace;

/// How a copy-on-write fault was resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CowOutcome {
    /// Nobody else shares the frame any more; it was made writable in place.
    Reclaimed,
    /// The contents were copied into a fresh frame private to the space.
    Copied,
}

/// Give `space` a private, writable copy of the copy-on-write page
/// containing `va`.
///
/// Returns `None` if that page is not a resident copy-on-write mapping,
/// which makes the write a genuine protection violation.
///
/// # Panics
/// If no frame, scratch slot or paging structure is left. A fault handler
/// has nobody to report that to and cannot retry forever.
pub fn resolve_copy_on_write(space: &dyn AddressSpace, va: VirtualAddress) -> Option<CowOutcome> {
    let page = va.align_down::<Size4K>();
    let (original, flags) = space.get_mapping(page)?;
    if !flags.is_resident() || !flags.contains(MappingFlags::COPY_ON_WRITE) {
        return None;
    }

    let private = flags.after_copy();
    let frames = space.core().frames();

    if !frames.is_frame_pinned(original) {
        space
            .set_flags(page, private)
            .unwrap_or_else(|e| panic!("cannot reclaim copy-on-write page {page}: {e}"));
        trace!("reclaimed copy-on-write page {page} ({original})");
        return Some(CowOutcome::Reclaimed);
    }

    let scratch = space
        .allocate_scratch()
        .unwrap_or_else(|| panic!("no scratch slot left for copy-on-write at {page}"));
    space
        .map(original, scratch, MappingFlags::KERNEL_ONLY)
        .unwrap_or_else(|e| panic!("cannot map {original} at scratch {scratch}: {e}"));

    space
        .unmap(page)
        .unwrap_or_else(|e| panic!("copy-on-write page {page} vanished: {e}"));

    let copy = frames
        .take_frame()
        .unwrap_or_else(|| panic!("out of memory resolving copy-on-write fault at {page}"));
    space
        .map(copy, page, private)
        .unwrap_or_else(|e| panic!("cannot map private copy at {page}: {e}"));
    space
        .copy_page(scratch, page)
        .unwrap_or_else(|e| panic!("cannot copy {original} to {copy}: {e}"));

    space
        .unmap(scratch)
        .unwrap_or_else(|e| panic!("scratch slot {scratch} vanished: {e}"));
    space.release_scratch(scratch);
    frames.release_frame(original);

    trace!("copied copy-on-write page {page}: {original} -> {copy}");
    Some(CowOutcome::Copied)
}
