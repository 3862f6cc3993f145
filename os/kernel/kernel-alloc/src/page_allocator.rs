//! # Physical page allocator
//!
//! Hands out single 4 KiB pages from the [free-page stack](crate::page_stack),
//! honours pins on shared pages and, with the `double-free-check` feature,
//! refuses to free a page twice.
//!
//! ## Locking
//!
//! One lock covers the stack, the pin table and the bitmap. While holding it
//! the allocator may take the kernel address space's lock (to reach or grow
//! the stack), never the other way round. Pressure handlers run before the
//! lock is taken.

#[cfg(feature = "double-free-check")]
use crate::bitmap::AllocationBitmap;
use crate::page_stack::{Growth, PageStack};
use crate::pins::PinTable;
use crate::pressure::{MemoryPressureManager, Round};
use alloc::sync::{Arc, Weak};
use kernel_info::memory::{
    PAGE_STACK_WINDOW, PHYSICAL_DOMAIN_END, PRESSURE_HIGH_WATERMARK_PAGES, Window,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K, align_down, align_up};
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{AddressSpace, Escrow, FrameSource};
use log::{debug, trace};
use utils_accessors_derive::Setters;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PageAllocError {
    #[error("no free physical page left")]
    OutOfMemory,
    #[error("the page allocator has no kernel address space attached")]
    NotInitialised,
    #[error("a kernel address space is already attached")]
    AlreadyAttached,
}

/// Tunables for a [`PageAllocator`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Setters)]
pub struct PageAllocatorConfig {
    /// Below this many free pages, pressure handlers are consulted.
    #[setters(get)]
    high_watermark: usize,
    /// Kernel window holding the free-page stack.
    #[setters(get)]
    stack_window: Window,
}

impl PageAllocatorConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            high_watermark: PRESSURE_HIGH_WATERMARK_PAGES,
            stack_window: PAGE_STACK_WINDOW,
        }
    }
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the allocator's bookkeeping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageStats {
    /// Pages on the free stack.
    pub free_pages: usize,
    /// Pages handed out and not yet freed, escrowed ones included.
    pub allocated_pages: usize,
    /// Distinct pages carrying at least one pin.
    pub pinned_pages: usize,
    /// Pages permanently used for the free stack and its page tables.
    pub storage_pages: usize,
    /// Pages parked in per-CPU escrow slots.
    pub escrowed_pages: usize,
}

struct Inner {
    stack: PageStack,
    pins: PinTable,
    #[cfg(feature = "double-free-check")]
    bitmap: AllocationBitmap,
    allocated: usize,
}

pub struct PageAllocator {
    inner: SpinLock<Inner>,
    kernel: SyncOnceCell<Weak<dyn AddressSpace>>,
    pressure: MemoryPressureManager,
    escrow: Escrow,
    config: PageAllocatorConfig,
}

impl PageAllocator {
    /// An empty allocator. Pages can be added once a kernel space is attached.
    #[must_use]
    pub fn new(config: PageAllocatorConfig) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                stack: PageStack::new(config.stack_window()),
                pins: PinTable::new(),
                #[cfg(feature = "double-free-check")]
                bitmap: AllocationBitmap::new(),
                allocated: 0,
            }),
            kernel: SyncOnceCell::new(),
            pressure: MemoryPressureManager::new(),
            escrow: Escrow::new(),
            config,
        }
    }

    pub const fn config(&self) -> &PageAllocatorConfig {
        &self.config
    }

    pub const fn pressure(&self) -> &MemoryPressureManager {
        &self.pressure
    }

    fn kernel(&self) -> Option<Arc<dyn AddressSpace>> {
        self.kernel.get().and_then(Weak::upgrade)
    }

    /// Attach the kernel address space the free stack lives in, and give the
    /// stack its first storage page using frames from `early`.
    ///
    /// Frames that `early` hands out belong to the allocator from then on.
    ///
    /// # Errors
    /// - [`PageAllocError::AlreadyAttached`] on a second call.
    /// - [`PageAllocError::OutOfMemory`] if `early` runs dry first.
    pub fn attach_kernel(
        &self,
        kernel: &Arc<dyn AddressSpace>,
        mut early: impl FnMut() -> Option<PhysicalAddress>,
    ) -> Result<(), PageAllocError> {
        self.kernel
            .set(Arc::downgrade(kernel))
            .map_err(|_| PageAllocError::AlreadyAttached)?;

        let mut inner = self.inner.lock();
        while inner.stack.is_full() {
            let frame = early().ok_or(PageAllocError::OutOfMemory)?;
            match inner.stack.grow_with(&**kernel, frame) {
                Growth::Refused => return Err(PageAllocError::OutOfMemory),
                Growth::Storage | Growth::Structure | Growth::AlreadyBacked => {}
            }
        }
        debug!(
            "page allocator attached to the kernel space ({} storage pages)",
            inner.stack.storage_pages()
        );
        Ok(())
    }

    /// Hand every whole page in `[base, base + length)` to the allocator.
    /// Some of them may end up as stack storage. Pages at or above 4 GiB are
    /// dropped. Returns how many pages were made available for allocation.
    ///
    /// # Errors
    /// [`PageAllocError::NotInitialised`] without an attached kernel space.
    pub fn add_free_range(&self, base: u64, length: u64) -> Result<usize, PageAllocError> {
        let kernel = self.kernel().ok_or(PageAllocError::NotInitialised)?;
        let start = align_up(base.min(PHYSICAL_DOMAIN_END), PAGE_SIZE);
        let end = align_down(base.saturating_add(length).min(PHYSICAL_DOMAIN_END), PAGE_SIZE);
        if start >= end {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        #[cfg(feature = "double-free-check")]
        inner.bitmap.cover(end);

        let before = inner.stack.len();
        for page in (start..end).step_by(PAGE_SIZE as usize) {
            inner.push(&*kernel, PhysicalAddress::new(page));
        }
        let added = inner.stack.len().saturating_sub(before);
        debug!("added {start:#x}..{end:#x}: {added} pages free");
        Ok(usize::try_from(added).unwrap_or(usize::MAX))
    }

    /// A free page, after consulting pressure handlers if memory is low.
    ///
    /// If the stack is empty and this CPU has not just asked the handlers
    /// itself, a round is run (or waited for) and the pop retried once.
    ///
    /// # Errors
    /// [`PageAllocError::OutOfMemory`] if nothing is left even after that,
    /// [`PageAllocError::NotInitialised`] without an attached kernel space.
    pub fn try_allocate_page(&self) -> Result<PhysicalAddress, PageAllocError> {
        let kernel = self.kernel().ok_or(PageAllocError::NotInitialised)?;

        let free = self.free_pages();
        let round = self.pressure.check(free, self.config.high_watermark());
        if let Some(page) = self.pop(&*kernel) {
            return Ok(page);
        }

        if matches!(round, Round::NotNeeded | Round::Joined)
            && matches!(
                self.pressure.relieve(0),
                Round::Ran { released: true } | Round::Joined
            )
            && let Some(page) = self.pop(&*kernel)
        {
            return Ok(page);
        }
        Err(PageAllocError::OutOfMemory)
    }

    /// A free page straight off the stack. Pressure handlers are not asked
    /// and no other CPU is waited for, so this is safe in fault context.
    ///
    /// # Errors
    /// [`PageAllocError::OutOfMemory`] if the stack is empty,
    /// [`PageAllocError::NotInitialised`] without an attached kernel space.
    pub fn try_take_page(&self) -> Result<PhysicalAddress, PageAllocError> {
        let kernel = self.kernel().ok_or(PageAllocError::NotInitialised)?;
        self.pop(&*kernel).ok_or(PageAllocError::OutOfMemory)
    }

    fn pop(&self, kernel: &dyn AddressSpace) -> Option<PhysicalAddress> {
        let mut inner = self.inner.lock();
        let page = match inner.stack.pop(kernel) {
            Ok(Some(page)) => page,
            Ok(None) => return None,
            Err(e) => {
                drop(inner);
                panic!("free-page stack is unreadable: {e}");
            }
        };

        #[cfg(feature = "double-free-check")]
        inner.bitmap.set_allocated(page);
        inner.allocated += 1;
        drop(inner);

        trace!("allocated page {page}");
        Some(page)
    }

    /// A free page.
    ///
    /// # Panics
    /// If physical memory is exhausted; there is nothing left to fall back on.
    #[must_use]
    pub fn allocate_page(&self) -> PhysicalAddress {
        match self.try_allocate_page() {
            Ok(page) => page,
            Err(e) => panic!("out of memory: {e}"),
        }
    }

    /// Release one owner of `page`. Pinned pages only lose a pin; the last
    /// owner returns the page to the free stack.
    ///
    /// # Panics
    /// - If `page` is not page aligned.
    /// - With `double-free-check`, if `page` is not currently allocated.
    pub fn free_page(&self, page: PhysicalAddress) {
        assert!(
            page.is_aligned::<Size4K>(),
            "freeing unaligned physical page {page}"
        );

        let kernel = self.kernel();
        let mut inner = self.inner.lock();
        if inner.pins.release(page) {
            trace!("unpinned page {page}");
            return;
        }

        #[cfg(feature = "double-free-check")]
        {
            if !inner.bitmap.is_allocated(page) {
                drop(inner);
                panic!("double free of physical page {page}");
            }
            inner.bitmap.set_free(page);
        }
        inner.allocated = inner.allocated.saturating_sub(1);

        let Some(kernel) = kernel else {
            drop(inner);
            panic!("freeing page {page} before a kernel address space is attached");
        };
        inner.push(&*kernel, page);
        drop(inner);
        trace!("freed page {page}");
    }

    /// Add one owner to `page`; it now survives one more [`free_page`](Self::free_page).
    pub fn pin(&self, page: PhysicalAddress) {
        let count = self.inner.lock().pins.pin(page);
        trace!("pinned page {page} ({count} extra owners)");
    }

    pub fn is_pinned(&self, page: PhysicalAddress) -> bool {
        self.pin_count(page) > 0
    }

    /// Extra owners of `page` beyond the first.
    pub fn pin_count(&self, page: PhysicalAddress) -> u32 {
        self.inner.lock().pins.count(page)
    }

    pub fn free_pages(&self) -> usize {
        usize::try_from(self.inner.lock().stack.len()).unwrap_or(usize::MAX)
    }

    pub fn stats(&self) -> PageStats {
        let inner = self.inner.lock();
        PageStats {
            free_pages: usize::try_from(inner.stack.len()).unwrap_or(usize::MAX),
            allocated_pages: inner.allocated,
            pinned_pages: inner.pins.len(),
            storage_pages: inner.stack.storage_pages(),
            escrowed_pages: self.escrow.held(),
        }
    }
}

impl Inner {
    /// Put `page` on the stack, growing the storage with it if full.
    fn push(&mut self, kernel: &dyn AddressSpace, page: PhysicalAddress) {
        if self.stack.is_full() {
            match self.stack.grow_with(kernel, page) {
                growth if growth.consumed() => return,
                Growth::Refused => panic!("free-page stack cannot grow to hold {page}"),
                _ => {}
            }
        }

        if let Err(e) = self.stack.push(kernel, page) {
            panic!("free-page stack is unwritable: {e}");
        }
    }
}

impl FrameSource for PageAllocator {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.try_allocate_page().ok()
    }

    fn take_frame(&self) -> Option<PhysicalAddress> {
        self.try_take_page().ok()
    }

    fn release_frame(&self, frame: PhysicalAddress) {
        self.free_page(frame);
    }

    fn pin_frame(&self, frame: PhysicalAddress) {
        self.pin(frame);
    }

    fn is_frame_pinned(&self, frame: PhysicalAddress) -> bool {
        self.is_pinned(frame)
    }

    fn escrow(&self) -> &Escrow {
        &self.escrow
    }
}

impl core::fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageAllocator")
            .field("stats", &self.stats())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
