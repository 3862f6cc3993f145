//! # Two-level x86 paging
//!
//! Each 32-bit virtual address splits into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory (1024 PDEs) ─┬─► PS=1 → 4 MiB section
//!                                    └─► Page Table (1024 PTEs) → 4 KiB page
//! ```
//!
//! [`X86AddressSpace`] owns one page directory frame and every page table it
//! creates below it. The kernel space is never torn down; a user space gives
//! its page tables and directory back to the frame source when dropped.
//! Directory slots from `KERNEL_SPACE_START` up belong to the kernel space and
//! are mirrored into every user directory made by
//! [`create_user_sibling`](X86AddressSpace::create_user_sibling).
//! Leaf pages are not freed on drop, see
//! [`release_user_mappings`](AddressSpace::release_user_mappings).

mod entry;
mod table;

pub use entry::{Pde, Pte};
pub use table::ENTRIES;

use crate::address_space::{AddressSpace, MapError, MapSize, Mapping, SpaceCore, SpaceKind};
use crate::flags::MappingFlags;
use crate::frames::FrameSource;
use crate::phys::PhysMapper;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::{KERNEL_SPACE_START, PHYSICAL_DOMAIN_END, VIRTUAL_DOMAIN_END};
use kernel_memory_addresses::{
    PAGE_SIZE, PageSize, PhysicalAddress, Size4K, Size4M, VirtualAddress,
};
use kernel_sync::SpinLock;
use log::{debug, error};
use table::TableFrame;

/// First directory slot of the kernel half.
#[allow(clippy::cast_possible_truncation)]
const KERNEL_SLOT: usize = (KERNEL_SPACE_START >> Size4M::SHIFT) as usize;

/// The kernel half of every page directory.
///
/// Directory slots from [`KERNEL_SLOT`] up are owned by the kernel space.
/// A user directory receives a copy of them when it is created and every
/// later change the kernel space makes to them is written through to all
/// registered user directories.
struct KernelHalf {
    directory: PhysicalAddress,
    /// Directory frames of the live user spaces.
    users: SpinLock<Vec<PhysicalAddress>>,
}

/// An address space backed by real x86 page tables.
pub struct X86AddressSpace {
    core: SpaceCore,
    directory_frame: PhysicalAddress,
    directory: TableFrame,
    /// `None` for a user space built without a kernel space to inherit from.
    kernel_half: Option<Arc<KernelHalf>>,
    /// Guards every paging structure reachable from `directory`.
    lock: SpinLock<()>,
}

// SAFETY: the raw table pointers are only dereferenced while `lock` is held,
// or the kernel-half registry lock for the shared slots.
unsafe impl Send for X86AddressSpace {}
// SAFETY: see above.
unsafe impl Sync for X86AddressSpace {}

impl X86AddressSpace {
    /// Build a space rooted at `directory`, which is zeroed.
    ///
    /// A kernel space built this way owns the kernel half that its user
    /// siblings share. A user space built this way has an empty kernel half;
    /// use [`create_user_sibling`](Self::create_user_sibling) to get one that
    /// sees the kernel.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if `directory` is not reachable through `ram`.
    /// - [`MapError::FrameOutOfRange`] if `directory` lies above 4 GiB.
    pub fn new(
        kind: SpaceKind,
        frames: Arc<dyn FrameSource>,
        ram: Arc<dyn PhysMapper>,
        directory: PhysicalAddress,
    ) -> Result<Self, MapError> {
        let kernel_half = (kind == SpaceKind::Kernel).then(|| {
            Arc::new(KernelHalf {
                directory,
                users: SpinLock::new(Vec::new()),
            })
        });
        Self::with_kernel_half(kind, frames, ram, directory, kernel_half)
    }

    fn with_kernel_half(
        kind: SpaceKind,
        frames: Arc<dyn FrameSource>,
        ram: Arc<dyn PhysMapper>,
        directory: PhysicalAddress,
        kernel_half: Option<Arc<KernelHalf>>,
    ) -> Result<Self, MapError> {
        if directory.as_u64() >= PHYSICAL_DOMAIN_END {
            return Err(MapError::FrameOutOfRange(directory));
        }
        ram.zero_frame(directory).map_err(|_| MapError::OutOfMemory)?;
        let table = TableFrame::open(&*ram, directory).ok_or(MapError::OutOfMemory)?;
        debug!("{kind:?} page directory at {directory}");
        Ok(Self {
            core: SpaceCore::new(kind, frames, ram),
            directory_frame: directory,
            directory: table,
            kernel_half,
            lock: SpinLock::new(()),
        })
    }

    /// Build a space with a directory frame taken from `frames`.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available.
    pub fn create(
        kind: SpaceKind,
        frames: Arc<dyn FrameSource>,
        ram: Arc<dyn PhysMapper>,
    ) -> Result<Self, MapError> {
        let directory = frames.allocate_frame().ok_or(MapError::OutOfMemory)?;
        Self::new(kind, frames.clone(), ram, directory).inspect_err(|_| {
            frames.release_frame(directory);
        })
    }

    /// A fresh user space that shares this space's kernel half.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no directory frame is available.
    pub fn create_user_sibling(&self) -> Result<Self, MapError> {
        let frames = self.core.frames();
        let ram = self.core.ram();
        let directory = frames.allocate_frame().ok_or(MapError::OutOfMemory)?;
        let space = Self::with_kernel_half(
            SpaceKind::User,
            frames.clone(),
            ram.clone(),
            directory,
            self.kernel_half.clone(),
        )
        .inspect_err(|_| frames.release_frame(directory))?;

        if let Some(half) = &space.kernel_half {
            let kernel = TableFrame::open(&**ram, half.directory).ok_or(MapError::OutOfMemory)?;
            let mut users = half.users.lock();
            for index in KERNEL_SLOT..ENTRIES {
                space.directory.write(index, kernel.read(index));
            }
            users.push(directory);
        }
        Ok(space)
    }

    /// Physical address of the page directory, as loaded into CR3.
    #[must_use]
    pub const fn directory_frame(&self) -> PhysicalAddress {
        self.directory_frame
    }

    /// Directory slot for `va`, if this space may touch it.
    fn slot(&self, va: VirtualAddress) -> Result<usize, MapError> {
        if va.as_u64() >= VIRTUAL_DOMAIN_END {
            return Err(MapError::OutOfRange(va));
        }
        let index = va.directory_index();
        if self.kind() == SpaceKind::User && index >= KERNEL_SLOT {
            return Err(MapError::KernelRange(va));
        }
        Ok(index)
    }

    /// Write directory slot `index`. Kernel-half slots of the kernel space
    /// are written through to every user directory. Caller holds the lock.
    fn write_directory(&self, index: usize, entry: u32) {
        self.directory.write(index, entry);
        if self.kind() != SpaceKind::Kernel || index < KERNEL_SLOT {
            return;
        }
        let Some(half) = &self.kernel_half else {
            return;
        };
        let ram = &**self.core.ram();
        let users = half.users.lock();
        for &user in users.iter() {
            if let Some(directory) = TableFrame::open(ram, user) {
                directory.write(index, entry);
            }
        }
    }

    fn table(&self, pde: Pde) -> Option<TableFrame> {
        TableFrame::open(&**self.core.ram(), pde.address())
    }

    /// Turn `frame` into the page table for directory slot `index`.
    /// Caller holds the lock.
    fn install_table(&self, index: usize, frame: PhysicalAddress) -> Option<TableFrame> {
        let ram = &**self.core.ram();
        if frame.as_u64() >= PHYSICAL_DOMAIN_END || ram.zero_frame(frame).is_err() {
            // Only reachable with a frame source handing out frames outside RAM.
            error!("page table frame {frame} is not usable; leaking it");
            return None;
        }
        let table = TableFrame::open(ram, frame)?;
        let user = self.kind() == SpaceKind::User;
        self.write_directory(index, Pde::table(frame, user).into_bits());
        debug!(
            "page table {frame} covers {}",
            VirtualAddress::new((index as u64) << Size4M::SHIFT)
        );
        Some(table)
    }
}

impl AddressSpace for X86AddressSpace {
    fn core(&self) -> &SpaceCore {
        &self.core
    }

    fn do_map(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        let index = self.slot(va)?;
        if pa.as_u64() >= PHYSICAL_DOMAIN_END {
            return Err(MapError::FrameOutOfRange(pa));
        }
        let _guard = self.lock.lock();
        let pde = Pde::from_bits(self.directory.read(index));

        let table = if pde.is_section() {
            return Err(MapError::LargePage(va));
        } else if pde.present() {
            self.table(pde).ok_or(MapError::OutOfMemory)?
        } else {
            let frame = self.core.frames().escrow().take().ok_or(MapError::OutOfMemory)?;
            self.install_table(index, frame).ok_or(MapError::OutOfMemory)?
        };

        let slot = va.table_index();
        if Pte::from_bits(table.read(slot)).is_occupied() {
            return Err(MapError::AlreadyMapped(va));
        }
        table.write(slot, Pte::leaf(pa, flags).into_bits());
        invalidate_page(va);
        Ok(())
    }

    fn do_unmap(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        let index = self.slot(va)?;
        let _guard = self.lock.lock();
        let pde = Pde::from_bits(self.directory.read(index));
        if pde.is_section() {
            return Err(MapError::LargePage(va));
        }
        let table = pde
            .present()
            .then(|| self.table(pde))
            .flatten()
            .ok_or(MapError::NotMapped(va))?;

        let slot = va.table_index();
        let pte = Pte::from_bits(table.read(slot));
        if !pte.is_occupied() {
            return Err(MapError::NotMapped(va));
        }
        table.write(slot, 0);
        invalidate_page(va);
        Ok(pte.address())
    }

    fn do_get_mapping(&self, va: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)> {
        let index = self.slot(va).ok()?;
        let _guard = self.lock.lock();
        let pde = Pde::from_bits(self.directory.read(index));
        if !pde.present() {
            return None;
        }
        if pde.page_size() {
            let offset = va.align_down::<Size4K>().page_offset::<Size4M>();
            return Some((pde.address() + offset, pde.section_flags()));
        }

        let pte = Pte::from_bits(self.table(pde)?.read(va.table_index()));
        pte.is_occupied().then(|| (pte.address(), pte.flags()))
    }

    fn do_set_flags(&self, va: VirtualAddress, flags: MappingFlags) -> Result<(), MapError> {
        let index = self.slot(va)?;
        let _guard = self.lock.lock();
        let pde = Pde::from_bits(self.directory.read(index));
        if !pde.present() {
            return Err(MapError::NotMapped(va));
        }
        if pde.page_size() {
            self.write_directory(index, Pde::section(pde.address(), flags).into_bits());
            invalidate_section(va.align_down::<Size4M>());
            return Ok(());
        }

        let table = self.table(pde).ok_or(MapError::NotMapped(va))?;
        let slot = va.table_index();
        let pte = Pte::from_bits(table.read(slot));
        if !pte.is_occupied() {
            return Err(MapError::NotMapped(va));
        }
        table.write(slot, Pte::leaf(pte.address(), flags).into_bits());
        invalidate_page(va);
        Ok(())
    }

    fn map_page_structures(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> bool {
        let Ok(index) = self.slot(va) else {
            return false;
        };
        if pa.as_u64() >= PHYSICAL_DOMAIN_END {
            return false;
        }
        let _guard = self.lock.lock();
        let pde = Pde::from_bits(self.directory.read(index));
        if !pde.present() {
            return self.install_table(index, pa).is_some();
        }
        if pde.page_size() {
            return false;
        }
        let Some(table) = self.table(pde) else {
            return false;
        };

        let slot = va.table_index();
        if Pte::from_bits(table.read(slot)).is_occupied() {
            return false;
        }
        table.write(slot, Pte::leaf(pa, flags).into_bits());
        invalidate_page(va);
        true
    }

    fn mappings(&self, start: VirtualAddress, end: VirtualAddress) -> Vec<Mapping> {
        let end = end.as_u64().min(VIRTUAL_DOMAIN_END);
        let mut found = Vec::new();
        let _guard = self.lock.lock();

        let mut va = start.align_down::<Size4K>().as_u64();
        while va < end {
            let section_base = va & !(Size4M::SIZE - 1);
            let section_end = section_base + Size4M::SIZE;
            let pde = Pde::from_bits(self.directory.read(VirtualAddress::new(va).directory_index()));
            if pde.is_section() {
                found.push(Mapping {
                    virt: VirtualAddress::new(section_base),
                    phys: pde.address(),
                    flags: pde.section_flags(),
                    size: MapSize::Section,
                });
            } else if let Some(table) = pde.is_table().then(|| self.table(pde)).flatten() {
                while va < end.min(section_end) {
                    let virt = VirtualAddress::new(va);
                    let pte = Pte::from_bits(table.read(virt.table_index()));
                    if pte.is_occupied() {
                        found.push(Mapping::page(virt, pte.address(), pte.flags()));
                    }
                    va += PAGE_SIZE;
                }
            }
            va = section_end;
        }
        found
    }

    fn do_map_section(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        let index = self.slot(va)?;
        if pa.as_u64() >= PHYSICAL_DOMAIN_END {
            return Err(MapError::FrameOutOfRange(pa));
        }
        let _guard = self.lock.lock();
        if Pde::from_bits(self.directory.read(index)).present() {
            return Err(MapError::AlreadyMapped(va));
        }
        self.write_directory(index, Pde::section(pa, flags).into_bits());
        invalidate_section(va);
        Ok(())
    }

    fn do_unmap_section(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        let index = self.slot(va)?;
        let _guard = self.lock.lock();
        let pde = Pde::from_bits(self.directory.read(index));
        if !pde.is_section() {
            return Err(MapError::NotMapped(va));
        }
        self.write_directory(index, 0);
        invalidate_section(va.align_down::<Size4M>());
        Ok(pde.address())
    }

    fn new_user_sibling(&self) -> Result<Arc<dyn AddressSpace>, MapError> {
        Ok(Arc::new(self.create_user_sibling()?))
    }
}

impl Drop for X86AddressSpace {
    fn drop(&mut self) {
        if self.kind() == SpaceKind::Kernel {
            return;
        }

        if let Some(half) = &self.kernel_half {
            half.users.lock().retain(|&user| user != self.directory_frame);
        }

        let frames = self.core.frames();
        let mut tables = 0usize;
        for index in 0..KERNEL_SLOT {
            let pde = Pde::from_bits(self.directory.read(index));
            if pde.is_table() {
                frames.release_frame(pde.address());
                tables += 1;
            }
        }
        frames.release_frame(self.directory_frame);
        debug!(
            "dropped user space {}: {tables} page tables freed",
            self.directory_frame
        );
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
fn invalidate_page(va: VirtualAddress) {
    // SAFETY: invlpg only drops a TLB entry.
    #[allow(clippy::cast_possible_truncation)]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64() as u32, options(nostack, preserves_flags));
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
const fn invalidate_page(_va: VirtualAddress) {}

fn invalidate_section(base: VirtualAddress) {
    let mut va = base;
    while va < base + Size4M::SIZE {
        invalidate_page(va);
        va += PAGE_SIZE;
    }
}
