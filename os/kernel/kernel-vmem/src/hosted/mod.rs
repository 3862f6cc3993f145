//! # Hosted address spaces
//!
//! When the kernel runs as a process on another operating system there are
//! no page tables to edit. [`HostedAddressSpace`] keeps one record per
//! mapped page instead and describes each with the protection a host
//! `mmap`/`mprotect` would be given ([`HostProtection`]). Kernel-only and
//! copy-on-write status have no host equivalent and are kept beside it in
//! the record.
//!
//! There are no intermediate structures, so mapping never consumes the
//! escrow and 4 MiB sections are not supported.

mod protection;

pub use protection::HostProtection;

use crate::address_space::{AddressSpace, MapError, Mapping, SpaceCore, SpaceKind};
use crate::flags::MappingFlags;
use crate::frames::FrameSource;
use crate::phys::PhysMapper;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::SpinLock;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Record {
    frame: PhysicalAddress,
    protection: HostProtection,
    kernel_only: bool,
    copy_on_write: bool,
}

impl Record {
    fn new(frame: PhysicalAddress, flags: MappingFlags) -> Self {
        Self {
            frame,
            protection: HostProtection::from_flags(flags),
            kernel_only: flags.contains(MappingFlags::KERNEL_ONLY),
            copy_on_write: flags.contains(MappingFlags::COPY_ON_WRITE),
        }
    }

    fn flags(&self) -> MappingFlags {
        let mut flags = self.protection.to_flags();
        flags.set(MappingFlags::KERNEL_ONLY, self.kernel_only);
        flags.set(MappingFlags::COPY_ON_WRITE, self.copy_on_write);
        flags
    }
}

/// An address space kept as a table of per-page records.
pub struct HostedAddressSpace {
    core: SpaceCore,
    /// Keyed by page base.
    records: SpinLock<BTreeMap<u64, Record>>,
}

impl HostedAddressSpace {
    #[must_use]
    pub fn new(kind: SpaceKind, frames: Arc<dyn FrameSource>, ram: Arc<dyn PhysMapper>) -> Self {
        Self {
            core: SpaceCore::new(kind, frames, ram),
            records: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Host protection currently recorded for the page containing `va`.
    #[must_use]
    pub fn protection(&self, va: VirtualAddress) -> Option<HostProtection> {
        self.records
            .lock()
            .get(&page_key(va))
            .map(|record| record.protection)
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const fn page_key(va: VirtualAddress) -> u64 {
    va.align_down::<Size4K>().as_u64()
}

impl AddressSpace for HostedAddressSpace {
    fn core(&self) -> &SpaceCore {
        &self.core
    }

    fn do_map(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        let mut records = self.records.lock();
        if records.contains_key(&page_key(va)) {
            return Err(MapError::AlreadyMapped(va));
        }
        records.insert(page_key(va), Record::new(pa, flags));
        Ok(())
    }

    fn do_unmap(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        self.records
            .lock()
            .remove(&page_key(va))
            .map(|record| record.frame)
            .ok_or(MapError::NotMapped(va))
    }

    fn do_get_mapping(&self, va: VirtualAddress) -> Option<(PhysicalAddress, MappingFlags)> {
        self.records
            .lock()
            .get(&page_key(va))
            .map(|record| (record.frame, record.flags()))
    }

    fn do_set_flags(&self, va: VirtualAddress, flags: MappingFlags) -> Result<(), MapError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&page_key(va))
            .ok_or(MapError::NotMapped(va))?;
        *record = Record::new(record.frame, flags);
        Ok(())
    }

    fn map_page_structures(
        &self,
        pa: PhysicalAddress,
        va: VirtualAddress,
        flags: MappingFlags,
    ) -> bool {
        self.do_map(pa, va, flags).is_ok()
    }

    fn mappings(&self, start: VirtualAddress, end: VirtualAddress) -> Vec<Mapping> {
        if start >= end {
            return Vec::new();
        }
        self.records
            .lock()
            .range(page_key(start)..end.as_u64())
            .map(|(&virt, record)| Mapping::page(VirtualAddress::new(virt), record.frame, record.flags()))
            .collect()
    }

    fn new_user_sibling(&self) -> Result<Arc<dyn AddressSpace>, MapError> {
        Ok(Arc::new(Self::new(
            SpaceKind::User,
            self.core.frames().clone(),
            self.core.ram().clone(),
        )))
    }
}
