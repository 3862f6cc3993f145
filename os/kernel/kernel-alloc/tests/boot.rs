mod common;

use common::{EXTENTS, KERNEL_IMAGE, LOCAL_APIC, USABLE, USABLE_PAGES, booted};
use kernel_alloc::PageAllocatorConfig;
use kernel_alloc::boot::{self, Backend, BootError};
use kernel_info::boot::{BootMemoryMap, MemoryExtent};
use kernel_info::memory::PHYSICAL_DOMAIN_END;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    AddressSpace, HostedRam, MappingFlags, SpaceKind, X86AddressSpace, kernel_address_space,
};
use std::sync::Arc;

#[test]
fn every_usable_page_outside_the_image_is_accounted_for() {
    for (backend, directory) in [(Backend::X86, 1), (Backend::Hosted, 0)] {
        let mm = booted(backend);
        let stats = mm.stats();
        assert_eq!(stats.allocated_pages, 0);
        assert_eq!(
            stats.free_pages + stats.storage_pages + directory,
            USABLE_PAGES
        );

        let pages: Vec<_> = std::iter::from_fn(|| mm.pages.try_allocate_page().ok()).collect();
        assert_eq!(pages.len(), stats.free_pages);
        assert!(pages.iter().all(|p| {
            let p = p.as_u64();
            p >= KERNEL_IMAGE.end() && p < USABLE.end()
        }));
    }
}

#[test]
fn memory_above_4_gib_is_left_out() {
    let high = MemoryExtent::usable(PHYSICAL_DOMAIN_END, 0x4000_0000);
    let extents = [EXTENTS[0], EXTENTS[1], EXTENTS[2], high];
    let ram = Arc::new(HostedRam::new(PhysicalAddress::new(USABLE.base), 256));
    let mm = boot::initialise_with(
        &BootMemoryMap::new(&extents),
        Backend::X86,
        ram,
        PageAllocatorConfig::new().with_high_watermark(0),
    )
    .unwrap();

    let stats = mm.stats();
    assert_eq!(stats.free_pages + stats.storage_pages + 1, USABLE_PAGES);
    let pages: Vec<_> = std::iter::from_fn(|| mm.pages.try_allocate_page().ok()).collect();
    assert!(pages.iter().all(|p| p.as_u64() < USABLE.end()));
}

#[test]
fn device_memory_stays_claimable() {
    let mm = booted(Backend::X86);
    assert!(
        mm.regions
            .is_physical_free(PhysicalAddress::new(LOCAL_APIC.base), LOCAL_APIC.length)
    );
    assert!(
        !mm.regions
            .is_physical_free(PhysicalAddress::new(USABLE.base), PAGE_SIZE)
    );
}

#[test]
fn boot_without_usable_memory_fails() {
    let extents = [KERNEL_IMAGE];
    let ram = Arc::new(HostedRam::new(PhysicalAddress::new(KERNEL_IMAGE.base), 8));
    assert_eq!(
        boot::initialise(&BootMemoryMap::new(&extents), Backend::Hosted, ram).err(),
        Some(BootError::NoUsableMemory)
    );

    // One usable page is not enough for a directory and its first table.
    let extents = [KERNEL_IMAGE, MemoryExtent::usable(KERNEL_IMAGE.end(), PAGE_SIZE)];
    let ram = Arc::new(HostedRam::new(PhysicalAddress::new(KERNEL_IMAGE.base), 9));
    assert_eq!(
        boot::initialise(&BootMemoryMap::new(&extents), Backend::X86, ram).err(),
        Some(BootError::EarlyFramesExhausted)
    );
}

#[test]
fn kernel_space_is_published_once() {
    let mm = booted(Backend::Hosted);
    assert!(kernel_address_space().is_none());

    mm.publish().unwrap();
    let published = kernel_address_space().unwrap();
    assert!(Arc::ptr_eq(published, &mm.kernel));

    let other = booted(Backend::Hosted);
    assert_eq!(other.publish(), Err(BootError::AlreadyInstalled));
}

#[test]
fn user_spaces_draw_frames_from_the_page_allocator() {
    let mm = booted(Backend::X86);
    let user: Arc<dyn AddressSpace> = Arc::new(
        X86AddressSpace::create(SpaceKind::User, mm.pages.clone(), mm.ram.clone()).unwrap(),
    );

    let page = mm.pages.allocate_page();
    let va = VirtualAddress::new(0x40_0000);
    user.map(page, va, MappingFlags::WRITABLE).unwrap();
    user.write_bytes(va, b"parent").unwrap();

    let child = user.clone_space().unwrap();
    assert_eq!(mm.pages.pin_count(page), 1);
    assert!(
        child
            .get_mapping(va)
            .unwrap()
            .1
            .contains(MappingFlags::COPY_ON_WRITE)
    );

    user.release_user_mappings();
    assert!(!mm.pages.is_pinned(page));
    let mut buf = [0; 6];
    child.read_bytes(va, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");

    let free = mm.pages.free_pages();
    child.release_user_mappings();
    assert_eq!(mm.pages.free_pages(), free + 1);
    assert_eq!(mm.stats().pinned_pages, 0);
}
