mod common;

use common::Fixture;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::x86::{Pde, Pte};
use kernel_vmem::{
    AddressSpace, FrameSource, MapError, MapSize, MappingFlags, PhysMapper, SpaceKind,
    X86AddressSpace,
};

fn space(fx: &Fixture, kind: SpaceKind) -> X86AddressSpace {
    X86AddressSpace::create(kind, fx.frames.clone(), fx.ram.clone()).unwrap()
}

fn read_entry(fx: &Fixture, table: PhysicalAddress, index: usize) -> u32 {
    let mut raw = [0u8; 4];
    fx.ram.read(table + (index as u64) * 4, &mut raw).unwrap();
    u32::from_ne_bytes(raw)
}

#[test]
fn entries_land_in_the_hardware_tables() {
    let fx = Fixture::new(8);
    let space = space(&fx, SpaceKind::User);
    let frame = fx.frame();
    let va = VirtualAddress::new(0x0080_3000);
    space.map(frame, va, MappingFlags::WRITABLE).unwrap();

    let pde = Pde::from_bits(read_entry(&fx, space.directory_frame(), va.directory_index()));
    assert!(pde.is_table());
    assert!(pde.user());

    let pte = Pte::from_bits(read_entry(&fx, pde.address(), va.table_index()));
    assert_eq!(pte.address(), frame);
    assert!(pte.present() && pte.writable() && pte.user());
}

#[test]
fn page_tables_come_from_the_escrow() {
    let fx = Fixture::new(8);
    let space = space(&fx, SpaceKind::Kernel);
    assert_eq!(fx.frames.escrow().held(), 0);

    space
        .map(fx.frame(), VirtualAddress::new(0xC000_0000), MappingFlags::KERNEL_DATA)
        .unwrap();
    // The refill happened before the walk and the table consumed it.
    assert_eq!(fx.frames.escrow().held(), 0);

    space
        .map(fx.frame(), VirtualAddress::new(0xC000_1000), MappingFlags::KERNEL_DATA)
        .unwrap();
    // Same table; the refilled frame stays parked.
    assert_eq!(fx.frames.escrow().held(), 1);
}

#[test]
fn mapping_fails_cleanly_when_no_table_frame_is_left() {
    let fx = Fixture::new(2);
    let space = space(&fx, SpaceKind::Kernel);
    let frame = fx.frame();
    assert_eq!(
        space.map(frame, VirtualAddress::new(0xC000_0000), MappingFlags::KERNEL_DATA),
        Err(MapError::OutOfMemory)
    );
}

#[test]
fn page_structures_are_built_from_the_given_frames() {
    let fx = Fixture::new(8);
    let space = space(&fx, SpaceKind::Kernel);
    let va = VirtualAddress::new(0xF000_0000);
    let (a, b, c) = (fx.frame(), fx.frame(), fx.frame());

    // First frame becomes the page table, second the page itself.
    assert!(space.map_page_structures(a, va, MappingFlags::KERNEL_DATA));
    assert!(!space.is_mapped(va));
    assert!(space.map_page_structures(b, va, MappingFlags::KERNEL_DATA));
    assert_eq!(space.get_mapping(va).map(|(pa, _)| pa), Some(b));
    assert!(!space.map_page_structures(c, va, MappingFlags::KERNEL_DATA));
    assert_eq!(fx.frames.escrow().held(), 0);
}

#[test]
fn sections_cover_four_megabytes() {
    let fx = Fixture::new(8);
    let space = space(&fx, SpaceKind::Kernel);
    let base = PhysicalAddress::new(0x0400_0000);
    let va = VirtualAddress::new(0xD000_0000);

    space.map_section(base, va, MappingFlags::DEVICE).unwrap();
    let (pa, flags) = space.get_mapping(va + 0x12_3456).unwrap();
    assert_eq!(pa, base + 0x12_3000);
    assert!(flags.contains(MappingFlags::DEVICE));

    assert_eq!(
        space.map(fx.frame(), va + PAGE_SIZE, MappingFlags::KERNEL_DATA),
        Err(MapError::LargePage(va + PAGE_SIZE))
    );
    assert_eq!(space.unmap(va), Err(MapError::LargePage(va)));
    assert!(matches!(
        space.map_section(base, va + PAGE_SIZE, MappingFlags::DEVICE),
        Err(MapError::Misaligned(_))
    ));

    // Re-flagging a section keeps its base.
    space.set_flags(va, MappingFlags::KERNEL_ONLY).unwrap();
    let (pa, flags) = space.get_mapping(va).unwrap();
    assert_eq!(pa, base);
    assert!(!flags.contains(MappingFlags::WRITABLE));

    assert_eq!(space.unmap_section(va), Ok(base));
    assert!(!space.is_mapped(va));
    assert_eq!(space.unmap_section(va), Err(MapError::NotMapped(va)));
}

#[test]
fn mappings_walk_only_populated_tables() {
    let fx = Fixture::new(16);
    let space = space(&fx, SpaceKind::User);
    let pages = [0x0000_1000, 0x0000_2000, 0x0840_0000, 0xA000_0000];
    for va in pages {
        space
            .map(fx.frame(), VirtualAddress::new(va), MappingFlags::empty())
            .unwrap();
    }

    let found: Vec<u64> = space
        .mappings(VirtualAddress::zero(), VirtualAddress::new(0xC000_0000))
        .iter()
        .map(|m| m.virt.as_u64())
        .collect();
    assert_eq!(found, pages);

    let window: Vec<u64> = space
        .mappings(VirtualAddress::new(0x2000), VirtualAddress::new(0x0840_0000))
        .iter()
        .map(|m| m.virt.as_u64())
        .collect();
    assert_eq!(window, [0x2000]);
}

#[test]
fn dropping_a_user_space_frees_its_tables() {
    let fx = Fixture::new(16);
    let before = fx.frames.available();
    let frame = fx.frame();
    {
        let space = space(&fx, SpaceKind::User);
        space.map(frame, VirtualAddress::new(0x1000), MappingFlags::empty()).unwrap();
        space.map(frame, VirtualAddress::new(0x0100_0000), MappingFlags::empty()).unwrap();
    }
    // Everything but the leaf frame (still owned by the test) came back.
    assert_eq!(fx.frames.available(), before - 1);
    fx.frames.release_frame(frame);
    assert_eq!(fx.frames.available(), before);
}

#[test]
fn addresses_beyond_32_bits_never_alias() {
    let fx = Fixture::new(8);
    let space = space(&fx, SpaceKind::Kernel);
    let frame = fx.frame();
    let low = VirtualAddress::new(0xD000_0000);
    let high = VirtualAddress::new(0x1_D000_0000);
    space.map(frame, low, MappingFlags::KERNEL_DATA).unwrap();

    assert_eq!(
        space.map(fx.frame(), high, MappingFlags::KERNEL_DATA),
        Err(MapError::OutOfRange(high))
    );
    assert_eq!(space.get_mapping(high), None);
    assert_eq!(space.unmap(high), Err(MapError::OutOfRange(high)));
    assert_eq!(
        space.set_flags(high, MappingFlags::KERNEL_ONLY),
        Err(MapError::OutOfRange(high))
    );
    assert_eq!(space.do_get_mapping(high), None);
    assert_eq!(space.get_mapping(low).map(|(pa, _)| pa), Some(frame));
}

#[test]
fn frames_beyond_4_gib_are_refused() {
    let fx = Fixture::new(8);
    let space = space(&fx, SpaceKind::Kernel);
    let va = VirtualAddress::new(0xD000_0000);
    let far = PhysicalAddress::new(0x1_0000_0000);

    assert_eq!(
        space.map(far, va, MappingFlags::KERNEL_DATA),
        Err(MapError::FrameOutOfRange(far))
    );
    assert_eq!(
        space.map_section(far, va, MappingFlags::DEVICE),
        Err(MapError::FrameOutOfRange(far))
    );
    assert!(!space.map_page_structures(far, va, MappingFlags::KERNEL_DATA));
    assert!(!space.is_mapped(va));
}

#[test]
fn user_siblings_share_the_kernel_half() {
    let fx = Fixture::new(16);
    let kernel = space(&fx, SpaceKind::Kernel);
    let early = VirtualAddress::new(0xD000_0000);
    let frame = fx.frame();
    kernel.map(frame, early, MappingFlags::KERNEL_DATA).unwrap();

    let before = fx.frames.available();
    let user = kernel.create_user_sibling().unwrap();
    let slot = early.directory_index();
    let shared = read_entry(&fx, user.directory_frame(), slot);
    assert_ne!(shared, 0);
    assert_eq!(shared, read_entry(&fx, kernel.directory_frame(), slot));

    // Tables and sections the kernel adds later show up as well.
    let late = VirtualAddress::new(0xE000_0000);
    kernel.map(fx.frame(), late, MappingFlags::KERNEL_DATA).unwrap();
    let section = VirtualAddress::new(0xD800_0000);
    kernel
        .map_section(PhysicalAddress::new(0x0400_0000), section, MappingFlags::DEVICE)
        .unwrap();
    for va in [late, section] {
        let index = va.directory_index();
        assert_ne!(read_entry(&fx, user.directory_frame(), index), 0);
        assert_eq!(
            read_entry(&fx, user.directory_frame(), index),
            read_entry(&fx, kernel.directory_frame(), index)
        );
    }
    kernel.unmap_section(section).unwrap();
    assert_eq!(read_entry(&fx, user.directory_frame(), section.directory_index()), 0);

    // The user space neither answers for nor edits the kernel half.
    assert_eq!(user.get_mapping(early), None);
    assert_eq!(user.unmap(early), Err(MapError::KernelRange(early)));
    assert_eq!(kernel.get_mapping(early).map(|(pa, _)| pa), Some(frame));

    // Dropping the sibling gives back only its directory; the kernel keeps
    // the table and leaf it mapped at `late`.
    drop(user);
    assert_eq!(fx.frames.available(), before - 2);
}

#[test]
fn clones_share_sections_without_owning_them() {
    let fx = Fixture::new(16);
    let kernel = space(&fx, SpaceKind::Kernel);
    let parent = kernel.new_user_sibling().unwrap();
    let page = VirtualAddress::new(0x1000);
    let window = VirtualAddress::new(0x0080_0000);
    let device = PhysicalAddress::new(0x0400_0000);
    parent.map(fx.frame(), page, MappingFlags::WRITABLE).unwrap();
    parent.map_section(device, window, MappingFlags::DEVICE).unwrap();

    let listed: Vec<(u64, MapSize)> = parent
        .mappings(VirtualAddress::zero(), VirtualAddress::new(0xC000_0000))
        .iter()
        .map(|m| (m.virt.as_u64(), m.size))
        .collect();
    assert_eq!(listed, [(0x1000, MapSize::Page), (0x0080_0000, MapSize::Section)]);

    let child = parent.clone_space().unwrap();
    let (pa, flags) = child.get_mapping(window + 0x5000).unwrap();
    assert_eq!(pa, device + 0x5000);
    assert!(flags.contains(MappingFlags::DEVICE));
    assert!(!flags.contains(MappingFlags::COPY_ON_WRITE));

    let before = fx.frames.available();
    child.release_user_mappings();
    assert!(!child.is_mapped(window));
    assert!(parent.is_mapped(window));
    assert!(!fx.frames.is_frame_pinned(device));
    // The shared page lost a pin; nothing else came back.
    assert_eq!(fx.frames.available(), before);
}
