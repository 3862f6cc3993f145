mod common;

use common::Fixture;
use kernel_info::memory::{KERNEL_SPACE_START, USER_SCRATCH_WINDOW, USER_STACK_WINDOW};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    AccessError, AddressSpace, CloneError, FrameSource, MapError, MappingFlags, PageFault,
    SpaceKind, StackError,
};

const VA: VirtualAddress = VirtualAddress::new(0x0040_0000);

/// Runs the same behavioural tests against every backend.
macro_rules! backend_tests {
    ($backend:ident) => {
        mod $backend {
            use super::*;

            fn user(fx: &Fixture) -> std::sync::Arc<dyn AddressSpace> {
                fx.$backend(SpaceKind::User)
            }

            fn kernel(fx: &Fixture) -> std::sync::Arc<dyn AddressSpace> {
                fx.$backend(SpaceKind::Kernel)
            }

            #[test]
            fn map_query_unmap() {
                let fx = Fixture::new(16);
                let space = user(&fx);
                let frame = fx.frame();

                assert!(!space.is_mapped(VA));
                space.map(frame, VA, MappingFlags::WRITABLE).unwrap();
                assert!(space.is_mapped(VA));
                assert!(space.is_mapped(VA + 0x123));

                let (pa, flags) = space.get_mapping(VA + 0x10).unwrap();
                assert_eq!(pa, frame);
                assert!(flags.contains(MappingFlags::WRITABLE));
                assert!(!flags.contains(MappingFlags::KERNEL_ONLY));

                assert_eq!(
                    space.map(frame, VA, MappingFlags::empty()),
                    Err(MapError::AlreadyMapped(VA))
                );
                assert_eq!(space.unmap(VA), Ok(frame));
                assert_eq!(space.unmap(VA), Err(MapError::NotMapped(VA)));
                assert!(space.get_mapping(VA).is_none());
            }

            #[test]
            fn misaligned_addresses_are_rejected() {
                let fx = Fixture::new(8);
                let space = user(&fx);
                assert_eq!(
                    space.map(PhysicalAddress::new(0x10_0001), VA, MappingFlags::empty()),
                    Err(MapError::Misaligned(0x10_0001))
                );
                assert_eq!(
                    space.map(fx.frame(), VA + 8, MappingFlags::empty()),
                    Err(MapError::Misaligned(VA.as_u64() + 8))
                );
            }

            #[test]
            fn user_spaces_refuse_the_kernel_half() {
                let fx = Fixture::new(8);
                let space = user(&fx);
                let va = VirtualAddress::new(KERNEL_SPACE_START);
                assert_eq!(
                    space.map(fx.frame(), va, MappingFlags::KERNEL_DATA),
                    Err(MapError::KernelRange(va))
                );

                let kernel = kernel(&fx);
                kernel.map(fx.frame(), va, MappingFlags::KERNEL_DATA).unwrap();
                let (_, flags) = kernel.get_mapping(va).unwrap();
                assert!(flags.contains(MappingFlags::KERNEL_DATA));
            }

            #[test]
            fn addresses_beyond_the_virtual_domain_are_refused() {
                let fx = Fixture::new(8);
                let space = kernel(&fx);
                let frame = fx.frame();
                let va = VirtualAddress::new(0xD000_0000);
                let high = VirtualAddress::new(0x1_D000_0000);
                space.map(frame, va, MappingFlags::KERNEL_DATA).unwrap();

                assert_eq!(
                    space.map(fx.frame(), high, MappingFlags::KERNEL_DATA),
                    Err(MapError::OutOfRange(high))
                );
                assert!(!space.is_mapped(high));
                assert_eq!(space.unmap(high), Err(MapError::OutOfRange(high)));
                assert_eq!(space.get_mapping(va).map(|(pa, _)| pa), Some(frame));

                let mut buf = [0; 4];
                assert!(matches!(
                    space.read_bytes(VirtualAddress::new(u64::MAX - 1), &mut buf),
                    Err(AccessError::Fault(_))
                ));
            }

            #[test]
            fn oversized_stacks_are_refused() {
                let fx = Fixture::new(8);
                let space = user(&fx);
                for size in [u64::MAX, u64::MAX - PAGE_SIZE] {
                    assert!(matches!(
                        space.allocate_stack(size),
                        Err(StackError::NoVirtualSpace(_))
                    ));
                }
            }

            #[test]
            fn set_flags_keeps_the_frame() {
                let fx = Fixture::new(8);
                let space = user(&fx);
                let frame = fx.frame();
                space.map(frame, VA, MappingFlags::WRITABLE).unwrap();

                space
                    .set_flags(VA, MappingFlags::COPY_ON_WRITE)
                    .unwrap();
                let (pa, flags) = space.get_mapping(VA).unwrap();
                assert_eq!(pa, frame);
                assert!(flags.contains(MappingFlags::COPY_ON_WRITE));
                assert!(!flags.contains(MappingFlags::WRITABLE));

                assert_eq!(
                    space.set_flags(VA + PAGE_SIZE, MappingFlags::empty()),
                    Err(MapError::NotMapped(VA + PAGE_SIZE))
                );
            }

            #[test]
            fn simulated_accesses_fault_like_the_cpu() {
                let fx = Fixture::new(8);
                let space = user(&fx);
                space.map(fx.frame(), VA, MappingFlags::WRITABLE).unwrap();
                space.map(fx.frame(), VA + PAGE_SIZE, MappingFlags::empty()).unwrap();

                // A write spanning into the read-only page stops there.
                let data = [0xAB; 32];
                assert_eq!(
                    space.write_bytes(VA + PAGE_SIZE - 16, &data),
                    Err(AccessError::Fault(PageFault::write_protected(VA + PAGE_SIZE)))
                );

                let mut buf = [0; 16];
                space.read_bytes(VA + PAGE_SIZE - 16, &mut buf).unwrap();
                assert_eq!(buf, [0xAB; 16]);

                let unmapped = VA + 2 * PAGE_SIZE;
                assert_eq!(
                    space.read_bytes(unmapped, &mut buf),
                    Err(AccessError::Fault(PageFault::not_present(unmapped, false)))
                );
            }

            #[test]
            fn swapped_placeholders_occupy_the_slot_but_fault() {
                let fx = Fixture::new(8);
                let space = user(&fx);
                space
                    .map(PhysicalAddress::new(0x7000), VA, MappingFlags::SWAPPED)
                    .unwrap();
                assert!(space.is_mapped(VA));
                assert!(matches!(
                    space.map(fx.frame(), VA, MappingFlags::empty()),
                    Err(MapError::AlreadyMapped(_))
                ));

                let mut buf = [0; 4];
                assert!(matches!(
                    space.read_bytes(VA, &mut buf),
                    Err(AccessError::Fault(fault)) if !fault.error.present()
                ));
            }

            #[test]
            fn stacks_are_backed_lazily_above_a_guard_page() {
                let fx = Fixture::new(32);
                let space = user(&fx);
                let before = fx.frames.available();

                let top = space.allocate_stack(4 * PAGE_SIZE).unwrap();
                assert!(USER_STACK_WINDOW.contains(top - 1));
                assert!(space.is_mapped(top - PAGE_SIZE));
                assert!(!space.is_mapped(top - 2 * PAGE_SIZE));

                let record = space.stack_containing(top - 1).unwrap();
                assert_eq!(record.size(), 4 * PAGE_SIZE);
                assert!(record.is_guard(top - 5 * PAGE_SIZE));

                assert_eq!(space.back_stack_page(top - 2 * PAGE_SIZE + 8), Ok(true));
                assert_eq!(space.back_stack_page(top - 2 * PAGE_SIZE), Ok(false));
                assert_eq!(space.back_stack_page(record.guard), Ok(false));
                assert_eq!(space.back_stack_page(VA), Ok(false));

                space.write_bytes(top - 2 * PAGE_SIZE, b"deep").unwrap();

                space.free_stack(top).unwrap();
                assert!(!space.is_mapped(top - PAGE_SIZE));
                assert!(space.stack_containing(top - 1).is_none());
                assert_eq!(
                    space.free_stack(top),
                    Err(StackError::UnknownStack(top))
                );
                // Only paging structures (if any) stay allocated.
                assert!(before - fx.frames.available() <= 1);
            }

            #[test]
            fn scratch_slots_are_recycled() {
                let fx = Fixture::new(8);
                let space = user(&fx);
                let a = space.allocate_scratch().unwrap();
                let b = space.allocate_scratch().unwrap();
                assert_ne!(a, b);
                assert!(USER_SCRATCH_WINDOW.contains(a));
                space.release_scratch(a);
                assert_eq!(space.allocate_scratch(), Some(a));
            }

            #[test]
            fn clone_shares_pages_copy_on_write() {
                let fx = Fixture::new(32);
                let parent = user(&fx);
                let data = fx.frame();
                let text = fx.frame();
                parent.map(data, VA, MappingFlags::WRITABLE).unwrap();
                parent.map(text, VA + PAGE_SIZE, MappingFlags::EXECUTABLE).unwrap();
                parent.write_bytes(VA, b"parent").unwrap();
                let stack = parent.allocate_stack(2 * PAGE_SIZE).unwrap();

                let child = parent.clone_space().unwrap();
                assert_eq!(child.kind(), SpaceKind::User);

                for space in [&parent, &child] {
                    let (pa, flags) = space.get_mapping(VA).unwrap();
                    assert_eq!(pa, data);
                    assert!(flags.contains(MappingFlags::COPY_ON_WRITE));
                    assert!(!flags.contains(MappingFlags::WRITABLE));

                    let (pa, flags) = space.get_mapping(VA + PAGE_SIZE).unwrap();
                    assert_eq!(pa, text);
                    assert!(!flags.contains(MappingFlags::COPY_ON_WRITE));
                }
                assert!(fx.frames.is_frame_pinned(data));
                assert!(fx.frames.is_frame_pinned(text));

                let mut buf = [0; 6];
                child.read_bytes(VA, &mut buf).unwrap();
                assert_eq!(&buf, b"parent");
                assert_eq!(
                    child.write_bytes(VA, b"child"),
                    Err(AccessError::Fault(PageFault::write_protected(VA)))
                );

                // Stack bookkeeping followed, so the child grows its stack lazily too.
                assert!(child.stack_containing(stack - 1).is_some());
                assert_eq!(child.back_stack_page(stack - 2 * PAGE_SIZE), Ok(true));
            }

            #[test]
            fn kernel_spaces_cannot_be_cloned() {
                let fx = Fixture::new(8);
                assert!(matches!(kernel(&fx).clone_space(), Err(CloneError::KernelSpace)));
            }

            #[test]
            fn releasing_user_mappings_returns_every_frame() {
                let fx = Fixture::new(32);
                let before = fx.frames.available();
                {
                    let parent = user(&fx);
                    let frame = fx.frame();
                    parent.map(frame, VA, MappingFlags::WRITABLE).unwrap();
                    parent.allocate_stack(PAGE_SIZE).unwrap();

                    let child = parent.clone_space().unwrap();
                    child.release_user_mappings();
                    assert!(!fx.frames.is_frame_pinned(frame));
                    assert!(parent.is_mapped(VA));

                    parent.release_user_mappings();
                    assert!(!parent.is_mapped(VA));
                }
                assert_eq!(fx.frames.available(), before);
            }
        }
    };
}

backend_tests!(x86);
backend_tests!(hosted);

#[test]
fn hosted_spaces_have_no_sections() {
    let fx = Fixture::new(8);
    let space = fx.hosted(SpaceKind::Kernel);
    let va = VirtualAddress::new(0xD000_0000);
    assert_eq!(
        space.map_section(PhysicalAddress::new(0x0400_0000), va, MappingFlags::DEVICE),
        Err(MapError::SectionsUnsupported)
    );
    assert_eq!(space.unmap_section(va), Err(MapError::NotMapped(va)));
    assert!(!space.is_mapped(va));
}
