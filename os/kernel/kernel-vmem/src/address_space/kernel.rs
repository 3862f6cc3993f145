use super::{AddressSpace, SpaceKind};
use alloc::sync::Arc;
use kernel_sync::SyncOnceCell;

static KERNEL_SPACE: SyncOnceCell<Arc<dyn AddressSpace>> = SyncOnceCell::new();

/// Publish the kernel address space. Done once, at the end of memory bring-up.
///
/// # Errors
/// Hands `space` back if it is not a kernel space or one was already installed.
pub fn install_kernel_address_space(space: Arc<dyn AddressSpace>) -> Result<(), Arc<dyn AddressSpace>> {
    if space.kind() != SpaceKind::Kernel {
        return Err(space);
    }
    KERNEL_SPACE.set(space)
}

/// The kernel address space, once [`install_kernel_address_space`] has run.
///
/// Kernel-half mappings live here and nowhere else; user spaces refuse them.
#[must_use]
pub fn kernel_address_space() -> Option<&'static Arc<dyn AddressSpace>> {
    KERNEL_SPACE.get()
}
