use bitflags::bitflags;

bitflags! {
    /// Architecture-neutral attributes of a single page mapping.
    ///
    /// Backends translate these into whatever their hardware (or host) can
    /// express; attributes a backend cannot represent are dropped on the way
    /// in and therefore absent when the mapping is queried back. The x86
    /// backend, for instance, has no execute-disable bit and reports every
    /// mapping as [`EXECUTABLE`](Self::EXECUTABLE).
    ///
    /// An empty set describes a present, read-only, user-accessible page.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MappingFlags: u32 {
        /// Writes are permitted.
        const WRITABLE = 1 << 0;
        /// Instruction fetches are permitted.
        const EXECUTABLE = 1 << 1;
        /// Only accessible from kernel mode. On x86 this also marks the
        /// translation global so it survives address-space switches.
        const KERNEL_ONLY = 1 << 2;
        /// The frame is shared with another address space; the first write
        /// must copy it.
        const COPY_ON_WRITE = 1 << 3;
        /// Placeholder for a page that is not resident. Any access faults.
        const SWAPPED = 1 << 4;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 5;
        /// Caching disabled (device memory).
        const CACHE_DISABLE = 1 << 6;
    }
}

impl MappingFlags {
    /// Attributes of a private kernel data page.
    pub const KERNEL_DATA: Self = Self::WRITABLE.union(Self::KERNEL_ONLY);

    /// Attributes for device registers mapped into the kernel.
    pub const DEVICE: Self = Self::KERNEL_DATA.union(Self::CACHE_DISABLE);

    /// Whether an access through this mapping reaches memory at all.
    #[inline]
    #[must_use]
    pub const fn is_resident(self) -> bool {
        !self.contains(Self::SWAPPED)
    }

    /// The flags a shared page carries in both spaces after a fork.
    ///
    /// Write permission is traded for [`COPY_ON_WRITE`](Self::COPY_ON_WRITE)
    /// if the page was writable (or already shared); read-only pages stay as
    /// they are.
    #[must_use]
    pub const fn shared_for_fork(self) -> Self {
        if self.intersects(Self::WRITABLE.union(Self::COPY_ON_WRITE)) {
            self.difference(Self::WRITABLE).union(Self::COPY_ON_WRITE)
        } else {
            self
        }
    }

    /// The flags of a page once its copy-on-write fault has been resolved.
    #[must_use]
    pub const fn after_copy(self) -> Self {
        self.difference(Self::COPY_ON_WRITE).union(Self::WRITABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_sharing_trades_write_for_cow() {
        let data = MappingFlags::WRITABLE | MappingFlags::EXECUTABLE;
        let shared = data.shared_for_fork();
        assert!(!shared.contains(MappingFlags::WRITABLE));
        assert!(shared.contains(MappingFlags::COPY_ON_WRITE | MappingFlags::EXECUTABLE));
        assert_eq!(shared.shared_for_fork(), shared);
        assert_eq!(shared.after_copy(), data);
    }

    #[test]
    fn read_only_pages_are_shared_as_is() {
        let text = MappingFlags::EXECUTABLE;
        assert_eq!(text.shared_for_fork(), text);
    }
}
