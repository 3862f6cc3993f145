//! # Kernel Boot Information

/// What a range of physical memory may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free RAM; ends up on the free-page stack.
    Usable,
    /// RAM occupied by the kernel image; never handed out.
    KernelImage,
    /// Firmware-reserved RAM.
    Reserved,
    /// Device memory. Never RAM, but claimable by fixed-physical regions.
    Mmio,
}

/// One contiguous extent of the firmware memory map.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryExtent {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryExtent {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryKind::Usable)
    }

    #[must_use]
    pub const fn kernel_image(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryKind::KernelImage)
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Whether the extent is backed by RAM (usable or occupied).
    #[must_use]
    pub const fn is_ram(&self) -> bool {
        matches!(
            self.kind,
            MemoryKind::Usable | MemoryKind::KernelImage | MemoryKind::Reserved
        )
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// The physical memory description handed to the memory manager at boot.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryMap<'a> {
    extents: &'a [MemoryExtent],
}

impl<'a> BootMemoryMap<'a> {
    #[must_use]
    pub const fn new(extents: &'a [MemoryExtent]) -> Self {
        Self { extents }
    }

    pub fn extents(&self) -> impl Iterator<Item = &'a MemoryExtent> + 'a {
        self.extents.iter()
    }

    pub fn of_kind(&self, kind: MemoryKind) -> impl Iterator<Item = &'a MemoryExtent> + 'a {
        self.extents.iter().filter(move |e| e.kind == kind)
    }

    /// Whether `addr` lies inside the kernel image.
    #[must_use]
    pub fn is_kernel_image(&self, addr: u64) -> bool {
        self.of_kind(MemoryKind::KernelImage)
            .any(|e| e.contains(addr))
    }

    /// Total bytes of [`MemoryKind::Usable`] memory.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.of_kind(MemoryKind::Usable).map(|e| e.length).sum()
    }

    /// Exclusive upper bound of all RAM extents.
    #[must_use]
    pub fn ram_end(&self) -> u64 {
        self.extents
            .iter()
            .filter(|e| e.is_ram())
            .map(MemoryExtent::end)
            .max()
            .unwrap_or(0)
    }
}
