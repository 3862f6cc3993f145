use crate::flags::MappingFlags;
use bitflags::bitflags;

bitflags! {
    /// Page protection as understood by a host `mmap`/`mprotect`.
    ///
    /// The empty set is `PROT_NONE`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct HostProtection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl HostProtection {
    /// Swapped placeholders become `PROT_NONE`; everything else is readable.
    #[must_use]
    pub const fn from_flags(flags: MappingFlags) -> Self {
        if flags.contains(MappingFlags::SWAPPED) {
            return Self::empty();
        }
        let mut protection = Self::READ;
        if flags.contains(MappingFlags::WRITABLE) {
            protection = protection.union(Self::WRITE);
        }
        if flags.contains(MappingFlags::EXECUTABLE) {
            protection = protection.union(Self::EXEC);
        }
        protection
    }

    #[must_use]
    pub const fn to_flags(self) -> MappingFlags {
        if self.is_empty() {
            return MappingFlags::SWAPPED;
        }
        let mut flags = MappingFlags::empty();
        if self.contains(Self::WRITE) {
            flags = flags.union(MappingFlags::WRITABLE);
        }
        if self.contains(Self::EXEC) {
            flags = flags.union(MappingFlags::EXECUTABLE);
        }
        flags
    }
}
