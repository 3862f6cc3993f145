use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

/// Error code an x86 CPU pushes with a page fault (Intel SDM Vol. 3A, 4.7).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// Set for a protection violation on a present page, clear if the page
    /// was not present at all.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from ring 3.
    pub user: bool,
    /// A paging structure had a reserved bit set.
    pub reserved_bit: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    /// One-line human description, for logs and panics.
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        match (self.present(), self.instruction_fetch(), self.user(), self.write()) {
            (false, ..) => "page not present",
            (true, true, true, _) => "user fetch from a protected page",
            (true, true, false, _) => "kernel fetch from a protected page",
            (true, false, _, true) => "write to a read-only page",
            (true, false, _, false) => "read from a protected page",
        }
    }
}

/// A faulting access: the address the CPU reported (CR2) plus the error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, error: PageFaultError) -> Self {
        Self { address, error }
    }

    /// A kernel-mode read of an unmapped address.
    #[must_use]
    pub const fn not_present(address: VirtualAddress, write: bool) -> Self {
        Self::new(address, PageFaultError::new().with_write(write))
    }

    /// A kernel-mode write to a present but read-only page.
    #[must_use]
    pub const fn write_protected(address: VirtualAddress) -> Self {
        Self::new(
            address,
            PageFaultError::new().with_present(true).with_write(true),
        )
    }

    /// Same fault, raised from user mode.
    #[must_use]
    pub const fn from_user(self) -> Self {
        Self::new(self.address, self.error.with_user(true))
    }

    /// A write to a page that is mapped but not writable.
    #[must_use]
    pub const fn is_write_protection(&self) -> bool {
        self.error.present() && self.error.write()
    }
}

impl core::fmt::Display for PageFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "page fault at {} (err={:#x}): {}",
            self.address,
            self.error.into_bits(),
            self.error.explain()
        )
    }
}
