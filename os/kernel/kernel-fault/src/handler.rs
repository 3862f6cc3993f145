use crate::cow::resolve_copy_on_write;
use crate::process::{ProcessControl, ProcessId};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::KERNEL_SPACE_START;
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, PageFault};
use log::{debug, error, warn};

/// Last-chance handler for user-half faults nothing else resolved, such as
/// memory-mapped files or emulated devices.
pub trait MemoryTrapHandler: Send + Sync {
    /// Returns `true` if the fault was dealt with and the access may be
    /// retried.
    fn trap(&self, space: &dyn AddressSpace, fault: &PageFault) -> bool;
}

/// What [`PageFaultHandler::handle`] did about a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultResolution {
    /// A lazily backed stack page received its frame.
    StackBacked,
    /// A copy-on-write page became private to the faulting space.
    CopyOnWrite,
    /// A [`MemoryTrapHandler`] took care of it.
    Trapped,
    /// Unresolvable; the process was terminated.
    Terminated(ProcessId),
}

impl FaultResolution {
    /// Whether the faulting access can simply be retried.
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Terminated(_))
    }
}

/// Resolves page faults against an address space.
pub struct PageFaultHandler {
    traps: SpinLock<Vec<Arc<dyn MemoryTrapHandler>>>,
}

impl Default for PageFaultHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFaultHandler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            traps: SpinLock::new(Vec::new()),
        }
    }

    /// Add a trap handler behind those already registered.
    pub fn register_trap(&self, handler: Arc<dyn MemoryTrapHandler>) {
        self.traps.lock().push(handler);
    }

    /// Resolve `fault`, raised while `space` was active.
    ///
    /// # Panics
    /// - If the fault cannot be resolved and `process` has no current process.
    /// - If resolving a copy-on-write fault runs out of memory.
    pub fn handle(
        &self,
        space: &dyn AddressSpace,
        fault: &PageFault,
        process: &dyn ProcessControl,
    ) -> FaultResolution {
        let va = fault.address;

        if !fault.error.present() {
            match space.back_stack_page(va) {
                Ok(true) => return FaultResolution::StackBacked,
                Ok(false) => {}
                Err(e) => warn!("cannot back stack page at {va}: {e}"),
            }
            if let Some(stack) = space.stack_containing(va).filter(|s| s.is_guard(va)) {
                warn!("stack overflow: {va} is the guard page below {}", stack.top);
            }
        } else if fault.is_write_protection()
            && !fault.error.instruction_fetch()
            && let Some(outcome) = resolve_copy_on_write(space, va)
        {
            debug!("copy-on-write at {va}: {outcome:?}");
            return FaultResolution::CopyOnWrite;
        }

        if va.as_u64() < KERNEL_SPACE_START && self.trap(space, fault) {
            return FaultResolution::Trapped;
        }

        error!("page fault at {va}: {}", fault.error.explain());
        let Some(pid) = process.current() else {
            panic!("unhandled {fault}");
        };
        process.terminate(pid, fault);
        FaultResolution::Terminated(pid)
    }

    fn trap(&self, space: &dyn AddressSpace, fault: &PageFault) -> bool {
        // Handlers may register others or take their own locks.
        let traps = self.traps.lock().clone();
        traps.iter().any(|handler| handler.trap(space, fault))
    }
}
