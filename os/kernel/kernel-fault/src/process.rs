use kernel_vmem::PageFault;

/// Identifies a process to the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub u32);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// The scheduler's side of fault escalation.
pub trait ProcessControl {
    /// The process whose context raised the fault, if any. `None` during
    /// early boot and in pure kernel threads.
    fn current(&self) -> Option<ProcessId>;

    /// Kill `process` for an access it had no right to make. The faulting
    /// context is not resumed afterwards.
    fn terminate(&self, process: ProcessId, fault: &PageFault);
}

/// No process context at all; every unresolved fault is fatal.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoProcess;

impl ProcessControl for NoProcess {
    fn current(&self) -> Option<ProcessId> {
        None
    }

    fn terminate(&self, _process: ProcessId, _fault: &PageFault) {}
}
