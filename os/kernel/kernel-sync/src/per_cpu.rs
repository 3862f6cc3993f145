use crate::SyncOnceCell;

/// Upper bound on the number of CPUs the per-CPU tables are sized for.
pub const MAX_CPUS: usize = 16;

static CPU_ID_SOURCE: SyncOnceCell<fn() -> usize> = SyncOnceCell::new();

/// Install the function that reports the logical id of the executing CPU.
///
/// Until a source is registered every caller is treated as CPU 0, which is
/// correct for early boot and single-threaded hosts.
///
/// # Errors
/// Returns the rejected function if a source was already registered.
pub fn register_cpu_id_source(source: fn() -> usize) -> Result<(), fn() -> usize> {
    CPU_ID_SOURCE.set(source)
}

/// Logical id of the executing CPU, `0` if no source is registered.
#[inline]
#[must_use]
pub fn current_cpu_id() -> usize {
    CPU_ID_SOURCE.get().map_or(0, |source| source())
}

/// One `T` per CPU, selected by [`current_cpu_id`].
///
/// Ids at or above `N` wrap around, so two CPUs may end up sharing a slot;
/// `T` must therefore tolerate concurrent use (atomics, locks).
pub struct PerCpu<T, const N: usize = MAX_CPUS> {
    slots: [T; N],
}

impl<T, const N: usize> PerCpu<T, N> {
    pub fn from_fn(init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: core::array::from_fn(init),
        }
    }

    /// The slot of the executing CPU.
    #[inline]
    pub fn current(&self) -> &T {
        &self.slots[current_cpu_id() % N]
    }

    #[inline]
    pub fn get(&self, cpu: usize) -> Option<&T> {
        self.slots.get(cpu)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

impl<T: Default, const N: usize> Default for PerCpu<T, N> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}
