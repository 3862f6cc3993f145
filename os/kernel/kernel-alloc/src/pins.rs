use hashbrown::HashMap;
use kernel_memory_addresses::PhysicalAddress;

/// Extra owners of shared physical pages.
///
/// A page absent from the table has exactly one owner. Each pin adds one
/// more, and each release while pinned removes one again without freeing.
#[derive(Default)]
pub(crate) struct PinTable {
    extra_owners: HashMap<u64, u32>,
}

impl PinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&mut self, page: PhysicalAddress) -> u32 {
        let count = self.extra_owners.entry(page.as_u64()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one extra owner. Returns `false` if the page was not pinned,
    /// in which case the caller is the last owner and frees it.
    pub fn release(&mut self, page: PhysicalAddress) -> bool {
        let Some(count) = self.extra_owners.get_mut(&page.as_u64()) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.extra_owners.remove(&page.as_u64());
        }
        true
    }

    pub fn count(&self, page: PhysicalAddress) -> u32 {
        self.extra_owners
            .get(&page.as_u64())
            .copied()
            .unwrap_or(0)
    }

    /// Number of distinct pinned pages.
    pub fn len(&self) -> usize {
        self.extra_owners.len()
    }
}
