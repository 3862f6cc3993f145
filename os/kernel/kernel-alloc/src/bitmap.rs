use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// One bit per physical page, set while the page is handed out.
///
/// Only consulted to catch double frees. Storage is sized up front by
/// [`cover`](Self::cover) so marking never allocates under the allocator lock.
#[derive(Default)]
pub(crate) struct AllocationBitmap {
    words: Vec<u64>,
}

impl AllocationBitmap {
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Make room for every page below `end`.
    pub fn cover(&mut self, end: u64) {
        let pages = end.div_ceil(PAGE_SIZE);
        let words = usize::try_from(pages.div_ceil(64)).unwrap_or(usize::MAX);
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    fn locate(page: PhysicalAddress) -> (usize, u64) {
        let index = page.as_u64() / PAGE_SIZE;
        let word = usize::try_from(index / 64).unwrap_or(usize::MAX);
        (word, 1 << (index % 64))
    }

    pub fn is_allocated(&self, page: PhysicalAddress) -> bool {
        let (word, bit) = Self::locate(page);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    pub fn set_allocated(&mut self, page: PhysicalAddress) {
        let (word, bit) = Self::locate(page);
        if let Some(w) = self.words.get_mut(word) {
            *w |= bit;
        }
    }

    pub fn set_free(&mut self, page: PhysicalAddress) {
        let (word, bit) = Self::locate(page);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
    }
}
