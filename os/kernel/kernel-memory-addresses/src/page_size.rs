use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// A granularity the 32-bit MMU can map at. Implemented only by [`Size4K`]
/// and [`Size4M`].
pub trait PageSize:
    sealed::Sealed + Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display
{
    /// Bits of an address that select a byte within the page.
    const SHIFT: u32;
    const SIZE: u64 = 1 << Self::SHIFT;
    /// Mask of the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;
    const NAME: &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(
    /// An ordinary page, mapped by a page-table entry.
    Size4K, 12, "4 KiB"
);

page_size!(
    /// A section, mapped by a single page-directory entry with `PS` set.
    Size4M, 22, "4 MiB"
);

const _: () = {
    assert!(Size4K::SIZE == 4096);
    assert!(Size4M::SIZE == 1024 * Size4K::SIZE);
};
