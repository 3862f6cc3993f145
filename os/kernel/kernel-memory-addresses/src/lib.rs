//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the two address domains the memory manager
//! juggles, so a physical frame number can never be handed to code that
//! expects a virtual address (or the other way around).
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A location in RAM or MMIO space, as seen by the bus. |
//! | [`VirtualAddress`] | A location in some address space, translated by paging. |
//!
//! Page granularity is expressed with the sealed [`PageSize`] markers:
//!
//! - [`Size4K`]: the base page, the unit of every allocator in the kernel.
//! - [`Size4M`]: a page-directory section (PSE) on 32-bit x86.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC012_3456);
//! assert_eq!(va.align_down::<Size4K>().as_u64(), 0xC012_3000);
//! assert_eq!(va.page_offset::<Size4K>(), 0x456);
//! assert_eq!(va.align_down::<Size4M>().as_u64(), 0xC000_0000);
//! assert!(!va.is_aligned::<Size4K>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of the base page in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Number of base pages needed to hold `bytes`.
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Implements the shared surface of an address newtype.
macro_rules! address_newtype {
    ($name:ident, $debug_tag:literal) => {
        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Whether the address sits on an `S` boundary.
            #[inline]
            #[must_use]
            pub const fn is_aligned<S: $crate::PageSize>(self) -> bool {
                self.0 & S::OFFSET_MASK == 0
            }

            /// Base of the `S`-sized page containing this address.
            #[inline]
            #[must_use]
            pub const fn align_down<S: $crate::PageSize>(self) -> Self {
                Self($crate::align_down(self.0, S::SIZE))
            }

            /// Smallest `S` boundary at or above this address.
            #[inline]
            #[must_use]
            pub const fn align_up<S: $crate::PageSize>(self) -> Self {
                Self($crate::align_up(self.0, S::SIZE))
            }

            /// Offset of this address within its `S`-sized page.
            #[inline]
            #[must_use]
            pub const fn page_offset<S: $crate::PageSize>(self) -> u64 {
                self.0 & S::OFFSET_MASK
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Distance in bytes from `base` up to `self`.
            #[inline]
            #[must_use]
            pub const fn offset_from(self, base: Self) -> u64 {
                self.0 - base.0
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!($debug_tag, "(0x{:08X})"), self.0)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "0x{:08X}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(v: $name) -> Self {
                v.as_u64()
            }
        }

        impl core::ops::Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl core::ops::AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl core::ops::Sub<u64> for $name {
            type Output = Self;
            #[inline]
            fn sub(self, rhs: u64) -> Self::Output {
                Self(self.0 - rhs)
            }
        }
    };
}

pub(crate) use address_newtype;
