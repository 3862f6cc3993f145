//! # Range tracking
//!
//! [`RangeTracker`] keeps the set of *available* addresses in some domain as
//! ordered, disjoint, non-adjacent `[base, base + length)` intervals. The same
//! type tracks physical memory holes, the kernel's region window and each
//! address space's stack and scratch windows.
//!
//! ```text
//!   free:     [0x1000 ─── 0x4000)          [0x8000 ─── 0x9000)
//!   allocate(0x1000)  → 0x1000   (first fit, lowest address)
//!   free(0x4000, 0x4000)         → coalesces into [0x2000 ─── 0x9000)
//! ```
//!
//! The tracker does no locking of its own; owners keep it behind a
//! `SpinLock`.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

/// A half-open interval `[base, base + length)`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Range {
    pub base: u64,
    pub length: u64,
}

impl Range {
    #[must_use]
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }

    /// Exclusive end.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base, self.end())
    }
}

/// Placement requirements for [`RangeTracker::allocate`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Constraints {
    /// Required alignment of the returned base (power of two, `1` for none).
    pub alignment: u64,
    /// If set, the whole allocation must end at or below this address.
    pub ceiling: Option<u64>,
}

impl Constraints {
    pub const NONE: Self = Self {
        alignment: 1,
        ceiling: None,
    };

    #[must_use]
    pub const fn aligned(alignment: u64) -> Self {
        Self {
            alignment,
            ceiling: None,
        }
    }

    #[must_use]
    pub const fn below(self, ceiling: u64) -> Self {
        Self {
            alignment: self.alignment,
            ceiling: Some(ceiling),
        }
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self::NONE
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("no free range of {0:#x} bytes satisfies the constraints")]
    NoSpace(u64),
    #[error("range {0:?} is not entirely free")]
    Taken(Range),
    #[error("zero-length range")]
    ZeroLength,
    #[error("alignment {0:#x} is not a power of two")]
    BadAlignment(u64),
    #[error("range at {0:#x} overflows the address domain")]
    Overflow(u64),
}

/// Free/used interval bookkeeping over one address domain.
#[derive(Default, Clone)]
pub struct RangeTracker {
    /// base → length of every free interval.
    free: BTreeMap<u64, u64>,
}

impl RangeTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free: BTreeMap::new(),
        }
    }

    /// A tracker whose only free interval is `[base, base + length)`.
    #[must_use]
    pub fn with_range(base: u64, length: u64) -> Self {
        let mut tracker = Self::new();
        tracker.free(base, length);
        tracker
    }

    /// Return `[base, base + length)` to the free set.
    ///
    /// Coalesces with every free interval it touches or overlaps, so the set
    /// stays minimal no matter in which order ranges come back.
    pub fn free(&mut self, base: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = base;
        let mut end = base.saturating_add(length);

        // Intervals are disjoint and sorted, so their ends grow with their
        // bases: walk backwards from `end` until one ends before `start`.
        let touching: Vec<(u64, u64)> = self
            .free
            .range(..=end)
            .rev()
            .take_while(|&(&b, &l)| b + l >= start)
            .map(|(&b, &l)| (b, l))
            .collect();

        for (b, l) in touching {
            self.free.remove(&b);
            start = start.min(b);
            end = end.max(b + l);
        }

        self.free.insert(start, end - start);
    }

    /// Reserve `length` bytes anywhere, first fit from the lowest address.
    ///
    /// # Errors
    /// - [`RangeError::ZeroLength`] / [`RangeError::BadAlignment`] for bad requests.
    /// - [`RangeError::NoSpace`] if no free interval satisfies the constraints.
    pub fn allocate(&mut self, length: u64, constraints: Constraints) -> Result<u64, RangeError> {
        if length == 0 {
            return Err(RangeError::ZeroLength);
        }
        let align = constraints.alignment.max(1);
        if !align.is_power_of_two() {
            return Err(RangeError::BadAlignment(align));
        }

        let mut found = None;
        for (&b, &l) in &self.free {
            let Some(start) = b.checked_add(align - 1).map(|v| v & !(align - 1)) else {
                break;
            };
            let Some(end) = start.checked_add(length) else {
                break;
            };
            if constraints.ceiling.is_some_and(|ceiling| end > ceiling) {
                // Later intervals only start higher.
                if constraints.ceiling.is_some_and(|ceiling| start >= ceiling) {
                    break;
                }
                continue;
            }
            if end <= b + l {
                found = Some((b, l, start, end));
                break;
            }
        }

        let Some((b, l, start, end)) = found else {
            return Err(RangeError::NoSpace(length));
        };
        self.carve(b, l, start, end);
        Ok(start)
    }

    /// Reserve exactly `[base, base + length)`.
    ///
    /// Without `force` the whole range must currently be free. With `force`
    /// whatever parts of it are free get removed and the call succeeds even if
    /// some (or all) of it was already taken; such a range must never be handed
    /// back through [`free`](Self::free) by its owner.
    ///
    /// # Errors
    /// - [`RangeError::ZeroLength`] for an empty request.
    /// - [`RangeError::Overflow`] if the range wraps the domain.
    /// - [`RangeError::Taken`] if not entirely free and `force` is not set.
    pub fn allocate_specific(
        &mut self,
        base: u64,
        length: u64,
        force: bool,
    ) -> Result<(), RangeError> {
        if length == 0 {
            return Err(RangeError::ZeroLength);
        }
        let end = base.checked_add(length).ok_or(RangeError::Overflow(base))?;

        if !force {
            let containing = self
                .free
                .range(..=base)
                .next_back()
                .map(|(&b, &l)| (b, l))
                .filter(|&(b, l)| b + l >= end);
            let Some((b, l)) = containing else {
                return Err(RangeError::Taken(Range::new(base, length)));
            };
            self.carve(b, l, base, end);
            return Ok(());
        }

        let overlapping: Vec<(u64, u64)> = self
            .free
            .range(..end)
            .rev()
            .take_while(|&(&b, &l)| b + l > base)
            .map(|(&b, &l)| (b, l))
            .collect();

        if overlapping.is_empty() {
            log::debug!("forced reservation of {:?} overlaps no free range", Range::new(base, length));
        }
        for (b, l) in overlapping {
            self.carve(b, l, base.max(b), end.min(b + l));
        }
        Ok(())
    }

    /// Remove `[start, end)` from the free interval `[b, b + l)`, keeping any
    /// prefix and suffix.
    fn carve(&mut self, b: u64, l: u64, start: u64, end: u64) {
        debug_assert!(b <= start && end <= b + l);
        self.free.remove(&b);
        if start > b {
            self.free.insert(b, start - b);
        }
        if end < b + l {
            self.free.insert(end, b + l - end);
        }
    }

    /// Whether all of `[base, base + length)` is currently free.
    #[must_use]
    pub fn is_free(&self, base: u64, length: u64) -> bool {
        self.free
            .range(..=base)
            .next_back()
            .is_some_and(|(&b, &l)| b + l >= base.saturating_add(length))
    }

    /// Whether `addr` is currently free.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.is_free(addr, 1)
    }

    /// Free intervals in address order.
    pub fn ranges(&self) -> impl Iterator<Item = Range> + '_ {
        self.free.iter().map(|(&b, &l)| Range::new(b, l))
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Number of disjoint free intervals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl fmt::Debug for RangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ranges()).finish()
    }
}
