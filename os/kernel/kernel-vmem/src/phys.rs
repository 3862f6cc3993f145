//! # Reaching physical memory from code
//!
//! Code can only dereference virtual addresses, yet page tables, the free
//! page stack and copy-on-write copies all need to touch frames by their
//! *physical* address. [`PhysMapper`] hides how that happens:
//!
//! - on hardware, a direct map or a temporary window in the kernel half;
//! - on a host, [`HostedRam`], a heap block standing in for RAM.
//!
//! Callers only ever deal in whole 4 KiB frames, so the trait hands out a
//! pointer to the frame and offers byte-level helpers on top.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K};

/// The physical address is not backed by memory this mapper can reach.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("physical address {0} is not backed by RAM")]
pub struct NotBacked(pub PhysicalAddress);

/// Access to physical frames from the current address space.
///
/// # Safety contract for implementors
/// A pointer returned by [`frame_ptr`](Self::frame_ptr) must be valid for
/// reads and writes of `PAGE_SIZE` bytes and stay valid for as long as the
/// mapper is alive.
pub trait PhysMapper: Send + Sync {
    /// Pointer to the first byte of the page-aligned frame `frame`.
    fn frame_ptr(&self, frame: PhysicalAddress) -> Option<NonNull<u8>>;

    /// Copy bytes starting at `pa` into `buf`. May span frames.
    ///
    /// # Errors
    /// [`NotBacked`] naming the first frame outside RAM; `buf` is untouched.
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) -> Result<(), NotBacked> {
        ensure_backed(self, pa, buf.len())?;
        for_each_frame_chunk(pa, buf.len(), |chunk_pa, start, len| {
            let src = self.frame_ptr(chunk_pa.align_down::<Size4K>()).ok_or(NotBacked(chunk_pa))?;
            let offset = usize_of(chunk_pa.page_offset::<Size4K>());
            // SAFETY: `src` is valid for a whole frame and `offset + len` stays inside it.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr().add(offset),
                    buf[start..start + len].as_mut_ptr(),
                    len,
                );
            }
            Ok(())
        })
    }

    /// Copy `data` into physical memory starting at `pa`. May span frames.
    ///
    /// # Errors
    /// [`NotBacked`] naming the first frame outside RAM. Nothing is written
    /// unless the whole range is backed.
    fn write(&self, pa: PhysicalAddress, data: &[u8]) -> Result<(), NotBacked> {
        ensure_backed(self, pa, data.len())?;
        for_each_frame_chunk(pa, data.len(), |chunk_pa, start, len| {
            let dst = self.frame_ptr(chunk_pa.align_down::<Size4K>()).ok_or(NotBacked(chunk_pa))?;
            let offset = usize_of(chunk_pa.page_offset::<Size4K>());
            // SAFETY: `dst` is valid for a whole frame and `offset + len` stays inside it.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[start..start + len].as_ptr(),
                    dst.as_ptr().add(offset),
                    len,
                );
            }
            Ok(())
        })
    }

    /// Fill a whole frame with zeroes.
    ///
    /// # Errors
    /// [`NotBacked`] if `frame` is outside RAM.
    fn zero_frame(&self, frame: PhysicalAddress) -> Result<(), NotBacked> {
        let dst = self.frame_ptr(frame).ok_or(NotBacked(frame))?;
        // SAFETY: `dst` is valid for a whole frame.
        unsafe { core::ptr::write_bytes(dst.as_ptr(), 0, FRAME_BYTES) };
        Ok(())
    }

    /// Copy the contents of frame `from` into frame `to`.
    ///
    /// # Errors
    /// [`NotBacked`] naming whichever frame is outside RAM.
    fn copy_frame(&self, from: PhysicalAddress, to: PhysicalAddress) -> Result<(), NotBacked> {
        let src = self.frame_ptr(from).ok_or(NotBacked(from))?;
        let dst = self.frame_ptr(to).ok_or(NotBacked(to))?;
        if from != to {
            // SAFETY: distinct frames never overlap and both are valid for a whole frame.
            unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), FRAME_BYTES) };
        }
        Ok(())
    }
}

/// View a physical frame as a `T`.
///
/// # Safety
/// - `T` must fit in a frame, be valid for any bit pattern and need at most
///   page alignment.
/// - The caller must guarantee exclusive access for `'a` (in practice: hold
///   the lock of the structure that owns the frame).
pub(crate) unsafe fn frame_as_mut<'a, T>(
    ram: &dyn PhysMapper,
    frame: PhysicalAddress,
) -> Option<&'a mut T> {
    debug_assert!(size_of::<T>() <= FRAME_BYTES);
    debug_assert!(frame.is_aligned::<Size4K>());
    let ptr = ram.frame_ptr(frame)?;
    // SAFETY: forwarded to the caller.
    Some(unsafe { &mut *ptr.as_ptr().cast::<T>() })
}

/// Fails with the first frame of `[pa, pa + len)` that `ram` cannot reach.
fn ensure_backed<M: PhysMapper + ?Sized>(
    ram: &M,
    pa: PhysicalAddress,
    len: usize,
) -> Result<(), NotBacked> {
    for_each_frame_chunk(pa, len, |chunk_pa, _, _| {
        ram.frame_ptr(chunk_pa.align_down::<Size4K>())
            .map(|_| ())
            .ok_or(NotBacked(chunk_pa))
    })
}

/// Split `[pa, pa + len)` at frame boundaries and hand each piece to `f` as
/// `(physical start, offset into the caller's buffer, length)`.
fn for_each_frame_chunk(
    pa: PhysicalAddress,
    len: usize,
    mut f: impl FnMut(PhysicalAddress, usize, usize) -> Result<(), NotBacked>,
) -> Result<(), NotBacked> {
    let mut done = 0;
    while done < len {
        let at = pa.checked_add(done as u64).ok_or(NotBacked(pa))?;
        let room = usize_of(PAGE_SIZE - at.page_offset::<Size4K>());
        let chunk = room.min(len - done);
        f(at, done, chunk)?;
        done += chunk;
    }
    Ok(())
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn usize_of(v: u64) -> usize {
    v as usize
}

const FRAME_BYTES: usize = usize_of(PAGE_SIZE);

#[repr(C, align(4096))]
struct Frame([u8; FRAME_BYTES]);

/// Heap memory posing as a contiguous block of physical RAM.
///
/// Lets the allocators and both address-space backends run unchanged in a
/// hosted process: "physical" address `base + n` is byte `n` of the block.
/// Every frame starts zeroed.
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::{HostedRam, PhysMapper};
/// let ram = HostedRam::new(PhysicalAddress::new(0x10_0000), 4);
/// ram.write(PhysicalAddress::new(0x10_0ffe), b"abcd").unwrap();
///
/// let mut buf = [0u8; 4];
/// ram.read(PhysicalAddress::new(0x10_0ffe), &mut buf).unwrap();
/// assert_eq!(&buf, b"abcd");
/// assert!(ram.read(PhysicalAddress::new(0x10_4000), &mut buf).is_err());
/// ```
pub struct HostedRam {
    base: PhysicalAddress,
    frames: Box<[UnsafeCell<Frame>]>,
}

// SAFETY: frames are only ever touched through raw pointers handed out by
// `frame_ptr`; synchronizing those accesses is the job of whoever owns the
// frame (an address-space lock, the page allocator lock).
unsafe impl Sync for HostedRam {}

impl HostedRam {
    /// Simulate `frames` frames of RAM starting at the page-aligned `base`.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        debug_assert!(base.is_aligned::<Size4K>());
        let frames = (0..frames)
            .map(|_| UnsafeCell::new(Frame([0; FRAME_BYTES])))
            .collect();
        Self { base, frames }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Exclusive end of the simulated RAM.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.base + self.size()
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.frames.len() as u64 * PAGE_SIZE
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.base && pa < self.end()
    }
}

impl PhysMapper for HostedRam {
    fn frame_ptr(&self, frame: PhysicalAddress) -> Option<NonNull<u8>> {
        if !self.contains(frame) {
            return None;
        }
        let index = usize_of(frame.offset_from(self.base) / PAGE_SIZE);
        NonNull::new(self.frames[index].get().cast::<u8>())
    }
}

impl core::fmt::Debug for HostedRam {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostedRam")
            .field("base", &self.base)
            .field("frames", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_start_zeroed_and_copy() {
        let ram = HostedRam::new(PhysicalAddress::new(0x2000), 2);
        let a = PhysicalAddress::new(0x2000);
        let b = PhysicalAddress::new(0x3000);

        let mut buf = [0xFFu8; 16];
        ram.read(b, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);

        ram.write(a + 8, b"frame a").unwrap();
        ram.copy_frame(a, b).unwrap();
        let mut copy = [0u8; 7];
        ram.read(b + 8, &mut copy).unwrap();
        assert_eq!(&copy, b"frame a");

        ram.zero_frame(a).unwrap();
        ram.read(a + 8, &mut copy).unwrap();
        assert_eq!(copy, [0; 7]);
    }

    #[test]
    fn addresses_outside_ram_are_rejected() {
        let ram = HostedRam::new(PhysicalAddress::new(0x2000), 1);
        assert_eq!(ram.end(), PhysicalAddress::new(0x3000));
        assert!(ram.frame_ptr(PhysicalAddress::new(0x1000)).is_none());
        assert_eq!(
            ram.zero_frame(PhysicalAddress::new(0x3000)),
            Err(NotBacked(PhysicalAddress::new(0x3000)))
        );
        // A write that starts inside RAM but runs past its end fails at the boundary.
        assert_eq!(
            ram.write(PhysicalAddress::new(0x2FFE), &[1, 2, 3, 4]),
            Err(NotBacked(PhysicalAddress::new(0x3000)))
        );
    }

    #[test]
    fn failed_accesses_leave_memory_and_buffers_alone() {
        let ram = HostedRam::new(PhysicalAddress::new(0x2000), 1);
        let tail = PhysicalAddress::new(0x2FFE);
        ram.write(tail, &[7, 7]).unwrap();

        assert!(ram.write(tail, &[1, 2, 3, 4]).is_err());
        let mut kept = [0u8; 2];
        ram.read(tail, &mut kept).unwrap();
        assert_eq!(kept, [7, 7]);

        let mut buf = [0xAAu8; 4];
        assert_eq!(
            ram.read(tail, &mut buf),
            Err(NotBacked(PhysicalAddress::new(0x3000)))
        );
        assert_eq!(buf, [0xAA; 4]);
    }
}
