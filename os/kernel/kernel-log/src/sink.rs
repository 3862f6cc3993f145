use kernel_sync::SpinLock;

/// Byte-oriented log destination.
pub trait LogSink: Send + Sync {
    fn write_str(&self, s: &str);

    fn flush(&self) {}
}

/// QEMU `-debugcon` output on I/O port `0x402`.
#[cfg(all(feature = "qemu", any(target_arch = "x86", target_arch = "x86_64")))]
pub struct DebugPortSink;

#[cfg(all(feature = "qemu", any(target_arch = "x86", target_arch = "x86_64")))]
impl DebugPortSink {
    const PORT: u16 = 0x402;

    #[inline(always)]
    #[allow(clippy::inline_always)]
    fn putc(c: u8) {
        // SAFETY: the debug port has no side effects beyond emitting the byte.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") Self::PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

#[cfg(all(feature = "qemu", any(target_arch = "x86", target_arch = "x86_64")))]
impl LogSink for DebugPortSink {
    fn write_str(&self, s: &str) {
        s.bytes().for_each(Self::putc);
    }
}

struct Ring<const N: usize> {
    buf: [u8; N],
    /// Index of the oldest byte.
    head: usize,
    len: usize,
}

impl<const N: usize> Ring<N> {
    fn push(&mut self, b: u8) {
        let tail = (self.head + self.len) % N;
        self.buf[tail] = b;
        if self.len == N {
            self.head = (self.head + 1) % N;
        } else {
            self.len += 1;
        }
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.len).map(move |i| self.buf[(self.head + i) % N])
    }
}

/// Keeps the last `N` bytes of log output; older output is overwritten.
pub struct RingSink<const N: usize> {
    ring: SpinLock<Ring<N>>,
}

impl<const N: usize> RingSink<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: SpinLock::new(Ring {
                buf: [0; N],
                head: 0,
                len: 0,
            }),
        }
    }

    /// Copy the buffered output, oldest first, into `out`. Returns the number
    /// of bytes written.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let ring = self.ring.lock();
        out.iter_mut()
            .zip(ring.bytes())
            .map(|(dst, src)| *dst = src)
            .count()
    }

    /// Whether `needle` occurs in the buffered output.
    pub fn contains(&self, needle: &str) -> bool {
        let needle = needle.as_bytes();
        if needle.is_empty() {
            return true;
        }

        let ring = self.ring.lock();
        (0..ring.len)
            .filter(|start| ring.len - start >= needle.len())
            .any(|start| {
                needle
                    .iter()
                    .enumerate()
                    .all(|(i, b)| ring.buf[(ring.head + start + i) % N] == *b)
            })
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.ring.with_lock(|r| {
            r.head = 0;
            r.len = 0;
        });
    }
}

impl<const N: usize> Default for RingSink<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LogSink for RingSink<N> {
    fn write_str(&self, s: &str) {
        self.ring.with_lock(|r| s.bytes().for_each(|b| r.push(b)));
    }
}
