//! Byte-range helpers shared by the allocators and their callers.

use core::cmp::Ordering;
use core::fmt;
use core::sync::atomic::{Ordering as AtomicOrdering, compiler_fence};
use log::info;

/// Copy `len` bytes from `src` to `dst`; the ranges may overlap.
///
/// # Safety
/// `src` must be readable and `dst` writable for `len` bytes.
#[inline]
pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) {
    unsafe { core::ptr::copy(src, dst, len) };
}

#[inline]
pub fn set(dst: &mut [u8], value: u8) {
    dst.fill(value);
}

/// `memcmp` over the common prefix: the difference of the first mismatching
/// bytes, or 0.
#[must_use]
pub fn compare(a: &[u8], b: &[u8]) -> i32 {
    a.iter()
        .zip(b)
        .find(|(x, y)| x != y)
        .map_or(0, |(&x, &y)| i32::from(x) - i32::from(y))
}

/// Lexicographic order including length.
#[must_use]
pub fn order(a: &[u8], b: &[u8]) -> Ordering {
    match compare(a, b) {
        0 => a.len().cmp(&b.len()),
        d => d.cmp(&0),
    }
}

/// Index of the first `byte` in `haystack`.
#[must_use]
pub fn find(haystack: &[u8], byte: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == byte)
}

#[must_use]
pub fn is_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

/// Zero `bytes` with volatile stores the optimizer cannot drop.
pub fn zero_secure(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        // SAFETY: `b` is a valid, exclusive byte reference.
        unsafe { core::ptr::write_volatile(b, 0) };
    }
    compiler_fence(AtomicOrdering::SeqCst);
}

/// Add each byte, then rotate left by one.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0_u32, |sum, &b| sum.wrapping_add(u32::from(b)).rotate_left(1))
}

/// One 16-byte row of a hex dump.
struct HexLine<'a> {
    addr: u64,
    bytes: &'a [u8],
}

impl fmt::Display for HexLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}: ", self.addr)?;
        for i in 0..16 {
            match self.bytes.get(i) {
                Some(b) => write!(f, "{b:02x} ")?,
                None => f.write_str("   ")?,
            }
            if i == 7 {
                f.write_str(" ")?;
            }
        }
        f.write_str(" |")?;
        for &b in self.bytes {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            write!(f, "{c}")?;
        }
        f.write_str("|")
    }
}

/// Log `bytes` as hex and ASCII, labelling rows from `base`.
pub fn hexdump(bytes: &[u8], base: u64) {
    info!("memory dump at 0x{base:x} ({} bytes):", bytes.len());
    for (row, chunk) in (0_u64..).zip(bytes.chunks(16)) {
        info!("{}", HexLine { addr: base + row * 16, bytes: chunk });
    }
}
