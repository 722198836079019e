//! Power-of-two alignment helpers over plain integers.
//!
//! The typed wrappers use these internally; the heap and frame allocator use
//! them directly on byte counts. All `align` arguments must be non-zero powers
//! of two (checked in debug builds).

/// Rounds `value` up to the next multiple of `align`.
///
/// Returns `None` if the result does not fit in a `u64`.
///
/// ```rust
/// # use kernel_memory_addresses::align::align_up;
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 16), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Rounds `value` down to the previous multiple of `align`.
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Returns `true` if `value` is a multiple of `align`.
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    value & (align - 1) == 0
}

/// [`align_up`] for `usize` byte counts.
#[inline]
#[must_use]
pub const fn align_up_usize(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// [`align_down`] for `usize` byte counts.
#[inline]
#[must_use]
pub const fn align_down_usize(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}
