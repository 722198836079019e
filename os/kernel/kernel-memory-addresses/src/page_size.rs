use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Page granularity marker. Only [`Size4K`] exists; the mapper never
/// installs larger leaves.
pub trait PageSize:
    sealed::Sealed + Copy + Ord + Hash + fmt::Debug + Send + Sync + 'static
{
    /// Bytes per page, a power of two.
    const SIZE: u64;
    /// `log2(SIZE)`.
    const SHIFT: u32;
    /// Short label used in `Display` output.
    const LABEL: &'static str;

    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;

impl sealed::Sealed for Size4K {}

impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
    const LABEL: &'static str = "4K";
}

const _: () = assert!(1 << Size4K::SHIFT == Size4K::SIZE);
