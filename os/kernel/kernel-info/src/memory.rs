//! # Memory Layout

use kernel_memory_addresses::align::is_aligned;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};

/// Size of one physical frame and of one mapped page.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Where the kernel executes (VMA); the high alias of low physical memory
/// starts here.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Low physical memory mapped 1:1 so the paging switch and early pointers
/// remain valid.
pub const IDENTITY_LOW_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Physical memory aliased at [`KERNEL_BASE`] + `pa`.
pub const KERNEL_WINDOW_BYTES: u64 = 256 * 1024 * 1024; // 256 MiB

/// First virtual address of the kernel heap.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_ffff_9000_0000;

/// Size of the kernel heap arena.
pub const KERNEL_HEAP_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

const _: () = {
    assert!(is_aligned(KERNEL_BASE, PAGE_SIZE));
    assert!(is_aligned(KERNEL_HEAP_BASE, PAGE_SIZE));
    assert!(is_aligned(IDENTITY_LOW_BYTES, PAGE_SIZE));
    assert!(is_aligned(KERNEL_WINDOW_BYTES, PAGE_SIZE));
    assert!(KERNEL_BASE + KERNEL_WINDOW_BYTES <= KERNEL_HEAP_BASE);
    assert!(KERNEL_HEAP_BASE.checked_add(KERNEL_HEAP_SIZE).is_some());
};

/// Virtual layout the memory manager builds during bring-up.
///
/// [`KernelLayout::DEFAULT`] carries the constants above; hosted tests shrink
/// the windows so a few megabytes of simulated RAM suffice.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelLayout {
    /// Bytes of low physical memory mapped at `va == pa`.
    pub identity_bytes: u64,
    /// Start of the high alias window.
    pub kernel_base: VirtualAddress,
    /// Bytes of physical memory aliased at `kernel_base + pa`.
    pub kernel_window_bytes: u64,
    /// Start of the heap arena.
    pub heap_base: VirtualAddress,
    /// Heap arena size in bytes.
    pub heap_size: u64,
}

/// Reasons a [`KernelLayout`] is rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LayoutError {
    /// A base or size is not a multiple of [`PAGE_SIZE`].
    Unaligned,
    /// A window wraps around the top of the address space.
    Overflow,
    /// The kernel window and the heap overlap.
    Overlap,
}

impl KernelLayout {
    pub const DEFAULT: Self = Self {
        identity_bytes: IDENTITY_LOW_BYTES,
        kernel_base: VirtualAddress::new(KERNEL_BASE),
        kernel_window_bytes: KERNEL_WINDOW_BYTES,
        heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
        heap_size: KERNEL_HEAP_SIZE,
    };

    /// Checks page alignment and that the windows neither wrap nor overlap.
    ///
    /// # Errors
    /// See [`LayoutError`].
    pub const fn validate(&self) -> Result<(), LayoutError> {
        if !is_aligned(self.identity_bytes, PAGE_SIZE)
            || !self.kernel_base.is_aligned::<Size4K>()
            || !is_aligned(self.kernel_window_bytes, PAGE_SIZE)
            || !self.heap_base.is_aligned::<Size4K>()
            || !is_aligned(self.heap_size, PAGE_SIZE)
        {
            return Err(LayoutError::Unaligned);
        }

        let Some(window_end) = self.kernel_base.checked_add(self.kernel_window_bytes) else {
            return Err(LayoutError::Overflow);
        };
        let Some(heap_end) = self.heap_base.checked_add(self.heap_size) else {
            return Err(LayoutError::Overflow);
        };

        let disjoint = window_end.as_u64() <= self.heap_base.as_u64()
            || heap_end.as_u64() <= self.kernel_base.as_u64();
        if !disjoint && self.kernel_window_bytes != 0 && self.heap_size != 0 {
            return Err(LayoutError::Overlap);
        }

        Ok(())
    }
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
