//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel: the hardware entry format, the
//! table type, and an [`AddressSpace`] that walks, maps, unmaps and tears
//! down one PML4-rooted tree.
//!
//! ## What you get
//! - [`PageEntryBits`]: bit-exact page-table entry (also used as mapping flags).
//! - [`PageTable`], [`TableLevel`], [`TableIndex`]: 4 KiB tables and VA index helpers.
//! - [`FrameAlloc`] / [`PhysMapper`]: the seams through which table frames are
//!   obtained and touched.
//! - [`TlbFlush`]: the translation-cache invalidation primitives.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   maps one 4 KiB page
//!   │        │        └────────────► PDE   points to a PT
//!   │        └─────────────────────► PDPTE points to a PD
//!   └──────────────────────────────► PML4E points to a PDPT
//! ```
//!
//! Only 4 KiB leaves are installed. Intermediate tables are created on demand
//! from a [`FrameAlloc`], zeroed before they are linked, and are present and
//! writable so the leaf alone decides access rights.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod page_entry_bits;
pub mod page_table;
pub mod tlb;

#[cfg(test)]
mod test_support;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, TableIndex, TableLevel};
#[cfg(target_arch = "x86_64")]
pub use crate::tlb::Invlpg;
pub use crate::tlb::{NoFlush, TlbFlush};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of **physical** 4 KiB frames for page tables.
///
/// Returned frames must be 4 KiB aligned. Their contents are unspecified; the
/// address space zeroes table frames itself before linking them.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously handed out by [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        (**self).free_4k(frame);
    }
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (identity map, HHDM, or a test arena).
///
/// Implementations must cover every frame below
/// [`phys_limit`](Self::phys_limit) with a writable mapping.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable through this mapper for `'a`.
    /// - `T` must match the bytes at `pa` and no other live reference may
    ///   alias them.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Exclusive upper bound of the physical addresses this mapper reaches.
    /// Frame allocators never hand out frames at or above it.
    #[inline]
    fn phys_limit(&self) -> u64 {
        u64::MAX
    }

    /// Borrow the page table stored in `frame`.
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut); `frame` must hold a table.
    #[inline]
    unsafe fn table_mut<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Fill `frame` with zeros.
    ///
    /// # Safety
    /// `frame` must be owned by the caller and mapped through this mapper.
    #[inline]
    unsafe fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        let bytes = unsafe { self.phys_to_mut::<[u64; 512]>(frame.base()) };
        bytes.fill(0);
    }
}
