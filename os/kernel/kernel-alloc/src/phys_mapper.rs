//! # Physical Memory Access
//!
//! [`PhysMapper`] implementations for the two windows the kernel address
//! space provides: the low identity map (`va == pa`) and the high alias at
//! [`KERNEL_BASE`](kernel_info::memory::KERNEL_BASE)
//! (`va == KERNEL_BASE + pa`).
//!
//! The identity mapper is what the firmware hands over, so it is the one
//! used during bring-up. Once the kernel runs on its own tables only the
//! window sizes of the [`KernelLayout`] stay mapped, so each mapper reports
//! its window as [`PhysMapper::phys_limit`] and the frame allocator keeps
//! below it.

use kernel_info::memory::KernelLayout;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// `va == pa` for `pa` below `limit`.
#[derive(Debug, Copy, Clone)]
pub struct IdentityPhysMapper {
    limit: u64,
}

impl IdentityPhysMapper {
    #[must_use]
    pub const fn new(limit: u64) -> Self {
        Self { limit }
    }

    /// The low identity window of `layout`, i.e. what stays reachable after
    /// the kernel tables are loaded.
    #[must_use]
    pub const fn identity_window(layout: &KernelLayout) -> Self {
        Self::new(layout.identity_bytes)
    }
}

impl Default for IdentityPhysMapper {
    fn default() -> Self {
        Self::identity_window(&KernelLayout::DEFAULT)
    }
}

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = pa.as_u64() as *mut T;
        // SAFETY: the caller guarantees `pa` is identity mapped and unaliased.
        unsafe { &mut *va }
    }

    #[inline]
    fn phys_limit(&self) -> u64 {
        self.limit
    }
}

/// `va == offset + pa` for `pa` below `limit`.
#[derive(Debug, Copy, Clone)]
pub struct OffsetPhysMapper {
    offset: u64,
    limit: u64,
}

impl OffsetPhysMapper {
    #[must_use]
    pub const fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// The high kernel window of `layout`.
    #[must_use]
    pub const fn kernel_window(layout: &KernelLayout) -> Self {
        Self::new(layout.kernel_base.as_u64(), layout.kernel_window_bytes)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl Default for OffsetPhysMapper {
    fn default() -> Self {
        Self::kernel_window(&KernelLayout::DEFAULT)
    }
}

impl PhysMapper for OffsetPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.offset.wrapping_add(pa.as_u64()) as *mut T;
        // SAFETY: the caller guarantees `pa` lies inside the window and is
        // not otherwise borrowed.
        unsafe { &mut *va }
    }

    #[inline]
    fn phys_limit(&self) -> u64 {
        self.limit
    }
}
