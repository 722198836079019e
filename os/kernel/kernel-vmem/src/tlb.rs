//! # Translation Cache Maintenance
//!
//! The mapper calls into a [`TlbFlush`] after every leaf change. Which
//! implementation is right depends on whether the address space being edited
//! is the one loaded in CR3.

use kernel_memory_addresses::VirtualAddress;

/// Invalidation primitives supplied by the architecture layer.
pub trait TlbFlush {
    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop all non-global cached translations.
    fn flush_all(&self);
}

/// For address spaces that are not active on any CPU.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoFlush;

impl TlbFlush for NoFlush {
    #[inline]
    fn invalidate_page(&self, _va: VirtualAddress) {}

    #[inline]
    fn flush_all(&self) {}
}

/// `invlpg` per page, CR3 reload for a full flush (CPL0 only).
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct Invlpg;

#[cfg(target_arch = "x86_64")]
impl TlbFlush for Invlpg {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn flush_all(&self) {
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags)
            );
        }
    }
}

impl<T: TlbFlush + ?Sized> TlbFlush for &T {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }

    #[inline]
    fn flush_all(&self) {
        (**self).flush_all();
    }
}
