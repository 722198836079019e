//! Statically reserved storage for the frame bitmap.
//!
//! The bitmap is needed before any allocator exists, so its backing store
//! lives in `.bss`, sized for [`MAX_PHYS_BYTES`] of physical address span.

use crate::frame_alloc::words_for_frames;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::PAGE_SIZE;
use log::warn;

/// Largest span of available physical memory (lowest to highest usable
/// frame) the static bitmap can describe.
pub const MAX_PHYS_BYTES: u64 = 16 * 1024 * 1024 * 1024; // 16 GiB

#[allow(clippy::cast_possible_truncation)]
const MAX_FRAMES: usize = (MAX_PHYS_BYTES / PAGE_SIZE) as usize;

/// Words in the static buffer.
pub const WORDS: usize = words_for_frames(MAX_FRAMES);

struct BootBitmap(UnsafeCell<[u64; WORDS]>);

// Safety: the only `&mut` ever created is handed out once by `take`.
unsafe impl Sync for BootBitmap {}

#[cfg_attr(target_os = "none", unsafe(link_section = ".bss.frame_bitmap"))]
static STORAGE: BootBitmap = BootBitmap(UnsafeCell::new([0; WORDS]));

static TAKEN: AtomicBool = AtomicBool::new(false);

/// The static bitmap storage; `None` after the first call.
pub fn take() -> Option<&'static mut [u64]> {
    if TAKEN.swap(true, Ordering::AcqRel) {
        warn!("boot bitmap already handed out");
        return None;
    }
    // SAFETY: the flag above lets exactly one caller reach this point.
    Some(unsafe { &mut *STORAGE.0.get() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BitmapFrameAlloc;
    use crate::test_support::SparsePhys;
    use kernel_info::boot::{MemoryRegion, MemoryRegionKind};

    #[test]
    fn handed_out_once_and_fits_max_span() {
        let storage = take().unwrap();
        assert_eq!(storage.len(), WORDS);
        assert!(take().is_none());

        let top = MemoryRegion::new(0, MAX_PHYS_BYTES, MemoryRegionKind::Available);
        assert_eq!(BitmapFrameAlloc::<SparsePhys>::words_needed(&[top]), WORDS);

        let phys = SparsePhys::new();
        let regions = [MemoryRegion::new(0x10_0000, 0x40_0000, MemoryRegionKind::Available)];
        let frames = BitmapFrameAlloc::init(&phys, &regions, storage).unwrap();
        assert_eq!(frames.total_pages(), 1024);
    }
}
