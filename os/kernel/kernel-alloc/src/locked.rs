//! [`Heap`] behind a [`SpinLock`], usable as `#[global_allocator]`.
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::empty();
//! ```
//!
//! Layouts aligned up to [`Heap::ALIGN`] go straight to the heap. Larger
//! alignments take a block `align` bytes bigger than requested and hand out
//! an aligned address inside it; the block's own pointer is kept in the word
//! just below the one handed out.
//!
//! ```text
//!  block payload
//!  ├── ≥ ALIGN ──┬───────────────── size ───────────────┐
//!  │       [raw] │ aligned ...                          │
//!  └─────────────┴──────────────────────────────────────┘
//! ```

use crate::heap::{Heap, HeapError, HeapStats};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{SpinLock, SpinLockGuard};
use log::trace;

pub struct LockedHeap(SpinLock<Heap>);

impl LockedHeap {
    #[must_use]
    pub const fn empty() -> Self {
        Self(SpinLock::new(Heap::empty()))
    }

    /// See [`Heap::init`].
    ///
    /// # Safety
    /// As [`Heap::init`].
    ///
    /// # Errors
    /// As [`Heap::init`].
    pub unsafe fn init(&self, base: VirtualAddress, size: usize) -> Result<(), HeapError> {
        unsafe { self.0.lock().init(base, size) }
    }

    /// Direct access to the heap for the duration of the guard.
    pub fn lock(&self) -> SpinLockGuard<'_, Heap> {
        self.0.lock()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.0.lock().stats()
    }

    const fn over_aligned(layout: Layout) -> bool {
        layout.align() > Heap::ALIGN
    }

    /// An address aligned to `layout.align() > Heap::ALIGN` inside a larger
    /// block.
    fn alloc_over_aligned(&self, layout: Layout) -> *mut u8 {
        let align = layout.align();
        let Some(size) = layout.size().max(1).checked_add(align) else {
            return ptr::null_mut();
        };
        let Ok(raw) = self.0.lock().alloc(size) else {
            return ptr::null_mut();
        };

        // `raw` is ALIGN-aligned and `align` a larger power of two, so the
        // offset is a multiple of ALIGN in `[ALIGN, align]`.
        let offset = align - (raw.addr().get() & (align - 1));
        trace!("heap: {align}-aligned {} bytes at {raw:p}+{offset}", layout.size());
        // SAFETY: `offset + layout.size() <= size`, and the stash word lies
        // in the `offset` bytes below the aligned address.
        unsafe {
            let aligned = raw.as_ptr().add(offset);
            aligned.cast::<*mut u8>().sub(1).write(raw.as_ptr());
            aligned
        }
    }

    /// The heap pointer behind an address from
    /// [`alloc_over_aligned`](Self::alloc_over_aligned).
    ///
    /// # Safety
    /// `ptr` must come from `alloc_over_aligned` and still be live.
    unsafe fn block_start(ptr: *mut u8) -> *mut u8 {
        unsafe { ptr.cast::<*mut u8>().sub(1).read() }
    }
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

// Zero-sized layouts are served as one byte so every pointer is unique.
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if Self::over_aligned(layout) {
            return self.alloc_over_aligned(layout);
        }
        self.0
            .lock()
            .alloc(layout.size().max(1))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let ptr = if Self::over_aligned(layout) && !ptr.is_null() {
            unsafe { Self::block_start(ptr) }
        } else {
            ptr
        };
        if let Some(ptr) = NonNull::new(ptr) {
            // Failures are already logged by the heap.
            let _ = unsafe { self.0.lock().free(ptr) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if Self::over_aligned(layout) {
            let p = self.alloc_over_aligned(layout);
            if !p.is_null() {
                unsafe { p.write_bytes(0, layout.size()) };
            }
            return p;
        }
        self.0
            .lock()
            .calloc(1, layout.size().max(1))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if Self::over_aligned(layout) {
            let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
                return ptr::null_mut();
            };
            let new = self.alloc_over_aligned(new_layout);
            if !new.is_null() {
                unsafe {
                    ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
            }
            return new;
        }
        match unsafe { self.0.lock().realloc(NonNull::new(ptr), new_size.max(1)) } {
            Ok(Some(p)) => p.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Arena;

    #[test]
    fn global_alloc_round_trip() {
        let arena = Arena::new(64 * 1024);
        let heap = LockedHeap::empty();
        unsafe { heap.init(arena.base(), arena.len()) }.unwrap();

        let layout = Layout::from_size_align(24, 8).unwrap();
        unsafe {
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);

            let z = heap.alloc_zeroed(Layout::from_size_align(128, 16).unwrap());
            assert!(core::slice::from_raw_parts(z, 128).iter().all(|&b| b == 0));

            p.write_bytes(0x11, 24);
            let q = heap.realloc(p, layout, 512);
            assert!(!q.is_null());
            assert!(core::slice::from_raw_parts(q, 24).iter().all(|&b| b == 0x11));

            heap.dealloc(q, Layout::from_size_align(512, 8).unwrap());
            heap.dealloc(z, Layout::from_size_align(128, 16).unwrap());
        }
        let stats = heap.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.blocks, 1);
        heap.lock().check().unwrap();
    }

    #[test]
    fn uninitialized_heap_returns_null() {
        let heap = LockedHeap::empty();
        let small = Layout::from_size_align(8, 8).unwrap();
        assert!(unsafe { heap.alloc(small) }.is_null());
        let page_aligned = Layout::from_size_align(64, 4096).unwrap();
        assert!(unsafe { heap.alloc(page_aligned) }.is_null());
    }

    #[test]
    fn zero_sized_layouts_get_unique_pointers() {
        let arena = Arena::new(4096);
        let heap = LockedHeap::empty();
        unsafe { heap.init(arena.base(), arena.len()) }.unwrap();

        let zst = Layout::from_size_align(0, 1).unwrap();
        let a = unsafe { heap.alloc(zst) };
        let b = unsafe { heap.alloc(zst) };
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
    }

    #[test]
    fn over_aligned_layouts_are_carved_from_larger_blocks() {
        let arena = Arena::new(64 * 1024);
        let heap = LockedHeap::empty();
        unsafe { heap.init(arena.base(), arena.len()) }.unwrap();

        let page_aligned = Layout::from_size_align(64, 4096).unwrap();
        let line_aligned = Layout::from_size_align(100, 64).unwrap();
        unsafe {
            let p = heap.alloc(page_aligned);
            assert!(!p.is_null());
            assert_eq!(p as usize % 4096, 0);
            p.write_bytes(0x22, 64);

            let z = heap.alloc_zeroed(line_aligned);
            assert_eq!(z as usize % 64, 0);
            assert!(core::slice::from_raw_parts(z, 100).iter().all(|&b| b == 0));

            let q = heap.realloc(p, page_aligned, 8192);
            assert_eq!(q as usize % 4096, 0);
            assert!(core::slice::from_raw_parts(q, 64).iter().all(|&b| b == 0x22));

            heap.dealloc(q, Layout::from_size_align(8192, 4096).unwrap());
            heap.dealloc(z, line_aligned);
        }
        let stats = heap.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.blocks, 1);
        heap.lock().check().unwrap();
    }
}
