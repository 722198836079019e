//! Simulated physical memory and TLB for host tests.

use core::cell::{Cell, RefCell};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{PhysMapper, TlbFlush};
use std::collections::HashMap;

#[repr(align(4096))]
struct Frame([u8; 4096]);

/// Any physical address is backed on first touch.
///
/// New frames are filled with `0x5A` so missing zeroing shows up.
#[derive(Default)]
pub struct SparsePhys {
    frames: RefCell<HashMap<u64, Box<Frame>>>,
    limit: Option<u64>,
}

impl SparsePhys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory that claims to reach only below `limit`.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Copy of the frame containing `pa`, if it was ever touched.
    pub fn frame_bytes(&self, pa: PhysicalAddress) -> Option<Vec<u8>> {
        let frames = self.frames.borrow();
        frames.get(&(pa.as_u64() >> 12)).map(|f| f.0.to_vec())
    }

    /// Number of frames materialized so far.
    pub fn touched(&self) -> usize {
        self.frames.borrow().len()
    }
}

impl PhysMapper for SparsePhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = usize::try_from(pa.as_u64() & 0xFFF).unwrap();
        assert!(off + size_of::<T>() <= 4096, "access crosses a frame");
        let base = {
            let mut frames = self.frames.borrow_mut();
            let frame = frames
                .entry(pa.as_u64() >> 12)
                .or_insert_with(|| Box::new(Frame([0x5A; 4096])));
            frame.0.as_mut_ptr()
        };
        // Boxed frames never move and live as long as `self`.
        unsafe { &mut *base.add(off).cast::<T>() }
    }

    fn phys_limit(&self) -> u64 {
        self.limit.unwrap_or(u64::MAX)
    }
}

/// Records every invalidation request.
#[derive(Default)]
pub struct RecordingTlb {
    pub pages: RefCell<Vec<u64>>,
    pub full: Cell<usize>,
}

impl TlbFlush for RecordingTlb {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.pages.borrow_mut().push(va.as_u64());
    }

    fn flush_all(&self) {
        self.full.set(self.full.get() + 1);
    }
}

/// Page-aligned host buffer standing in for a mapped heap arena.
pub struct Arena {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

impl Arena {
    pub fn new(size: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn base(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.ptr)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}
