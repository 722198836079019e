//! Simulated physical memory for host tests.

use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Hands out the next 4 KiB frame; frees are only counted.
pub struct BumpAlloc {
    next: u64,
    end: u64,
    pub allocated: usize,
    pub freed: Vec<PhysicalPage<Size4K>>,
}

impl BumpAlloc {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            next: start,
            end,
            allocated: 0,
            freed: Vec::new(),
        }
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next + 4096 > self.end {
            return None;
        }
        let p = self.next;
        self.next += 4096;
        self.allocated += 1;
        Some(PhysicalPage::containing_address(PhysicalAddress::new(p)))
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.freed.push(frame);
    }
}

#[repr(align(4096))]
struct Aligned4K([u8; 4096]);

/// Physical addresses `0..n*4096` backed by a vector of frames.
///
/// Frames start out filled with `0xAA` so missing zeroing shows up.
pub struct TestPhys {
    frames: Vec<Aligned4K>,
}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(Aligned4K([0xAA; 4096]));
        }
        Self { frames }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
        let off = usize::try_from(pa.as_u64() & 0xFFF).unwrap();
        let base = self.frames[idx].0.as_ptr().cast_mut();
        unsafe { &mut *base.add(off).cast::<T>() }
    }
}
