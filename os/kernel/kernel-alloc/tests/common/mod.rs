#![allow(dead_code)]

use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_info::memory::KernelLayout;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::sync::Mutex;

pub const MIB: u64 = 1024 * 1024;

#[repr(align(4096))]
struct Frame([u8; 4096]);

/// Thread-safe simulated RAM; frames appear on first touch.
#[derive(Default)]
pub struct SimPhys {
    frames: Mutex<HashMap<u64, Box<Frame>>>,
}

impl SimPhys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        *unsafe { self.phys_to_mut::<u64>(pa) }
    }
}

impl PhysMapper for SimPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = usize::try_from(pa.as_u64() & 0xFFF).unwrap();
        assert!(off + size_of::<T>() <= 4096);
        let base = {
            let mut frames = self.frames.lock().unwrap();
            let frame = frames
                .entry(pa.as_u64() >> 12)
                .or_insert_with(|| Box::new(Frame([0xA5; 4096])));
            frame.0.as_mut_ptr()
        };
        unsafe { &mut *base.add(off).cast::<T>() }
    }
}

/// Page-aligned host memory standing in for the heap window.
pub struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

impl Arena {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
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
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// 8 MiB of RAM above 1 MiB, with the first MiB reserved.
pub fn regions() -> Vec<MemoryRegion> {
    vec![
        MemoryRegion::new(0, MIB, MemoryRegionKind::Reserved),
        MemoryRegion::new(MIB, 8 * MIB, MemoryRegionKind::Available),
        MemoryRegion::new(9 * MIB, MIB, MemoryRegionKind::Kernel),
    ]
}

/// Small windows with the heap placed on `arena`.
pub fn layout_for(arena: &Arena) -> KernelLayout {
    KernelLayout {
        identity_bytes: 2 * MIB,
        kernel_base: VirtualAddress::new(0xffff_ffff_8000_0000),
        kernel_window_bytes: 4 * MIB,
        heap_base: arena.base(),
        heap_size: arena.len() as u64,
    }
}
