//! # Memory Manager
//!
//! Brings the three allocators up bottom-up and keeps each behind its own
//! lock:
//!
//! 1. the frame bitmap from the boot memory map,
//! 2. the kernel address space (identity window, high window),
//! 3. the heap arena, backed by fresh frames at `layout.heap_base`.
//!
//! The heap itself is only initialized by [`MemoryManager::init_heap`],
//! since its arena is addressable only once the new address space is live.
//!
//! Lock order is `vmm` before `frames`. The heap lock is never held while
//! another one is taken.

use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError, FrameStats};
use crate::heap::{HeapError, HeapStats};
use crate::locked::LockedHeap;
use crate::vmm::{Vmm, VmmError};
use core::fmt;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::{KernelLayout, LayoutError};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::{PageEntryBits, PhysMapper, TlbFlush};
use log::{error, info};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryInitError {
    #[error("invalid kernel layout: {0:?}")]
    Layout(LayoutError),
    #[error("frame allocator: {0}")]
    Frames(#[from] FrameAllocError),
    #[error("address space: {0}")]
    Vmm(#[from] VmmError),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
}

impl From<LayoutError> for MemoryInitError {
    fn from(value: LayoutError) -> Self {
        Self::Layout(value)
    }
}

/// Point-in-time counters of both allocators.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStats {
    pub frames: FrameStats,
    pub heap: HeapStats,
}

pub struct MemoryManager<'m, M: PhysMapper, T: TlbFlush> {
    frames: SpinLock<BitmapFrameAlloc<'m, M>>,
    vmm: SpinLock<Vmm<'m, M, T>>,
    heap: &'m LockedHeap,
    layout: KernelLayout,
}

impl<'m, M: PhysMapper, T: TlbFlush> MemoryManager<'m, M, T> {
    /// Build the frame allocator and the kernel address space, and back the
    /// heap range with zeroed frames.
    ///
    /// `bitmap` must hold at least [`BitmapFrameAlloc::words_needed`] words;
    /// [`boot_bitmap::take`](crate::boot_bitmap::take) provides one.
    ///
    /// # Errors
    /// The first failing stage. Frames taken by earlier stages are returned.
    pub fn new(
        mapper: &'m M,
        tlb: T,
        regions: &[MemoryRegion],
        bitmap: &'m mut [u64],
        layout: KernelLayout,
        heap: &'m LockedHeap,
    ) -> Result<Self, MemoryInitError> {
        layout.validate().inspect_err(|e| {
            error!("memory: rejecting layout {layout:?}: {e:?}");
        })?;

        let mut frames = BitmapFrameAlloc::init(mapper, regions, bitmap)?;
        let mut vmm = Vmm::init(mapper, &mut frames, tlb, layout)?;

        if let Err(e) = vmm.map_anon(
            &mut frames,
            layout.heap_base,
            layout.heap_size,
            PageEntryBits::kernel_rw_nx(),
        ) {
            error!(
                "memory: cannot back heap {} +0x{:x}: {e}",
                layout.heap_base, layout.heap_size
            );
            vmm.teardown(&mut frames);
            return Err(e.into());
        }

        info!(
            "memory: heap {} +0x{:x} backed, {} of {} frames free",
            layout.heap_base,
            layout.heap_size,
            frames.free_pages(),
            frames.total_pages()
        );
        frames.log_layout();

        Ok(Self {
            frames: SpinLock::new(frames),
            vmm: SpinLock::new(vmm),
            heap,
            layout,
        })
    }

    /// Hand the heap range to the heap allocator.
    ///
    /// # Safety
    /// `layout.heap_base` must be addressable from the running code, i.e.
    /// this address space is active (or the range is otherwise mapped), and
    /// nothing else uses that memory.
    ///
    /// # Errors
    /// [`HeapError`] from [`Heap::init`](crate::heap::Heap::init).
    pub unsafe fn init_heap(&self) -> Result<(), HeapError> {
        #[allow(clippy::cast_possible_truncation)]
        let size = self.layout.heap_size as usize;
        unsafe { self.heap.init(self.layout.heap_base, size) }
    }

    /// Switch the CPU to the kernel address space.
    ///
    /// # Safety
    /// See [`Vmm::activate`].
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&self) {
        unsafe { self.vmm.lock().activate() }
    }

    #[must_use]
    pub fn alloc_frame(&self) -> Option<PhysicalPage<Size4K>> {
        self.frames.lock().alloc_one()
    }

    #[must_use]
    pub fn alloc_frames(&self, count: usize) -> Option<PhysicalPage<Size4K>> {
        self.frames.lock().alloc_contiguous(count)
    }

    pub fn free_frame(&self, pa: PhysicalAddress) {
        self.frames.lock().free_one(pa);
    }

    pub fn free_frames(&self, pa: PhysicalAddress, count: usize) {
        self.frames.lock().free_contiguous(pa, count);
    }

    /// # Errors
    /// See [`Vmm::map`].
    pub fn map(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let mut vmm = self.vmm.lock();
        let mut frames = self.frames.lock();
        vmm.map(&mut *frames, va, pa, flags)
    }

    pub fn unmap(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.lock().unmap(va)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.lock().translate(va)
    }

    /// # Errors
    /// See [`Vmm::protect`].
    pub fn protect(
        &self,
        start: VirtualAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<usize, VmmError> {
        let mut vmm = self.vmm.lock();
        let mut frames = self.frames.lock();
        vmm.protect(&mut *frames, start, len, flags)
    }

    /// # Errors
    /// See [`Vmm::map_anon`].
    pub fn map_anon(
        &self,
        va: VirtualAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let mut vmm = self.vmm.lock();
        let mut frames = self.frames.lock();
        vmm.map_anon(&mut *frames, va, len, flags)
    }

    pub fn unmap_anon(&self, va: VirtualAddress, len: u64) -> usize {
        let mut vmm = self.vmm.lock();
        let mut frames = self.frames.lock();
        vmm.unmap_anon(&mut *frames, va, len)
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &SpinLock<BitmapFrameAlloc<'m, M>> {
        &self.frames
    }

    #[inline]
    #[must_use]
    pub const fn vmm(&self) -> &SpinLock<Vmm<'m, M, T>> {
        &self.vmm
    }

    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &'m LockedHeap {
        self.heap
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let frames = self.frames.lock().stats();
        let heap = self.heap.stats();
        MemoryStats { frames, heap }
    }

    pub fn log_stats(&self) {
        let frames = self.frames.lock().stats();
        info!("memory: frames {frames}");
        self.heap.lock().log_stats();
    }

    /// Release the heap range and the page tables, returning the frame
    /// allocator.
    ///
    /// # Safety
    /// The address space must not be active and no heap allocation may be
    /// used afterwards.
    pub unsafe fn teardown(self) -> BitmapFrameAlloc<'m, M> {
        let mut frames = self.frames.into_inner();
        let mut vmm = self.vmm.into_inner();
        let heap_pages = vmm.unmap_anon(&mut frames, self.layout.heap_base, self.layout.heap_size);
        let tables = vmm.teardown(&mut frames);
        info!("memory: torn down, {heap_pages} heap frames and {tables} table frames freed");
        frames
    }
}

impl<M: PhysMapper, T: TlbFlush> fmt::Debug for MemoryManager<'_, M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("layout", &self.layout)
            .field("frames_locked", &self.frames.is_locked())
            .field("vmm_locked", &self.vmm.is_locked())
            .finish_non_exhaustive()
    }
}
