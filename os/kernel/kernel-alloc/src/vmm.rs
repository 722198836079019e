//! Kernel virtual memory manager.
//!
//! Wraps one [`AddressSpace`] together with the [`TlbFlush`] used for it and
//! the [`KernelLayout`] it was built from. Every leaf change is followed by a
//! translation-cache invalidation.
//!
//! # Example
//! ```ignore
//! let mut frames = BitmapFrameAlloc::init(&mapper, regions, storage)?;
//! let mut vmm = Vmm::init(&mapper, &mut frames, Invlpg, KernelLayout::DEFAULT)?;
//! vmm.map(&mut frames, va, pa, PageEntryBits::kernel_rw_nx())?;
//! ```

use core::fmt;
use kernel_info::memory::{KernelLayout, PAGE_SIZE};
use kernel_memory_addresses::align::{align_down, align_up};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, PageEntryBits, PhysMapper, TlbFlush};
use log::{debug, error, info, trace, warn};

/// Above this many pages a range operation reloads CR3 once instead of
/// invalidating page by page.
pub const FLUSH_ALL_THRESHOLD: u64 = 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("address 0x{0:x} is not page aligned")]
    Unaligned(u64),
    #[error("invalid range")]
    InvalidRange,
    #[error("{0} is covered by a large page")]
    LargePage(VirtualAddress),
}

impl From<MapError> for VmmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfFrames(_) => Self::OutOfMemory,
            MapError::LargePage(va) => Self::LargePage(va),
        }
    }
}

/// First page and page count of `[start, start + len)` widened to page
/// boundaries.
fn page_span(start: VirtualAddress, len: u64) -> Option<(VirtualPage<Size4K>, u64)> {
    let end = start.checked_add(len)?;
    let first = align_down(start.as_u64(), PAGE_SIZE);
    let last = align_up(end.as_u64(), PAGE_SIZE)?;
    let page = VirtualPage::containing_address(VirtualAddress::new(first));
    Some((page, (last - first) / PAGE_SIZE))
}

pub struct Vmm<'m, M: PhysMapper, T: TlbFlush> {
    aspace: AddressSpace<'m, M>,
    mapper: &'m M,
    tlb: T,
    layout: KernelLayout,
}

impl<'m, M: PhysMapper, T: TlbFlush> Vmm<'m, M, T> {
    /// An address space with an empty root table and no mappings.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the root frame cannot be allocated.
    pub fn new<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        frames: &mut A,
        tlb: T,
        layout: KernelLayout,
    ) -> Result<Self, VmmError> {
        let aspace = AddressSpace::new(mapper, frames)?;
        Ok(Self {
            aspace,
            mapper,
            tlb,
            layout,
        })
    }

    /// The kernel address space: low memory identity mapped and aliased at
    /// `layout.kernel_base`.
    ///
    /// On failure every table allocated so far is returned to `frames`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if a table frame cannot be allocated, or
    /// [`VmmError::Unaligned`] for a layout that is not page aligned.
    pub fn init<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        frames: &mut A,
        tlb: T,
        layout: KernelLayout,
    ) -> Result<Self, VmmError> {
        let mut vmm = Self::new(mapper, frames, tlb, layout)?;
        let flags = PageEntryBits::kernel_rw();

        let standing = vmm
            .map_range(
                frames,
                VirtualAddress::new(0),
                PhysicalAddress::new(0),
                layout.identity_bytes,
                flags,
            )
            .and_then(|()| {
                vmm.map_range(
                    frames,
                    layout.kernel_base,
                    PhysicalAddress::new(0),
                    layout.kernel_window_bytes,
                    flags,
                )
            });

        if let Err(e) = standing {
            error!("vmm: kernel address space setup failed: {e}");
            vmm.teardown(frames);
            return Err(e);
        }

        info!(
            "vmm: root {}, identity 0x0-0x{:x}, kernel window {} (+0x{:x})",
            vmm.root_page(),
            layout.identity_bytes,
            layout.kernel_base,
            layout.kernel_window_bytes
        );
        Ok(vmm)
    }

    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.aspace.root_page()
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    /// CPL0 only; the currently executing code, stack and data must be
    /// mapped in this address space.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&self) {
        unsafe { self.aspace.activate() }
    }

    /// Map the page containing `va` to the frame containing `pa`.
    ///
    /// An existing mapping is replaced.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if an intermediate table cannot be allocated.
    pub fn map<A: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        self.map_page(frames, va.page(), pa.page(), flags)?;
        self.tlb.invalidate_page(va.page::<Size4K>().base());
        Ok(())
    }

    fn map_page<A: FrameAlloc + ?Sized>(
        &self,
        frames: &mut A,
        page: VirtualPage<Size4K>,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        match self.aspace.map_one(frames, page, frame, flags) {
            Ok(Some(previous)) if previous != frame => {
                trace!("vmm: remap {page}: {previous} -> {frame}");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("vmm: map {page} -> {frame} failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Remove the mapping of the page containing `va`.
    ///
    /// Returns the frame base it pointed to; unmapped pages are a no-op.
    pub fn unmap(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let page = va.page::<Size4K>();
        let frame = self.aspace.unmap_one(page)?;
        self.tlb.invalidate_page(page.base());
        Some(frame.base())
    }

    /// Physical address for `va`, keeping the in-page offset.
    #[inline]
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.aspace.query(va)
    }

    /// Flags of the 4 KiB leaf mapping `va`, without the address.
    #[must_use]
    pub fn leaf_flags(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.aspace.leaf_entry(va.page()).map(PageEntryBits::flags_only)
    }

    /// Re-map every mapped page touching `[start, start + len)` with `flags`,
    /// keeping its frame. Unmapped pages are skipped.
    ///
    /// Returns the number of pages changed.
    ///
    /// # Errors
    /// [`VmmError::InvalidRange`] if the range wraps.
    pub fn protect<A: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut A,
        start: VirtualAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<usize, VmmError> {
        let Some((first, pages)) = page_span(start, len) else {
            warn!("vmm: protect {start} +0x{len:x} wraps");
            return Err(VmmError::InvalidRange);
        };

        let mut changed = 0;
        for page in (0..pages).filter_map(|i| first.checked_add(i)) {
            let Some(frame) = self.aspace.leaf_entry(page).and_then(|e| e.frame()) else {
                continue;
            };
            self.unmap(page.base());
            self.map(frames, page.base(), frame.base(), flags)?;
            changed += 1;
        }

        debug!("vmm: protect {start} +0x{len:x}: {changed} pages");
        Ok(changed)
    }

    /// Map `[va, va + len)` onto `[pa, pa + len)`, `len` rounded up to pages.
    ///
    /// # Errors
    /// - [`VmmError::Unaligned`] if `va` or `pa` is not page aligned.
    /// - [`VmmError::InvalidRange`] if either range wraps.
    /// - [`VmmError::OutOfMemory`] if a table cannot be allocated; pages
    ///   mapped before the failure stay mapped.
    pub fn map_range<A: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        if !va.is_aligned::<Size4K>() {
            warn!("vmm: map_range at unaligned {va}");
            return Err(VmmError::Unaligned(va.as_u64()));
        }
        if !pa.is_aligned::<Size4K>() {
            warn!("vmm: map_range to unaligned {pa}");
            return Err(VmmError::Unaligned(pa.as_u64()));
        }

        let pages = len.div_ceil(PAGE_SIZE);
        let wraps = pages.checked_mul(PAGE_SIZE).is_none_or(|span| {
            va.checked_add(span).is_none() || pa.checked_add(span).is_none()
        });
        if wraps {
            warn!("vmm: map_range {va} -> {pa} +0x{len:x} wraps");
            return Err(VmmError::InvalidRange);
        }

        let first_page = va.page::<Size4K>();
        let first_frame = pa.page::<Size4K>();
        let per_page = pages <= FLUSH_ALL_THRESHOLD;
        for i in 0..pages {
            let (Some(page), Some(frame)) = (first_page.checked_add(i), first_frame.checked_add(i))
            else {
                return Err(VmmError::InvalidRange);
            };
            self.map_page(frames, page, frame, flags)?;
            if per_page {
                self.tlb.invalidate_page(page.base());
            }
        }
        if !per_page {
            self.tlb.flush_all();
        }

        debug!("vmm: mapped {va} -> {pa} ({pages} pages)");
        Ok(())
    }

    /// Back `[va, va + len)` with freshly allocated, zeroed frames.
    ///
    /// On failure the pages mapped so far are unmapped and their frames
    /// returned to `frames`.
    ///
    /// # Errors
    /// [`VmmError::Unaligned`], [`VmmError::InvalidRange`] or
    /// [`VmmError::OutOfMemory`].
    pub fn map_anon<A: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut A,
        va: VirtualAddress,
        len: u64,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        if !va.is_aligned::<Size4K>() {
            warn!("vmm: map_anon at unaligned {va}");
            return Err(VmmError::Unaligned(va.as_u64()));
        }
        let Some((first, pages)) = page_span(va, len) else {
            warn!("vmm: map_anon {va} +0x{len:x} wraps");
            return Err(VmmError::InvalidRange);
        };

        for i in 0..pages {
            let Some(page) = first.checked_add(i) else {
                return Err(VmmError::InvalidRange);
            };
            let result = match frames.alloc_4k() {
                Some(frame) => {
                    // SAFETY: the frame was just allocated and is not mapped
                    // anywhere else yet.
                    unsafe { self.mapper.zero_frame(frame) };
                    self.map(frames, page.base(), frame.base(), flags)
                        .inspect_err(|_| frames.free_4k(frame))
                }
                None => Err(VmmError::OutOfMemory),
            };

            if let Err(e) = result {
                error!("vmm: map_anon {va} failed after {i} of {pages} pages: {e}");
                self.unmap_anon(frames, va, i * PAGE_SIZE);
                return Err(e);
            }
        }

        debug!("vmm: anonymous {va} ({pages} pages)");
        Ok(())
    }

    /// Unmap every page touching `[va, va + len)`. Returns the number of
    /// pages that were mapped.
    pub fn unmap_range(&mut self, va: VirtualAddress, len: u64) -> usize {
        self.unmap_pages(va, len, |_| {})
    }

    /// Unmap a range created by [`map_anon`](Self::map_anon) and free the
    /// frames behind it.
    pub fn unmap_anon<A: FrameAlloc + ?Sized>(
        &mut self,
        frames: &mut A,
        va: VirtualAddress,
        len: u64,
    ) -> usize {
        self.unmap_pages(va, len, |frame| frames.free_4k(frame))
    }

    fn unmap_pages(
        &mut self,
        va: VirtualAddress,
        len: u64,
        mut on_frame: impl FnMut(PhysicalPage<Size4K>),
    ) -> usize {
        let Some((first, pages)) = page_span(va, len) else {
            warn!("vmm: unmap {va} +0x{len:x} wraps");
            return 0;
        };

        let per_page = pages <= FLUSH_ALL_THRESHOLD;
        let mut unmapped = 0;
        for page in (0..pages).filter_map(|i| first.checked_add(i)) {
            let Some(frame) = self.aspace.unmap_one(page) else {
                continue;
            };
            if per_page {
                self.tlb.invalidate_page(page.base());
            }
            on_frame(frame);
            unmapped += 1;
        }
        if !per_page && unmapped > 0 {
            self.tlb.flush_all();
        }
        unmapped
    }

    /// Return the root and all intermediate tables to `frames`.
    ///
    /// Leaf frames are not owned by the address space; release anonymous
    /// ranges with [`unmap_anon`](Self::unmap_anon) first.
    pub fn teardown<A: FrameAlloc + ?Sized>(self, frames: &mut A) -> usize {
        let root = self.root_page();
        let freed = self.aspace.destroy(frames);
        info!("vmm: address space {root} torn down, {freed} table frames freed");
        freed
    }
}

impl<M: PhysMapper, T: TlbFlush> fmt::Debug for Vmm<'_, M, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vmm")
            .field("root", &self.root_page())
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BitmapFrameAlloc;
    use crate::test_support::{RecordingTlb, SparsePhys};
    use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
    use kernel_info::memory::{KERNEL_BASE, KERNEL_HEAP_BASE};
    use kernel_vmem::NoFlush;

    const MIB: u64 = 1024 * 1024;

    fn small_layout() -> KernelLayout {
        KernelLayout {
            identity_bytes: 2 * MIB,
            kernel_base: VirtualAddress::new(KERNEL_BASE),
            kernel_window_bytes: MIB,
            heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
            heap_size: 64 * 1024,
        }
    }

    fn regions(frames: u64) -> [MemoryRegion; 1] {
        [MemoryRegion::new(8 * MIB, frames * PAGE_SIZE, MemoryRegionKind::Available)]
    }

    #[test]
    fn init_installs_identity_and_high_alias() {
        let phys = SparsePhys::new();
        let regions = regions(256);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();
        let tlb = RecordingTlb::default();

        let vmm = Vmm::init(&phys, &mut frames, &tlb, small_layout()).unwrap();
        // root + (PDPT, PD, PT) for each of the two windows
        assert_eq!(frames.free_pages(), 256 - 7);

        assert_eq!(
            vmm.translate(VirtualAddress::new(0x1_2345)),
            Some(PhysicalAddress::new(0x1_2345))
        );
        assert_eq!(
            vmm.translate(VirtualAddress::new(KERNEL_BASE + 0x8_0010)),
            Some(PhysicalAddress::new(0x8_0010))
        );
        assert_eq!(vmm.translate(VirtualAddress::new(2 * MIB)), None);
        assert_eq!(vmm.translate(VirtualAddress::new(KERNEL_BASE + MIB)), None);
        assert_eq!(vmm.leaf_flags(VirtualAddress::new(0)), Some(PageEntryBits::kernel_rw()));

        // Both standing windows exceed the per-page threshold.
        assert_eq!(tlb.full.get(), 2);

        assert_eq!(vmm.teardown(&mut frames), 7);
        assert_eq!(frames.free_pages(), 256);
    }

    #[test]
    fn init_out_of_frames_returns_everything() {
        let phys = SparsePhys::new();
        let regions = regions(5);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();

        let err = Vmm::init(&phys, &mut frames, NoFlush, small_layout()).unwrap_err();
        assert_eq!(err, VmmError::OutOfMemory);
        assert_eq!(frames.free_pages(), 5);
    }

    #[test]
    fn debug_shows_root_and_layout() {
        let phys = SparsePhys::new();
        let regions = regions(16);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();

        let vmm = Vmm::new(&phys, &mut frames, NoFlush, small_layout()).unwrap();
        let shown = format!("{vmm:?}");
        assert!(shown.starts_with("Vmm { root: PhysicalPage<4K>(0x0000000000800000)"));
        assert!(shown.contains("identity_bytes: 2097152"));
        assert!(shown.ends_with(", .. }"));
    }

    fn empty_vmm<'m>(
        phys: &'m SparsePhys,
        frames: &mut BitmapFrameAlloc<'m, SparsePhys>,
        tlb: &'m RecordingTlb,
    ) -> Vmm<'m, SparsePhys, &'m RecordingTlb> {
        Vmm::new(phys, frames, tlb, small_layout()).unwrap()
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let phys = SparsePhys::new();
        let regions = regions(64);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();
        let tlb = RecordingTlb::default();
        let mut vmm = empty_vmm(&phys, &mut frames, &tlb);

        let va = VirtualAddress::new(0x4000_1000);
        vmm.map(&mut frames, va, PhysicalAddress::new(0x20_0000), PageEntryBits::kernel_rw_nx())
            .unwrap();
        assert_eq!(
            vmm.translate(va + 0x123),
            Some(PhysicalAddress::new(0x20_0123))
        );

        assert_eq!(vmm.unmap(va + 0x10), Some(PhysicalAddress::new(0x20_0000)));
        assert_eq!(vmm.translate(va), None);
        assert_eq!(vmm.unmap(va), None);
        assert_eq!(*tlb.pages.borrow(), vec![0x4000_1000, 0x4000_1000]);
    }

    #[test]
    fn second_mapping_wins() {
        let phys = SparsePhys::new();
        let regions = regions(64);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();
        let tlb = RecordingTlb::default();
        let mut vmm = empty_vmm(&phys, &mut frames, &tlb);

        let va = VirtualAddress::new(0x7000);
        let flags = PageEntryBits::kernel_rw();
        vmm.map(&mut frames, va, PhysicalAddress::new(0x1000), flags).unwrap();
        vmm.map(&mut frames, va, PhysicalAddress::new(0x9000), flags).unwrap();
        assert_eq!(vmm.translate(va), Some(PhysicalAddress::new(0x9000)));
        assert_eq!(tlb.pages.borrow().len(), 2);
    }

    #[test]
    fn protect_keeps_frames_and_skips_holes() {
        let phys = SparsePhys::new();
        let regions = regions(64);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();
        let tlb = RecordingTlb::default();
        let mut vmm = empty_vmm(&phys, &mut frames, &tlb);

        let base = VirtualAddress::new(0x40_0000);
        let rw = PageEntryBits::kernel_rw_nx();
        vmm.map(&mut frames, base, PhysicalAddress::new(0xA000), rw).unwrap();
        vmm.map(&mut frames, base + 2 * PAGE_SIZE, PhysicalAddress::new(0xC000), rw)
            .unwrap();

        // Unaligned start and length still cover all three pages.
        let changed = vmm
            .protect(&mut frames, base + 0x10, 2 * PAGE_SIZE, PageEntryBits::kernel_ro_nx())
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(vmm.leaf_flags(base), Some(PageEntryBits::kernel_ro_nx()));
        assert_eq!(vmm.translate(base), Some(PhysicalAddress::new(0xA000)));
        assert_eq!(
            vmm.translate(base + 2 * PAGE_SIZE),
            Some(PhysicalAddress::new(0xC000))
        );
        assert_eq!(vmm.translate(base + PAGE_SIZE), None);

        assert_eq!(
            vmm.protect(&mut frames, VirtualAddress::new(u64::MAX - 10), 100, rw),
            Err(VmmError::InvalidRange)
        );
    }

    #[test]
    fn map_range_rejects_unaligned_addresses() {
        let phys = SparsePhys::new();
        let regions = regions(64);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();
        let tlb = RecordingTlb::default();
        let mut vmm = empty_vmm(&phys, &mut frames, &tlb);
        let flags = PageEntryBits::kernel_rw();

        let va = VirtualAddress::new;
        let pa = PhysicalAddress::new;

        assert_eq!(
            vmm.map_range(&mut frames, va(0x1001), pa(0), 4096, flags),
            Err(VmmError::Unaligned(0x1001))
        );
        assert_eq!(
            vmm.map_range(&mut frames, va(0x1000), pa(0x10), 4096, flags),
            Err(VmmError::Unaligned(0x10))
        );

        vmm.map_range(&mut frames, va(0x10_0000), pa(0x30_0000), 0x2001, flags).unwrap();
        assert_eq!(
            vmm.translate(VirtualAddress::new(0x10_2000)),
            Some(PhysicalAddress::new(0x30_2000))
        );
        assert_eq!(vmm.unmap_range(VirtualAddress::new(0x10_0000), 3 * PAGE_SIZE), 3);
        assert_eq!(vmm.translate(VirtualAddress::new(0x10_0000)), None);
    }

    #[test]
    fn map_anon_backs_with_zeroed_frames() {
        let phys = SparsePhys::new();
        let regions = regions(64);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();
        let tlb = RecordingTlb::default();
        let mut vmm = empty_vmm(&phys, &mut frames, &tlb);

        let va = VirtualAddress::new(KERNEL_HEAP_BASE);
        vmm.map_anon(&mut frames, va, 4 * PAGE_SIZE, PageEntryBits::kernel_rw_nx())
            .unwrap();

        let mut targets = Vec::new();
        for i in 0..4 {
            let pa = vmm.translate(va + i * PAGE_SIZE).unwrap();
            assert!(frames.is_allocated(pa));
            assert!(phys.frame_bytes(pa).unwrap().iter().all(|&b| b == 0));
            targets.push(pa);
        }
        targets.dedup();
        assert_eq!(targets.len(), 4);

        let free = frames.free_pages();
        assert_eq!(vmm.unmap_anon(&mut frames, va, 4 * PAGE_SIZE), 4);
        assert_eq!(frames.free_pages(), free + 4);
    }

    #[test]
    fn map_anon_rolls_back_on_exhaustion() {
        let phys = SparsePhys::new();
        let regions = regions(11);
        let mut storage = vec![0; BitmapFrameAlloc::<SparsePhys>::words_needed(&regions)];
        let mut frames = BitmapFrameAlloc::init(&phys, &regions, &mut storage).unwrap();
        let tlb = RecordingTlb::default();
        let mut vmm = empty_vmm(&phys, &mut frames, &tlb);
        assert_eq!(frames.free_pages(), 10);

        let va = VirtualAddress::new(0x80_0000);
        let err = vmm
            .map_anon(&mut frames, va, 20 * PAGE_SIZE, PageEntryBits::kernel_rw_nx())
            .unwrap_err();
        assert_eq!(err, VmmError::OutOfMemory);

        // The three tables created on the way stay; every data frame is back.
        assert_eq!(frames.free_pages(), 7);
        for i in 0..20 {
            assert_eq!(vmm.translate(va + i * PAGE_SIZE), None);
        }
    }

    #[test]
    fn error_messages() {
        assert_eq!(VmmError::Unaligned(0x1001).to_string(), "address 0x1001 is not page aligned");
        assert_eq!(
            VmmError::from(MapError::OutOfFrames(kernel_vmem::TableLevel::Pd)),
            VmmError::OutOfMemory
        );
    }
}
