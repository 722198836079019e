//! # Bitmap Frame Allocator
//!
//! One bit per 4 KiB frame across the span of available memory, plus a
//! second mask remembering which frames were never usable:
//!
//! ```text
//!  storage: [ used words ........ | reserved words .... ]
//!  used:     1 = allocated or reserved, 0 = free
//!  reserved: 1 = outside every Available region (never freed)
//! ```
//!
//! Allocation is a first-fit linear scan, skipping full words. A search hint
//! remembers the lowest word that may still hold a clear bit.

use core::fmt;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info, warn};

const BITS: usize = u64::BITS as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("memory map is empty")]
    NoRegions,
    #[error("memory map contains no usable frames")]
    NoAvailableMemory,
    #[error("bitmap storage too small: need {needed} words, got {provided}")]
    StorageTooSmall { needed: usize, provided: usize },
}

/// Snapshot of the allocator counters; the byte values are derived.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_pages: u64,
    pub free_pages: u64,
    pub allocations: u64,
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} KiB total, {} KiB used, {} KiB free ({} allocations)",
            self.total_bytes / 1024,
            self.used_bytes / 1024,
            self.available_bytes / 1024,
            self.allocations
        )
    }
}

#[inline]
fn bit(words: &[u64], idx: usize) -> bool {
    words[idx / BITS] & (1 << (idx % BITS)) != 0
}

#[inline]
fn set_bit(words: &mut [u64], idx: usize) {
    words[idx / BITS] |= 1 << (idx % BITS);
}

#[inline]
fn clear_bit(words: &mut [u64], idx: usize) {
    words[idx / BITS] &= !(1 << (idx % BITS));
}

/// Whole frames `[lo, hi)` of an available region below `limit`.
fn usable_frames(region: &MemoryRegion, limit: u64) -> Option<(u64, u64)> {
    let lo = region.start.div_ceil(PAGE_SIZE);
    let hi = region.end().min(limit) / PAGE_SIZE;
    (region.is_available() && lo < hi).then_some((lo, hi))
}

/// Frames `[first, end)` spanned by the usable parts of available regions.
///
/// Other regions do not widen the span; frames outside it count as
/// allocated anyway.
fn frame_span(regions: &[MemoryRegion], limit: u64) -> Option<(u64, u64)> {
    regions
        .iter()
        .filter_map(|r| usable_frames(r, limit))
        .reduce(|(a, b), (lo, hi)| (a.min(lo), b.max(hi)))
}

pub struct BitmapFrameAlloc<'m, M: PhysMapper> {
    mapper: &'m M,
    used: &'m mut [u64],
    reserved: &'m mut [u64],
    first_frame: u64,
    frame_count: usize,
    total_pages: u64,
    free_pages: u64,
    allocations: u64,
    /// No clear `used` bit lives in a word below this one.
    hint: usize,
}

/// Words of storage needed to track `frames` frames.
#[inline]
#[must_use]
pub const fn words_for_frames(frames: usize) -> usize {
    2 * frames.div_ceil(BITS)
}

impl<'m, M: PhysMapper> BitmapFrameAlloc<'m, M> {
    /// Words of storage [`init`](Self::init) needs for `regions` with a
    /// mapper that reaches all of physical memory. Smaller reach needs less.
    #[must_use]
    pub fn words_needed(regions: &[MemoryRegion]) -> usize {
        frame_span(regions, u64::MAX).map_or(0, |(lo, hi)| {
            usize::try_from(hi - lo).map_or(usize::MAX, words_for_frames)
        })
    }

    /// Build the bitmap from the boot memory map.
    ///
    /// Only whole pages inside `Available` regions and below
    /// [`PhysMapper::phys_limit`] become free. Any other region wins where it
    /// overlaps an available one. Frames handed out later are zeroed through
    /// `mapper`.
    ///
    /// # Errors
    /// See [`FrameAllocError`].
    pub fn init(
        mapper: &'m M,
        regions: &[MemoryRegion],
        storage: &'m mut [u64],
    ) -> Result<Self, FrameAllocError> {
        if regions.is_empty() {
            error!("frame allocator: empty memory map");
            return Err(FrameAllocError::NoRegions);
        }

        let limit = mapper.phys_limit();
        let Some((first_frame, end_frame)) = frame_span(regions, limit) else {
            error!(
                "frame allocator: no available memory below 0x{limit:x} in {} regions",
                regions.len()
            );
            return Err(FrameAllocError::NoAvailableMemory);
        };

        let provided = storage.len();
        let Ok(frame_count) = usize::try_from(end_frame - first_frame) else {
            return Err(FrameAllocError::StorageTooSmall {
                needed: usize::MAX,
                provided,
            });
        };
        let needed = words_for_frames(frame_count);
        if provided < needed {
            error!("frame allocator: bitmap needs {needed} words, storage has {provided}");
            return Err(FrameAllocError::StorageTooSmall { needed, provided });
        }

        let (used, rest) = storage.split_at_mut(needed / 2);
        let (reserved, _) = rest.split_at_mut(needed / 2);
        used.fill(u64::MAX);
        reserved.fill(u64::MAX);

        let mut this = Self {
            mapper,
            used,
            reserved,
            first_frame,
            frame_count,
            total_pages: 0,
            free_pages: 0,
            allocations: 0,
            hint: 0,
        };

        for region in regions {
            debug!("memory region {region}");
        }

        for (lo, hi) in regions.iter().filter_map(|r| usable_frames(r, limit)) {
            for frame in lo..hi {
                let idx = this.frame_index(frame);
                if bit(this.reserved, idx) {
                    clear_bit(this.reserved, idx);
                    clear_bit(this.used, idx);
                    this.free_pages += 1;
                }
            }
        }

        for region in regions.iter().filter(|r| !r.is_available() && !r.is_empty()) {
            let lo = (region.start / PAGE_SIZE).max(first_frame);
            let hi = region.end().div_ceil(PAGE_SIZE).min(end_frame);
            for frame in lo..hi {
                let idx = this.frame_index(frame);
                if !bit(this.reserved, idx) {
                    set_bit(this.reserved, idx);
                    set_bit(this.used, idx);
                    this.free_pages -= 1;
                }
            }
        }

        if this.free_pages == 0 {
            error!("frame allocator: no available memory in {} regions", regions.len());
            return Err(FrameAllocError::NoAvailableMemory);
        }

        this.total_pages = this.free_pages;
        info!(
            "frame allocator: {} usable frames ({} MiB) in 0x{:x}-0x{:x}",
            this.total_pages,
            this.total_pages * PAGE_SIZE / (1024 * 1024),
            first_frame * PAGE_SIZE,
            end_frame * PAGE_SIZE
        );
        Ok(this)
    }

    /// Bit index of a frame number known to lie in the covered span.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn frame_index(&self, frame: u64) -> usize {
        (frame - self.first_frame) as usize
    }

    fn index_of(&self, pa: PhysicalAddress) -> Option<usize> {
        let idx = pa.page::<Size4K>().number().checked_sub(self.first_frame)?;
        let idx = usize::try_from(idx).ok()?;
        (idx < self.frame_count).then_some(idx)
    }

    fn page_at(&self, idx: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.first_frame + idx as u64)
    }

    /// First index of `count` consecutive clear bits at or after the hint.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut idx = self.hint * BITS;
        let mut run_start = 0;
        let mut run_len = 0;

        while idx < self.frame_count {
            if run_len == 0 && idx % BITS == 0 {
                let word = self.used[idx / BITS];
                if word == u64::MAX {
                    idx += BITS;
                    continue;
                }
                if count == 1 {
                    let found = idx + (!word).trailing_zeros() as usize;
                    return (found < self.frame_count).then_some(found);
                }
            }

            if bit(self.used, idx) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            idx += 1;
        }
        None
    }

    /// Mark `[start, start + count)` allocated and zero it.
    fn take_run(&mut self, start: usize, count: usize) -> PhysicalPage<Size4K> {
        for idx in start..start + count {
            set_bit(self.used, idx);
        }
        self.free_pages -= count as u64;
        self.allocations += 1;
        if count == 1 {
            self.hint = start / BITS;
        }

        let first = self.page_at(start);
        for idx in start..start + count {
            // SAFETY: the frame was free until now, so nothing else refers to
            // it, and the mapper covers every frame this allocator manages.
            unsafe { self.mapper.zero_frame(self.page_at(idx)) };
        }
        first
    }

    /// One zeroed frame, or `None` when physical memory is exhausted.
    pub fn alloc_one(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.free_pages == 0 {
            warn!("frame allocator: out of physical memory");
            return None;
        }

        let Some(idx) = self.find_free_run(1) else {
            error!(
                "frame allocator: no clear bit despite {} free pages",
                self.free_pages
            );
            return None;
        };
        Some(self.take_run(idx, 1))
    }

    /// First frame of `count` physically contiguous zeroed frames.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<PhysicalPage<Size4K>> {
        match count {
            0 => {
                warn!("frame allocator: contiguous allocation of 0 frames");
                None
            }
            1 => self.alloc_one(),
            _ => {
                if self.free_pages < count as u64 {
                    warn!(
                        "frame allocator: {count} frames requested, {} free",
                        self.free_pages
                    );
                    return None;
                }
                let Some(start) = self.find_free_run(count) else {
                    warn!("frame allocator: no run of {count} contiguous frames");
                    return None;
                };
                Some(self.take_run(start, count))
            }
        }
    }

    /// Return one frame. Invalid frees are logged and ignored.
    pub fn free_one(&mut self, pa: PhysicalAddress) {
        self.free_contiguous(pa, 1);
    }

    /// Return `count` frames starting at `pa`.
    ///
    /// The whole run is checked first; if any frame is misaligned, outside
    /// the bitmap, reserved, or already free, nothing changes.
    pub fn free_contiguous(&mut self, pa: PhysicalAddress, count: usize) {
        if count == 0 {
            return;
        }
        if !pa.is_aligned::<Size4K>() {
            warn!("frame allocator: free of unaligned address {pa}");
            return;
        }
        let Some(start) = self.index_of(pa) else {
            warn!("frame allocator: free of {pa} outside managed memory");
            return;
        };
        if count > self.frame_count - start {
            warn!("frame allocator: free of {count} frames at {pa} runs past managed memory");
            return;
        }

        for idx in start..start + count {
            if bit(self.reserved, idx) {
                warn!("frame allocator: free of reserved frame {}", self.page_at(idx));
                return;
            }
            if !bit(self.used, idx) {
                warn!("frame allocator: double free of frame {}", self.page_at(idx));
                return;
            }
        }

        for idx in start..start + count {
            clear_bit(self.used, idx);
        }
        self.free_pages += count as u64;
        self.hint = self.hint.min(start / BITS);
    }

    /// `true` if the frame containing `pa` is allocated or reserved.
    /// Addresses outside the bitmap count as allocated.
    #[must_use]
    pub fn is_allocated(&self, pa: PhysicalAddress) -> bool {
        self.index_of(pa).is_none_or(|idx| bit(self.used, idx))
    }

    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    #[inline]
    #[must_use]
    pub const fn free_pages(&self) -> u64 {
        self.free_pages
    }

    #[must_use]
    pub const fn stats(&self) -> FrameStats {
        let used_pages = self.total_pages - self.free_pages;
        FrameStats {
            total_bytes: self.total_pages * PAGE_SIZE,
            used_bytes: used_pages * PAGE_SIZE,
            available_bytes: self.free_pages * PAGE_SIZE,
            total_pages: self.total_pages,
            free_pages: self.free_pages,
            allocations: self.allocations,
        }
    }

    /// Clear bits in the bitmap. Padding bits past the last frame stay set.
    #[must_use]
    pub fn count_free_bits(&self) -> u64 {
        self.used.iter().map(|w| u64::from(w.count_zeros())).sum()
    }

    /// Print the covered range, counters and runs of free frames.
    pub fn log_layout(&self) {
        let first = self.page_at(0);
        info!(
            "frame bitmap: {} frames from {first}, {}",
            self.frame_count,
            self.stats()
        );

        let mut idx = 0;
        while idx < self.frame_count {
            if bit(self.used, idx) {
                idx += 1;
                continue;
            }
            let start = idx;
            while idx < self.frame_count && !bit(self.used, idx) {
                idx += 1;
            }
            info!(
                "  free {}-{} ({} frames)",
                self.page_at(start).base(),
                self.page_at(idx).base(),
                idx - start
            );
        }
    }
}

impl<M: PhysMapper> FrameAlloc for BitmapFrameAlloc<'_, M> {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_one()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free_one(frame.base());
    }
}

impl<M: PhysMapper> fmt::Debug for BitmapFrameAlloc<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapFrameAlloc")
            .field("first_frame", &self.first_frame)
            .field("frame_count", &self.frame_count)
            .field("total_pages", &self.total_pages)
            .field("free_pages", &self.free_pages)
            .finish_non_exhaustive()
    }
}
