//! # Kernel Heap
//!
//! A first-fit allocator over one contiguous, already mapped virtual range.
//! The arena is a doubly linked list of blocks laid end to end; every block
//! starts with a 32-byte header carrying its size, an allocated flag and a
//! sentinel.
//!
//! - Requests are rounded up to [`Heap::ALIGN`]; a block is split only when
//!   the tail would be at least [`Heap::MIN_BLOCK_SIZE`].
//! - `free` validates the pointer before touching anything, then merges with
//!   both neighbours so two free blocks are never adjacent.
//! - `realloc` never shrinks in place.
//!
//! The heap itself does no locking; see [`LockedHeap`](crate::LockedHeap).

mod block;

use crate::heap::block::{BlockHeader, HEADER_SIZE, Link, MAGIC, absorb, payload, split};
use crate::mem;
use core::fmt;
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_memory_addresses::align::align_up_usize;
use log::{error, info, trace, warn};

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("heap arena of {0} bytes is smaller than a page")]
    ArenaTooSmall(usize),
    #[error("heap arena at 0x{base:x} (+0x{size:x}) is misaligned or wraps")]
    InvalidArena { base: u64, size: usize },
    #[error("heap already initialized")]
    AlreadyInitialized,
    #[error("out of heap memory for {0} bytes")]
    OutOfMemory(usize),
    #[error("0x{0:x} is not a live heap pointer")]
    InvalidPointer(usize),
    #[error("double free of 0x{0:x}")]
    DoubleFree(usize),
    #[error("heap block at 0x{0:x} is corrupted")]
    Corrupted(usize),
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub allocations: u64,
    pub frees: u64,
    pub blocks: usize,
    pub largest_free: usize,
}

/// One block as seen by [`Heap::blocks`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    /// Header address.
    pub addr: usize,
    /// Header plus payload.
    pub size: usize,
    pub allocated: bool,
}

pub struct Heap {
    first: Link,
    start: usize,
    end: usize,
    used: usize,
    allocations: u64,
    frees: u64,
}

// SAFETY: the heap exclusively owns its arena; all access goes through
// `&mut self`.
unsafe impl Send for Heap {}

impl Heap {
    /// Alignment of every payload and every block size.
    pub const ALIGN: usize = 16;
    /// Smallest tail worth splitting off.
    pub const MIN_BLOCK_SIZE: usize = 64;
    /// Per-block overhead.
    pub const HEADER_SIZE: usize = HEADER_SIZE;

    /// A heap without an arena; every allocation fails until [`init`](Self::init).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            first: None,
            start: 0,
            end: 0,
            used: 0,
            allocations: 0,
            frees: 0,
        }
    }

    /// Take over `[base, base + size)` as one free block. `size` is rounded
    /// up to a whole page.
    ///
    /// # Safety
    /// The rounded range must be mapped writable, unused by anything else,
    /// and stay so for as long as this heap (or a pointer from it) is used.
    ///
    /// # Errors
    /// [`HeapError::ArenaTooSmall`], [`HeapError::InvalidArena`] or
    /// [`HeapError::AlreadyInitialized`].
    pub unsafe fn init(&mut self, base: VirtualAddress, size: usize) -> Result<(), HeapError> {
        if self.first.is_some() {
            warn!("heap: init called twice");
            return Err(HeapError::AlreadyInitialized);
        }
        if size < PAGE {
            error!("heap: arena of {size} bytes is smaller than a page");
            return Err(HeapError::ArenaTooSmall(size));
        }

        let invalid = HeapError::InvalidArena {
            base: base.as_u64(),
            size,
        };
        let Some(size) = align_up_usize(size, PAGE) else {
            return Err(invalid);
        };
        let Ok(start) = usize::try_from(base.as_u64()) else {
            return Err(invalid);
        };
        let Some(end) = start.checked_add(size) else {
            error!("heap: arena at {base} (+0x{size:x}) wraps");
            return Err(invalid);
        };
        if start % Self::ALIGN != 0 {
            error!("heap: arena base {base} is not {}-byte aligned", Self::ALIGN);
            return Err(invalid);
        }
        let Some(first) = NonNull::new(base.as_mut_ptr::<BlockHeader>()) else {
            return Err(invalid);
        };

        // SAFETY: the caller hands us the whole range; it is aligned and
        // large enough for a header.
        unsafe { first.write(BlockHeader::free(size, None, None)) };
        *self = Self {
            first: Some(first),
            start,
            end,
            used: 0,
            allocations: 0,
            frees: 0,
        };

        info!("heap: 0x{start:x}-0x{end:x} ({} KiB)", size / 1024);
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.first.is_some()
    }

    /// `size` bytes, aligned to [`Heap::ALIGN`], contents unspecified.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] or [`HeapError::OutOfMemory`].
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            warn!("heap: zero-sized allocation");
            return Err(HeapError::ZeroSize);
        }
        let Some(total) = align_up_usize(size, Self::ALIGN).and_then(|n| n.checked_add(HEADER_SIZE))
        else {
            warn!("heap: allocation of {size} bytes overflows");
            return Err(HeapError::OutOfMemory(size));
        };

        let mut cursor = self.first;
        while let Some(mut block) = cursor {
            // SAFETY: every block on the list is a valid header in the arena.
            let (fits, spare, next) = unsafe {
                let header = block.as_ref();
                let fits = !header.is_allocated() && header.size >= total;
                (fits, header.size.saturating_sub(total), header.next)
            };
            if fits {
                // SAFETY: as above; a split tail is at least MIN_BLOCK_SIZE
                // and stays aligned.
                let header = unsafe {
                    if spare >= Self::MIN_BLOCK_SIZE {
                        split(block, total);
                    }
                    block.as_mut()
                };
                header.set_allocated(true);
                self.used += header.size;
                self.allocations += 1;

                let ptr = payload(block);
                trace!("heap: alloc {size} -> {ptr:p}");
                return Ok(ptr);
            }
            cursor = next;
        }

        warn!(
            "heap: out of memory for {size} bytes ({} of {} free)",
            self.end - self.start - self.used,
            self.end - self.start
        );
        Err(HeapError::OutOfMemory(size))
    }

    /// `count * size` zeroed bytes.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc); an overflowing product is out of memory.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let Some(bytes) = count.checked_mul(size) else {
            warn!("heap: calloc {count} x {size} overflows");
            return Err(HeapError::OutOfMemory(usize::MAX));
        };
        let ptr = self.alloc(bytes)?;
        // SAFETY: the payload holds at least `bytes` bytes.
        unsafe { ptr.write_bytes(0, bytes) };
        Ok(ptr)
    }

    /// Resize an allocation.
    ///
    /// `None` allocates; a size of zero frees and returns `Ok(None)`. If the
    /// block already holds `size` bytes the same pointer comes back. On
    /// failure the original allocation is untouched.
    ///
    /// # Safety
    /// `ptr` must not be used after a call that returned a different pointer
    /// or `Ok(None)`.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc) and [`free`](Self::free).
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(ptr) = ptr else {
            return self.alloc(size).map(Some);
        };
        if size == 0 {
            // SAFETY: forwarded from the caller.
            unsafe { self.free(ptr)? };
            return Ok(None);
        }

        let block = self.live_block(ptr, "realloc")?;
        // SAFETY: validated above.
        let capacity = unsafe { block.as_ref().payload_size() };
        if size <= capacity {
            return Ok(Some(ptr));
        }

        let new = self.alloc(size)?;
        // SAFETY: distinct live blocks; `capacity < size` bytes fit in both.
        unsafe {
            mem::copy(new.as_ptr(), ptr.as_ptr(), capacity);
            self.free(ptr)?;
        }
        Ok(Some(new))
    }

    /// Return an allocation. Invalid pointers are reported and ignored.
    ///
    /// # Safety
    /// If `ptr` came from this heap, nothing may use it afterwards.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`], [`HeapError::DoubleFree`] or
    /// [`HeapError::Corrupted`]; the heap is unchanged in each case.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let mut block = match self.block_of(ptr, "free") {
            Ok((block, true)) => block,
            Ok((_, false)) => {
                warn!("heap: double free of {ptr:p}");
                return Err(HeapError::DoubleFree(ptr.addr().get()));
            }
            Err(e) => return Err(e),
        };

        // SAFETY: validated by `block_of`.
        let header = unsafe { block.as_mut() };
        header.set_allocated(false);
        self.used -= header.size;
        self.frees += 1;
        trace!("heap: free {ptr:p} ({} bytes)", header.size);

        // SAFETY: list neighbours are valid headers; merging keeps the list
        // covering the arena.
        unsafe {
            while let Some(next) = block.as_ref().next
                && !next.as_ref().is_allocated()
            {
                absorb(block, next);
            }
            while let Some(prev) = block.as_ref().prev
                && !prev.as_ref().is_allocated()
            {
                absorb(prev, block);
                block = prev;
            }
        }
        Ok(())
    }

    /// Payload bytes available behind a live pointer.
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let block = self.live_block(ptr, "usable_size").ok()?;
        // SAFETY: validated by `live_block`.
        Some(unsafe { block.as_ref().payload_size() })
    }

    fn live_block(&self, ptr: NonNull<u8>, op: &str) -> Result<NonNull<BlockHeader>, HeapError> {
        match self.block_of(ptr, op)? {
            (block, true) => Ok(block),
            (_, false) => {
                warn!("heap: {op} of freed pointer {ptr:p}");
                Err(HeapError::InvalidPointer(ptr.addr().get()))
            }
        }
    }

    /// Header behind `ptr` and whether it is allocated, after checking bounds,
    /// alignment, the sentinel and the recorded size.
    fn block_of(
        &self,
        ptr: NonNull<u8>,
        op: &str,
    ) -> Result<(NonNull<BlockHeader>, bool), HeapError> {
        let addr = ptr.addr().get();
        if addr < self.start + HEADER_SIZE || addr >= self.end || addr % Self::ALIGN != 0 {
            warn!(
                "heap: {op} of {ptr:p} outside arena 0x{:x}-0x{:x}",
                self.start, self.end
            );
            return Err(HeapError::InvalidPointer(addr));
        }

        // SAFETY: `addr - HEADER_SIZE` is aligned and inside the arena.
        let block = unsafe { ptr.byte_sub(HEADER_SIZE) }.cast::<BlockHeader>();
        // SAFETY: in-arena, aligned u32 read.
        let magic = unsafe { (*block.as_ptr()).magic };
        if magic != MAGIC {
            warn!("heap: {op} of {ptr:p}: bad sentinel 0x{magic:08x}");
            return Err(HeapError::InvalidPointer(addr));
        }

        // SAFETY: in-arena and aligned; any bit pattern is a valid header.
        let header = unsafe { block.as_ref() };
        let room = self.end - (addr - HEADER_SIZE);
        if !header.has_valid_state() {
            error!("heap: {op} of {ptr:p}: block state is corrupt");
            return Err(HeapError::Corrupted(addr - HEADER_SIZE));
        }
        if header.size < HEADER_SIZE || header.size % Self::ALIGN != 0 || header.size > room {
            error!("heap: {op} of {ptr:p}: block size {} is corrupt", header.size);
            return Err(HeapError::Corrupted(addr - HEADER_SIZE));
        }
        Ok((block, header.is_allocated()))
    }

    /// Every block from the start of the arena.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        // SAFETY: the list only holds valid headers.
        core::iter::successors(self.first, |&b| unsafe { b.as_ref().next }).map(|b| {
            let header = unsafe { b.as_ref() };
            BlockInfo {
                addr: b.addr().get(),
                size: header.size,
                allocated: header.is_allocated(),
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let total = self.end - self.start;
        let (blocks, largest_free) = self.blocks().fold((0, 0), |(n, largest), b| {
            let free = if b.allocated { 0 } else { b.size - HEADER_SIZE };
            (n + 1, largest.max(free))
        });
        HeapStats {
            total,
            used: self.used,
            free: total - self.used,
            allocations: self.allocations,
            frees: self.frees,
            blocks,
            largest_free,
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        let percent = if stats.total == 0 {
            0
        } else {
            stats.used * 100 / stats.total
        };
        info!("heap: 0x{:x}-0x{:x}", self.start, self.end);
        info!(
            "heap: {} bytes total, {} used, {} free ({percent}% used)",
            stats.total, stats.used, stats.free
        );
        info!(
            "heap: {} allocations, {} frees, {} blocks, largest free {}",
            stats.allocations, stats.frees, stats.blocks, stats.largest_free
        );
    }

    /// Walk the list and verify its structure.
    ///
    /// Blocks must be contiguous with intact sentinels and back links, sizes
    /// must add up to the arena, and no two free blocks may touch.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] with the first offending header address.
    pub fn check(&self) -> Result<(), HeapError> {
        let mut expected = self.start;
        let mut prev: Link = None;
        let mut prev_free = false;
        let mut used = 0;

        let mut cursor = self.first;
        while let Some(block) = cursor {
            let addr = block.addr().get();
            // SAFETY: reached through the list.
            let header = unsafe { block.as_ref() };
            let sane = addr == expected
                && header.magic == MAGIC
                && header.prev == prev
                && header.size >= HEADER_SIZE
                && header.size % Self::ALIGN == 0
                && header.has_valid_state()
                && !(prev_free && !header.is_allocated());
            let Some(next_addr) = addr.checked_add(header.size).filter(|&e| sane && e <= self.end)
            else {
                error!("heap: corrupted block at 0x{addr:x}");
                return Err(HeapError::Corrupted(addr));
            };

            if header.is_allocated() {
                used += header.size;
            }
            prev_free = !header.is_allocated();
            prev = Some(block);
            expected = next_addr;
            cursor = header.next;
        }

        if expected != self.end || used != self.used {
            error!("heap: block list ends at 0x{expected:x}, arena at 0x{:x}", self.end);
            return Err(HeapError::Corrupted(expected));
        }
        Ok(())
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("start", &format_args!("0x{:x}", self.start))
            .field("end", &format_args!("0x{:x}", self.end))
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}
