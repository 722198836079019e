//! In-band block header.
//!
//! ```text
//!  ┌──────────── size ─────────────┐
//!  │ BlockHeader (32) │ payload ... │ next block ...
//!  └──────────────────┴─────────────┘
//!                     ^ pointer handed out
//! ```

use core::ptr::NonNull;

/// Written into every live header; cleared when a block is absorbed.
pub const MAGIC: u32 = 0xDEAD_BEEF;

pub type Link = Option<NonNull<BlockHeader>>;

const FREE: u32 = 0;
const USED: u32 = 1;

/// Every field is valid for any bit pattern, so a header can be read from
/// memory that turns out to be payload.
#[repr(C, align(16))]
pub struct BlockHeader {
    /// Header plus payload, a multiple of the heap alignment.
    pub size: usize,
    pub next: Link,
    pub prev: Link,
    pub magic: u32,
    state: u32,
}

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE == 32);

impl BlockHeader {
    /// A free block of `size` bytes.
    pub const fn free(size: usize, prev: Link, next: Link) -> Self {
        Self {
            size,
            next,
            prev,
            magic: MAGIC,
            state: FREE,
        }
    }

    #[inline]
    pub const fn is_allocated(&self) -> bool {
        self.state == USED
    }

    #[inline]
    pub const fn set_allocated(&mut self, allocated: bool) {
        self.state = if allocated { USED } else { FREE };
    }

    /// The state word holds one of the two values this module writes.
    #[inline]
    pub const fn has_valid_state(&self) -> bool {
        matches!(self.state, FREE | USED)
    }

    #[inline]
    pub const fn payload_size(&self) -> usize {
        self.size - HEADER_SIZE
    }
}

/// First payload byte of `block`.
#[inline]
pub const fn payload(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // SAFETY: a block always spans at least its header, so one header past
    // it stays inside (or one past the end of) the arena.
    unsafe { block.add(1).cast() }
}

/// Split `block` after `total` bytes; the tail becomes a free block linked
/// right after it.
///
/// # Safety
/// `block` must be a valid header with `size >= total + HEADER_SIZE`, and
/// `total` must keep the tail aligned.
pub unsafe fn split(mut block: NonNull<BlockHeader>, total: usize) {
    unsafe {
        let head = block.as_mut();
        let rest = block.byte_add(total);
        rest.write(BlockHeader::free(head.size - total, Some(block), head.next));
        if let Some(mut next) = head.next {
            next.as_mut().prev = Some(rest);
        }
        head.next = Some(rest);
        head.size = total;
    }
}

/// Fold `b`, the successor of `a`, into `a` and invalidate its header.
///
/// # Safety
/// Both must be valid, distinct headers with `a.next == Some(b)`.
pub unsafe fn absorb(mut a: NonNull<BlockHeader>, mut b: NonNull<BlockHeader>) {
    unsafe {
        let tail = b.as_mut();
        tail.magic = 0;
        let (size, next) = (tail.size, tail.next);

        let head = a.as_mut();
        head.size += size;
        head.next = next;
        if let Some(mut next) = next {
            next.as_mut().prev = Some(a);
        }
    }
}
