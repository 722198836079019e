//! # Virtual and Physical Memory Address Types
//!
//! Typed `u64` wrappers so physical and virtual addresses cannot be mixed
//! up, plus page types parameterized by a [`PageSize`] marker.
//!
//! | Space | Address | Page |
//! |----------|----------|-------------|
//! | physical | [`PhysicalAddress`] | [`PhysicalPage<S>`] (a frame) |
//! | virtual | [`VirtualAddress`] | [`VirtualPage<S>`] |
//!
//! The [`align`] module carries the plain integer helpers (`align_up`,
//! `align_down`, `is_aligned`) shared by the allocators.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(page.base() + va.offset::<Size4K>(), va);
//!
//! let frame = PhysicalPage::<Size4K>::from_number(3);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x3000));
//! ```
//!
//! All types are `#[repr(transparent)]`, `Copy`, `Ord` and `Hash`, and the
//! arithmetic is `const fn` where the compiler allows it.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod address;
pub mod align;
mod page_size;

pub use address::{PhysicalAddress, PhysicalPage, Unaligned, VirtualAddress, VirtualPage};
pub use page_size::{PageSize, Size4K};
