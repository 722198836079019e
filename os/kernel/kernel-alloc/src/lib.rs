//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The memory core of the kernel: physical frames, the kernel address space
//! and the kernel heap, each usable on its own and composed by
//! [`MemoryManager`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Heap  (heap, LockedHeap)            │
//! │    • first-fit block list with in-band headers      │
//! │    • split on alloc, coalesce on free               │
//! │    • GlobalAlloc for `alloc::` collections          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ arena mapped by
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Virtual Memory Manager (vmm)              │
//! │    • 4-level page tables, identity + high window    │
//! │    • map / unmap / translate / protect              │
//! │    • TLB invalidation after every leaf change       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ table frames from
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator (frame_alloc)    │
//! │    • one bit per 4 KiB frame, plus a reserved mask  │
//! │    • storage supplied by the caller (boot_bitmap)   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Physical memory is reached through a [`kernel_vmem::PhysMapper`]; the
//! [`phys_mapper`] module provides the identity and offset windows. Hosted
//! tests substitute a simulated memory.
//!
//! ## Bring-up
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::empty();
//!
//! let bitmap = boot_bitmap::take().ok_or(...)?;
//! let layout = KernelLayout::DEFAULT;
//! let phys = IdentityPhysMapper::identity_window(&layout);
//! let mm = MemoryManager::new(&phys, Invlpg, regions, bitmap, layout, &HEAP)?;
//! unsafe {
//!     mm.activate();
//!     mm.init_heap()?;
//! }
//! ```
//!
//! ## Concurrency
//!
//! The components themselves take no locks. [`MemoryManager`] puts each
//! behind a [`kernel_sync::SpinLock`] and always locks the address space
//! before the frame allocator. The heap lock is never held while taking
//! another one.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot_bitmap;
pub mod frame_alloc;
pub mod heap;
mod locked;
pub mod manager;
pub mod mem;
pub mod phys_mapper;
pub mod vmm;

#[cfg(test)]
mod test_support;

pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError, FrameStats};
pub use heap::{Heap, HeapError, HeapStats};
pub use locked::LockedHeap;
pub use manager::{MemoryInitError, MemoryManager, MemoryStats};
pub use vmm::{Vmm, VmmError};
