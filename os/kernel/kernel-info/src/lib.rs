//! # Kernel Memory Configuration and Boot Hand-Off
//!
//! Layout constants and the boot-time memory map types shared by the frame
//! allocator, the page-table mapper and the heap.
//!
//! ## Overview
//!
//! The crate is organized into two modules:
//!
//! ### Boot Information ([`boot`])
//! The memory map handed over by the boot collaborator: a slice of
//! [`MemoryRegion`](boot::MemoryRegion) values, each with a start, a length and
//! a [`MemoryRegionKind`](boot::MemoryRegionKind). The frame allocator consumes
//! the map exactly once.
//!
//! ### Memory Layout ([`memory`])
//! Architecture constants (page size, identity window, kernel base, heap
//! placement) and the [`KernelLayout`](memory::KernelLayout) value that bundles
//! them so tests can bring up a smaller system.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Identity map of low physical   │
//!                       │  memory (IDENTITY_LOW_BYTES)    │
//! 0x0000_0001_0000_0000 ├─────────────────────────────────┤
//!                       │            unmapped             │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │  KERNEL_BASE + pa for the first │
//!                       │  KERNEL_WINDOW_BYTES of RAM     │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_ffff_9000_0000
//!                       │  Kernel heap (KERNEL_HEAP_SIZE) │
//!                       ├─────────────────────────────────┤
//!                       │            unmapped             │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
//! use kernel_info::memory::KernelLayout;
//!
//! let regions = [
//!     MemoryRegion::new(0x0010_0000, 0x0080_0000, MemoryRegionKind::Available),
//!     MemoryRegion::new(0x0600_0000, 0x0100_0000, MemoryRegionKind::Reserved),
//! ];
//! assert!(regions[0].is_available());
//! assert_eq!(regions[0].end(), 0x0090_0000);
//!
//! let layout = KernelLayout::DEFAULT;
//! assert!(layout.validate().is_ok());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
