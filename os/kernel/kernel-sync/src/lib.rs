//! # Kernel synchronization primitives
//!
//! Each memory-management component (frame allocator, address space, heap)
//! sits behind exactly one [`SpinLock`]. The lock never sleeps and never
//! disables interrupts; callers in interrupt context must not take a lock
//! that the interrupted code may already hold.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
