//! Address and page types for the physical and the virtual space.
//!
//! Both spaces get the same operations, generated by one macro;
//! only pointer conversions are specific to virtual addresses.

use crate::PageSize;
use crate::align;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};
use core::ptr::NonNull;

/// Error for converting an unaligned address into a page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Unaligned(pub u64);

impl fmt::Display for Unaligned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x} is not page aligned", self.0)
    }
}

macro_rules! address_space {
    (
        $(#[$addr_meta:meta])*
        $addr:ident, $tag:literal,
        $(#[$page_meta:meta])*
        $page:ident
    ) => {
        $(#[$addr_meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $addr(u64);

        impl $addr {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// The page of size `S` containing this address.
            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page::containing_address(self)
            }

            /// Byte offset inside the page of size `S`.
            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> u64 {
                self.0 & S::OFFSET_MASK
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                align::is_aligned(self.0, S::SIZE)
            }

            #[inline]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(align::align_down(self.0, S::SIZE))
            }

            /// `None` if rounding up passes the top of the address space.
            #[inline]
            #[must_use]
            pub const fn align_up<S: PageSize>(self) -> Option<Self> {
                match align::align_up(self.0, S::SIZE) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, bytes: u64) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl Add<u64> for $addr {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $addr {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl From<u64> for $addr {
            #[inline]
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        $(#[$page_meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $page<S: PageSize> {
            base: u64,
            _size: PhantomData<S>,
        }

        impl<S: PageSize> $page<S> {
            /// The page containing `addr`; the offset bits are dropped.
            #[inline]
            #[must_use]
            pub const fn containing_address(addr: $addr) -> Self {
                Self {
                    base: addr.0 & !S::OFFSET_MASK,
                    _size: PhantomData,
                }
            }

            /// Page number `number`, i.e. base `number << S::SHIFT`.
            #[inline]
            #[must_use]
            pub const fn from_number(number: u64) -> Self {
                Self::containing_address($addr(number << S::SHIFT))
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                $addr(self.base)
            }

            #[inline]
            #[must_use]
            pub const fn number(self) -> u64 {
                self.base >> S::SHIFT
            }

            /// `count` pages further up, or `None` past the top.
            #[inline]
            #[must_use]
            pub const fn checked_add(self, count: u64) -> Option<Self> {
                let Some(bytes) = count.checked_mul(S::SIZE) else {
                    return None;
                };
                match self.base.checked_add(bytes) {
                    Some(base) => Some(Self {
                        base,
                        _size: PhantomData,
                    }),
                    None => None,
                }
            }
        }

        impl<S: PageSize> fmt::Display for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}/{}", self.base, S::LABEL)
            }
        }

        impl<S: PageSize> fmt::Debug for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($page), "<{}>(0x{:016X})"), S::LABEL, self.base)
            }
        }

        impl<S: PageSize> TryFrom<$addr> for $page<S> {
            type Error = Unaligned;

            #[inline]
            fn try_from(addr: $addr) -> Result<Self, Unaligned> {
                if addr.is_aligned::<S>() {
                    Ok(Self::containing_address(addr))
                } else {
                    Err(Unaligned(addr.0))
                }
            }
        }

        impl<S: PageSize> From<$page<S>> for $addr {
            #[inline]
            fn from(page: $page<S>) -> Self {
                page.base()
            }
        }
    };
}

address_space!(
    /// An address in physical memory, as stored in page-table entries and
    /// handed out by the frame allocator.
    PhysicalAddress, "PA",
    /// A physical frame. For 4 KiB frames [`number`](Self::number) is the
    /// frame number the bitmap is indexed by.
    PhysicalPage
);

address_space!(
    /// An address translated by the page tables. Canonical form is not
    /// checked.
    VirtualAddress, "VA",
    /// A virtual page.
    VirtualPage
);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.addr() as u64)
    }

    #[inline]
    #[must_use]
    pub fn from_nonnull<T>(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }

    /// The address as a pointer; whether it is mapped is up to the caller.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        core::ptr::with_exposed_provenance_mut(self.0 as usize)
    }
}
