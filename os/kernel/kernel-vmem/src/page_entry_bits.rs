use bitfield_struct::bitfield;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};

/// A single 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// This models the **common superset** of fields found in all four paging
/// levels (PML4E, PDPTE, PDE, PTE). The same type doubles as the *flags*
/// argument of a mapping request: the address field is ignored there and
/// filled in by the mapper.
///
/// Field order follows the hardware encoding: flags in bits 0..=8, the
/// frame address in bits 12..=51, NX in bit 63.
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::kernel_rw().with_physical_address(PhysicalAddress::new(0x1234_5000));
/// assert!(e.present());
/// assert!(e.writable());
/// assert_eq!(e.physical_address().as_u64(), 0x1234_5000);
/// assert_eq!(e.into_bits(), 0x1234_5003);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Subject to supervisor/user checks via `user_access` and CR0.WP.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5); set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6); set by the CPU on first write to a leaf mapping.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Only meaningful at L3 (1 GiB) and L2 (2 MiB). The mapper never sets
    /// it, but walks stop at such entries when they come from elsewhere.
    pub large_page: bool,

    /// Global (G, bit 8); leaf only.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    ///
    /// Requires `EFER.NXE`; permissions intersect over the walk.
    pub no_execute: bool,
}

impl PageEntryBits {
    const ADDR_MASK: u64 = (1 << 40) - 1;

    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        // store bits [51:12]
        self.set_phys_addr_bits_51_12((phys.as_u64() >> Size4K::SHIFT) & Self::ADDR_MASK);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << Size4K::SHIFT)
    }

    /// The 4 KiB frame this entry points at, if present.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(PhysicalPage::containing_address(self.physical_address()))
        } else {
            None
        }
    }

    /// Same entry with the address field cleared, i.e. only the flags.
    #[inline]
    #[must_use]
    pub const fn flags_only(self) -> Self {
        self.with_phys_addr_bits_51_12(0)
    }

    /// Supervisor read/write, executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Supervisor read/write, no-execute.
    #[inline]
    #[must_use]
    pub const fn kernel_rw_nx() -> Self {
        Self::kernel_rw().with_no_execute(true)
    }

    /// Supervisor read-only, executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rx() -> Self {
        Self::new().with_present(true)
    }

    /// Supervisor read-only, no-execute.
    #[inline]
    #[must_use]
    pub const fn kernel_ro_nx() -> Self {
        Self::kernel_rx().with_no_execute(true)
    }

    /// User read/write, no-execute.
    #[inline]
    #[must_use]
    pub const fn user_rw_nx() -> Self {
        Self::kernel_rw_nx().with_user_access(true)
    }

    /// User read-only, executable.
    #[inline]
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::kernel_rx().with_user_access(true)
    }

    /// Flags for a non-leaf entry above a leaf with `leaf` flags.
    ///
    /// Intermediate levels are always present and writable so that the leaf
    /// alone decides the effective permissions; `US` is propagated because a
    /// supervisor-only level would block user access regardless of the leaf.
    #[inline]
    #[must_use]
    pub const fn table_link(leaf: Self) -> Self {
        Self::kernel_rw().with_user_access(leaf.user_access())
    }
}
