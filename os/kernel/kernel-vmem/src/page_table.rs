//! # Page Tables
//!
//! One 4 KiB-aligned [`PageTable`] type serves all four levels; the
//! [`TableLevel`] a table sits at is tracked by the walker, not by the type.

use crate::PageEntryBits;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in every table.
pub const ENTRIES: usize = 512;

/// Position of a table in the four-level tree.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    /// Page Map Level 4, the root referenced by CR3.
    Pml4,
    /// Page Directory Pointer Table.
    Pdpt,
    /// Page Directory.
    Pd,
    /// Page Table; its entries are 4 KiB leaves.
    Pt,
}

impl TableLevel {
    /// Levels from the root down to the leaf table.
    pub const WALK: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Bit position of the lowest VA bit indexing this level.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// The level below, or `None` for [`TableLevel::Pt`].
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Index into a table of this level for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index into a page table, `0..512`.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// 512 entries, 4 KiB-aligned; occupies exactly one frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// A table with every entry non-present.
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES],
        }
    }

    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    /// Caller handles TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn clear(&mut self, i: TableIndex) {
        self.set(i, PageEntryBits::new());
    }

    /// `true` if no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// Present entries with their index.
    pub fn present_entries(&self) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present())
            .map(|(i, e)| {
                #[allow(clippy::cast_possible_truncation)]
                let i = TableIndex::new(i as u16);
                (i, *e)
            })
    }
}
