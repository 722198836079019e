//! # Boot Memory Map
//!
//! The boot collaborator describes physical memory as a list of regions. Only
//! [`MemoryRegionKind::Available`] memory is ever handed out by the frame
//! allocator; everything else stays permanently reserved.

use core::fmt;

/// Category of a boot memory region.
///
/// The discriminants match the raw values used by the boot hand-off.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryRegionKind {
    /// Free RAM.
    Available = 1,
    /// Firmware or hardware reserved.
    Reserved = 2,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// Defective memory.
    Bad = 5,
    /// Occupied by the kernel image.
    Kernel = 6,
    /// Boot stack.
    Stack = 7,
    /// Pre-reserved heap backing.
    Heap = 8,
}

impl MemoryRegionKind {
    /// Decodes a raw region type; unknown values yield `None`.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Bad,
            6 => Self::Kernel,
            7 => Self::Stack,
            8 => Self::Heap,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "Available",
            Self::Reserved => "Reserved",
            Self::AcpiReclaimable => "ACPI Reclaimable",
            Self::AcpiNvs => "ACPI NVS",
            Self::Bad => "Bad",
            Self::Kernel => "Kernel",
            Self::Stack => "Stack",
            Self::Heap => "Heap",
        }
    }
}

impl fmt::Display for MemoryRegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical start address (not necessarily page aligned).
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { start, length, kind }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Available)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:016X}-0x{:016X} {:>8} KiB {}",
            self.start,
            self.end(),
            self.length / 1024,
            self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_kind_decoding() {
        assert_eq!(MemoryRegionKind::from_raw(1), Some(MemoryRegionKind::Available));
        assert_eq!(MemoryRegionKind::from_raw(8), Some(MemoryRegionKind::Heap));
        assert_eq!(MemoryRegionKind::from_raw(0), None);
        assert_eq!(MemoryRegionKind::from_raw(9), None);
        assert_eq!(MemoryRegionKind::AcpiNvs as u32, 4);
    }

    #[test]
    fn region_bounds() {
        let r = MemoryRegion::new(0x1000, 0x3000, MemoryRegionKind::Kernel);
        assert_eq!(r.end(), 0x4000);
        assert!(!r.is_available());
        assert!(!r.is_empty());

        let r = MemoryRegion::new(u64::MAX - 1, 16, MemoryRegionKind::Available);
        assert_eq!(r.end(), u64::MAX);
    }

    #[test]
    fn display_names_kind() {
        let r = MemoryRegion::new(0x10_0000, 8 * 1024 * 1024, MemoryRegionKind::Available);
        let s = format!("{r}");
        assert!(s.contains("0x0000000000100000-0x0000000000900000"));
        assert!(s.contains("8192 KiB"));
        assert!(s.ends_with("Available"));
    }
}
