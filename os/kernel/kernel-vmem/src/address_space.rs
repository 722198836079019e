//! # Address Space (x86-64, PML4-rooted)
//!
//! Typed helpers to build and manipulate a **single** virtual address space.
//!
//! ## Highlights
//!
//! - [`AddressSpace::new`] allocates and zeroes a fresh root.
//! - [`AddressSpace::map_one`] installs one 4 KiB mapping, creating missing
//!   intermediate tables on the way down.
//! - [`AddressSpace::unmap_one`] clears one leaf; missing levels make it a no-op.
//! - [`AddressSpace::query`] translates a VA (large pages included).
//! - [`AddressSpace::destroy`] returns every table frame to the allocator.
//!
//! ## Safety
//!
//! - The address space does no TLB maintenance; callers editing the active
//!   space must invalidate (see [`TlbFlush`](crate::TlbFlush)).
//! - The provided `PhysMapper` must yield **writable** references to table
//!   frames.

use crate::{FrameAlloc, PageEntryBits, PageTable, PhysMapper, TableLevel};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// Parent level and the level of the table its entries point to.
const LINKS: [(TableLevel, TableLevel); 3] = [
    (TableLevel::Pml4, TableLevel::Pdpt),
    (TableLevel::Pdpt, TableLevel::Pd),
    (TableLevel::Pd, TableLevel::Pt),
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a new table at the given level.
    #[error("out of physical frames while creating a {0} table")]
    OutOfFrames(TableLevel),
    /// The walk hit a 2 MiB / 1 GiB leaf this mapper does not split.
    #[error("{0} is covered by a large-page mapping")]
    LargePage(VirtualAddress),
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>, // PML4 frame
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a new PML4.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the root.
    pub fn new<A: FrameAlloc + ?Sized>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc
            .alloc_4k()
            .ok_or(MapError::OutOfFrames(TableLevel::Pml4))?;
        // Safety: freshly allocated, so nobody else references it.
        unsafe { mapper.zero_frame(root) };
        Ok(Self { root, mapper })
    }

    /// Physical frame of the PML4.
    #[inline]
    pub const fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The currently executing code, stack and data must be mapped in this
    /// space. Must run at CPL0 with paging enabled.
    #[cfg(target_arch = "x86_64")]
    #[inline]
    pub unsafe fn activate(&self) {
        let cr3 = self.root.base().as_u64();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        // Safety: every frame reached from `root` is a table owned by this space.
        unsafe { self.mapper.table_mut(frame) }
    }

    /// The PT covering `va`, without creating anything.
    fn leaf_table(&self, va: VirtualAddress) -> Option<&mut PageTable> {
        let mut frame = self.root;
        for (level, _) in LINKS {
            let entry = self.table(frame).get(level.index_of(va));
            if entry.large_page() {
                return None;
            }
            frame = entry.frame()?;
        }
        Some(self.table(frame))
    }

    /// The PT covering `va`, allocating and linking zeroed tables as needed.
    fn ensure_leaf_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        leaf: PageEntryBits,
    ) -> Result<&mut PageTable, MapError> {
        let link = PageEntryBits::table_link(leaf);
        let mut frame = self.root;

        for (level, child) in LINKS {
            let table = self.table(frame);
            let i = level.index_of(va);
            let entry = table.get(i);

            frame = if entry.present() {
                if entry.large_page() {
                    return Err(MapError::LargePage(va));
                }
                if link.user_access() && !entry.user_access() {
                    table.set(i, entry.with_user_access(true));
                }
                PhysicalPage::containing_address(entry.physical_address())
            } else {
                let Some(new) = alloc.alloc_4k() else {
                    log::error!("map {va}: no frame for {child} table");
                    return Err(MapError::OutOfFrames(child));
                };
                // Safety: freshly allocated and not yet linked.
                unsafe { self.mapper.zero_frame(new) };
                table.set(i, link.with_physical_address(new.base()));
                new
            };
        }

        Ok(self.table(frame))
    }

    /// Map one 4 KiB page `page → frame` with `flags`.
    ///
    /// The leaf is always written present, without `PS`. Returns the frame
    /// that was mapped before, if any.
    ///
    /// # Errors
    /// - [`MapError::OutOfFrames`] if an intermediate table cannot be allocated.
    /// - [`MapError::LargePage`] if a large leaf already covers `page`.
    pub fn map_one<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        page: VirtualPage<Size4K>,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<Option<PhysicalPage<Size4K>>, MapError> {
        let va = page.base();
        let pt = self.ensure_leaf_table(alloc, va, flags)?;
        let i = TableLevel::Pt.index_of(va);
        let previous = pt.get(i).frame();

        let leaf = flags
            .flags_only()
            .with_present(true)
            .with_large_page(false)
            .with_physical_address(frame.base());
        pt.set(i, leaf);
        Ok(previous)
    }

    /// Clear the leaf for `page`. Returns the frame it pointed to, or `None`
    /// (and changes nothing) if the page was not mapped.
    ///
    /// Emptied intermediate tables stay linked.
    pub fn unmap_one(&self, page: VirtualPage<Size4K>) -> Option<PhysicalPage<Size4K>> {
        let va = page.base();
        let pt = self.leaf_table(va)?;
        let i = TableLevel::Pt.index_of(va);
        let previous = pt.get(i).frame()?;
        pt.clear(i);
        Some(previous)
    }

    /// The leaf entry mapping `page`, if present.
    #[must_use]
    pub fn leaf_entry(&self, page: VirtualPage<Size4K>) -> Option<PageEntryBits> {
        let va = page.base();
        let entry = self.leaf_table(va)?.get(TableLevel::Pt.index_of(va));
        entry.present().then_some(entry)
    }

    /// Translate `va`, keeping the in-page offset.
    ///
    /// Large leaves found at the PDPT or PD level are honored.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut frame = self.root;
        for level in TableLevel::WALK {
            let entry = self.table(frame).get(level.index_of(va));
            if !entry.present() {
                return None;
            }

            let is_leaf = level == TableLevel::Pt
                || (entry.large_page() && matches!(level, TableLevel::Pdpt | TableLevel::Pd));
            if is_leaf {
                let mask = (1_u64 << level.shift()) - 1;
                let base = entry.physical_address().as_u64() & !mask;
                return Some(PhysicalAddress::new(base | (va.as_u64() & mask)));
            }

            frame = PhysicalPage::containing_address(entry.physical_address());
        }
        None
    }

    /// Return the root and every intermediate table to `alloc`.
    ///
    /// Leaf targets are not owned by the address space and are left alone.
    /// Returns the number of frames freed.
    pub fn destroy<A: FrameAlloc + ?Sized>(self, alloc: &mut A) -> usize {
        let freed = self.free_children(alloc, self.root, TableLevel::Pml4);
        alloc.free_4k(self.root);
        freed + 1
    }

    fn free_children<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        frame: PhysicalPage<Size4K>,
        level: TableLevel,
    ) -> usize {
        // PT entries are leaves.
        let Some(child_level) = level.next() else {
            return 0;
        };

        let mut freed = 0;
        for (_, entry) in self.table(frame).present_entries() {
            if entry.large_page() {
                continue;
            }
            let child = PhysicalPage::containing_address(entry.physical_address());
            freed += self.free_children(alloc, child, child_level);
            alloc.free_4k(child);
            freed += 1;
        }
        freed
    }
}
