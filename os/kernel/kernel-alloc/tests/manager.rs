mod common;

use common::{Arena, MIB, SimPhys, layout_for, regions};
use kernel_alloc::frame_alloc::FrameAllocError;
use kernel_alloc::{BitmapFrameAlloc, LockedHeap, MemoryInitError, MemoryManager, VmmError};
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_info::memory::{KernelLayout, LayoutError};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{NoFlush, PageEntryBits};
use std::collections::HashSet;

fn bitmap_for(regions: &[MemoryRegion]) -> Vec<u64> {
    vec![0; BitmapFrameAlloc::<SimPhys>::words_needed(regions)]
}

#[test]
fn bring_up_maps_windows_and_heap() {
    let phys = SimPhys::new();
    let arena = Arena::new(256 * 1024);
    let layout = layout_for(&arena);
    let heap = LockedHeap::empty();
    let regions = regions();
    let mut bitmap = bitmap_for(&regions);

    let mm = MemoryManager::new(&phys, NoFlush, &regions, &mut bitmap, layout, &heap).unwrap();

    // Identity and high windows both reach physical 0x1234.
    let low = VirtualAddress::new(0x1234);
    let high = layout.kernel_base + 0x1234;
    assert_eq!(mm.translate(low), Some(PhysicalAddress::new(0x1234)));
    assert_eq!(mm.translate(high), Some(PhysicalAddress::new(0x1234)));
    assert_eq!(mm.translate(VirtualAddress::new(2 * MIB)), None);

    // Every heap page is backed by a distinct allocated frame.
    let mut backing = HashSet::new();
    for page in 0..64 {
        let va = layout.heap_base + page * 4096;
        let pa = mm.translate(va).unwrap();
        assert!(mm.frames().lock().is_allocated(pa));
        assert!(backing.insert(pa));
    }

    unsafe { mm.init_heap() }.unwrap();
    let stats = mm.stats();
    assert_eq!(stats.heap.total, 256 * 1024);
    assert_eq!(stats.heap.used, 0);
    assert_eq!(stats.frames.total_pages, 2048);

    let frames = unsafe { mm.teardown() };
    assert_eq!(frames.free_pages(), frames.total_pages());
}

#[test]
fn map_protect_and_anonymous_ranges() {
    let phys = SimPhys::new();
    let arena = Arena::new(4096);
    let layout = layout_for(&arena);
    let heap = LockedHeap::empty();
    let regions = regions();
    let mut bitmap = bitmap_for(&regions);
    let mm = MemoryManager::new(&phys, NoFlush, &regions, &mut bitmap, layout, &heap).unwrap();

    let va = VirtualAddress::new(0x0000_7000_0000_0000);
    let frame = mm.alloc_frame().unwrap();
    mm.map(va, frame.base(), PageEntryBits::user_rw_nx()).unwrap();
    assert_eq!(mm.translate(va + 0x123), Some(frame.base() + 0x123));

    let changed = mm.protect(va, 4096, PageEntryBits::user_rx()).unwrap();
    assert_eq!(changed, 1);
    assert_eq!(
        mm.vmm().lock().leaf_flags(va),
        Some(PageEntryBits::user_rx())
    );
    assert_eq!(mm.translate(va), Some(frame.base()));
    assert_eq!(mm.unmap(va), Some(frame.base()));
    mm.free_frame(frame.base());

    let anon = VirtualAddress::new(0x0000_7000_1000_0000);
    let before = mm.stats().frames.free_pages;
    mm.map_anon(anon, 8 * 4096, PageEntryBits::kernel_rw_nx()).unwrap();
    let pa = mm.translate(anon + 4096).unwrap();
    assert_eq!(phys.read_u64(pa), 0);
    assert_eq!(mm.unmap_anon(anon, 8 * 4096), 8);
    // The page tables for the new range stay.
    assert!(before - mm.stats().frames.free_pages <= 3);

    assert_eq!(
        mm.map_anon(VirtualAddress::new(0x1001), 4096, PageEntryBits::kernel_rw()),
        Err(VmmError::Unaligned(0x1001))
    );

    drop(unsafe { mm.teardown() });
}

#[test]
fn invalid_layout_is_rejected() {
    let phys = SimPhys::new();
    let arena = Arena::new(4096);
    let layout = KernelLayout {
        kernel_base: VirtualAddress::new(0xffff_ffff_8000_0800),
        ..layout_for(&arena)
    };
    let heap = LockedHeap::empty();
    let regions = regions();
    let mut bitmap = bitmap_for(&regions);

    let err =
        MemoryManager::new(&phys, NoFlush, &regions, &mut bitmap, layout, &heap).unwrap_err();
    assert_eq!(err, MemoryInitError::Layout(LayoutError::Unaligned));
}

#[test]
fn empty_memory_map_is_rejected() {
    let phys = SimPhys::new();
    let arena = Arena::new(4096);
    let heap = LockedHeap::empty();
    let regions = [MemoryRegion::new(0, MIB, MemoryRegionKind::Reserved)];
    let mut bitmap = vec![0; 64];

    let err = MemoryManager::new(
        &phys,
        NoFlush,
        &regions,
        &mut bitmap,
        layout_for(&arena),
        &heap,
    )
    .unwrap_err();
    assert_eq!(err, MemoryInitError::Frames(FrameAllocError::NoAvailableMemory));
    assert_eq!(
        err.to_string(),
        format!("frame allocator: {}", FrameAllocError::NoAvailableMemory)
    );
}

#[test]
fn concurrent_frame_allocation_hands_out_unique_frames() {
    let phys = SimPhys::new();
    let arena = Arena::new(4096);
    let layout = layout_for(&arena);
    let heap = LockedHeap::empty();
    let regions = regions();
    let mut bitmap = bitmap_for(&regions);
    let mm = MemoryManager::new(&phys, NoFlush, &regions, &mut bitmap, layout, &heap).unwrap();
    let free_before = mm.stats().frames.free_pages;

    let per_thread = 100;
    let taken: Vec<Vec<PhysicalAddress>> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    (0..per_thread)
                        .map(|_| mm.alloc_frame().unwrap().base())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let unique: HashSet<_> = taken.iter().flatten().copied().collect();
    assert_eq!(unique.len(), 4 * per_thread);
    assert_eq!(mm.stats().frames.free_pages, free_before - 400);

    std::thread::scope(|s| {
        let mm = &mm;
        for batch in &taken {
            s.spawn(move || batch.iter().for_each(|&pa| mm.free_frame(pa)));
        }
    });
    assert_eq!(mm.stats().frames.free_pages, free_before);
    let frames = unsafe { mm.teardown() };
    assert_eq!(frames.count_free_bits(), frames.free_pages());
}
