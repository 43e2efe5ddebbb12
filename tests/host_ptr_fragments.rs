use neo_rs::NeoError;
use neo_rs::memory::host_ptr_defines::OverlapStatus;
use neo_rs::memory::{AllocationProperties, AllocationType, HostPtrManager, MemoryManager, OsAgnosticMemoryManager};
use neo_rs::utils::{PAGE_SIZE, align_up};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn properties(size: usize) -> AllocationProperties {
    AllocationProperties::new(0, size, AllocationType::ExternalHostPtr)
}

#[test]
fn range_inside_a_stored_fragment_reuses_it() {
    let mm = OsAgnosticMemoryManager::new();

    let page = mm
        .allocate_graphics_memory_for_host_ptr(&properties(PAGE_SIZE), 0x10_1000 as *const u8)
        .unwrap();
    let slice = mm
        .allocate_graphics_memory_for_host_ptr(&properties(0x100), 0x10_1200 as *const u8)
        .unwrap();

    let fragment = mm.host_ptr_manager().get_fragment(0x10_1000, 0).unwrap();
    assert_eq!(fragment.ref_count, 2);
    assert_eq!(mm.pinned_count(), 1);

    mm.free_graphics_memory(slice);
    assert_eq!(mm.host_ptr_manager().get_fragment(0x10_1000, 0).unwrap().ref_count, 1);
    mm.free_graphics_memory(page);
    assert_eq!(mm.host_ptr_manager().fragment_count(), 0);
    assert_eq!(mm.pinned_count(), 0);
}

#[test]
fn range_containing_a_stored_fragment_reuses_it() {
    let mm = OsAgnosticMemoryManager::new();

    let page = mm
        .allocate_graphics_memory_for_host_ptr(&properties(PAGE_SIZE), 0x10_1000 as *const u8)
        .unwrap();
    let pair = mm
        .allocate_graphics_memory_for_host_ptr(&properties(2 * PAGE_SIZE), 0x10_1000 as *const u8)
        .unwrap();

    assert_eq!(mm.host_ptr_manager().get_fragment(0x10_1000, 0).unwrap().ref_count, 2);
    assert_eq!(mm.host_ptr_manager().get_fragment(0x10_2000, 0).unwrap().ref_count, 1);
    assert_eq!(pair.fragments().fragment_count(), 2);
    assert_eq!(pair.fragments().fragments()[0].os_handle, page.fragments().fragments()[0].os_handle);
    assert_eq!(mm.pinned_count(), 2);

    mm.free_graphics_memory(page);
    assert_eq!(mm.pinned_count(), 2);
    mm.free_graphics_memory(pair);
    assert_eq!(mm.host_ptr_manager().fragment_count(), 0);
    assert_eq!(mm.pinned_count(), 0);
}

#[test]
fn each_root_device_pins_its_own_fragments() {
    let mm = OsAgnosticMemoryManager::new();
    let on_device = |index| AllocationProperties::new(index, 2 * PAGE_SIZE, AllocationType::ExternalHostPtr);

    let first = mm
        .allocate_graphics_memory_for_host_ptr(&on_device(0), 0x40_0000 as *const u8)
        .unwrap();
    let second = mm
        .allocate_graphics_memory_for_host_ptr(&on_device(1), 0x40_0000 as *const u8)
        .unwrap();

    assert_ne!(first.fragments().fragments()[0].os_handle, second.fragments().fragments()[0].os_handle);
    assert_eq!(mm.host_ptr_manager().get_fragment(0x40_0000, 0).unwrap().ref_count, 1);
    assert_eq!(mm.host_ptr_manager().get_fragment(0x40_0000, 1).unwrap().ref_count, 1);
    assert_eq!(mm.pinned_count(), 2);

    mm.free_graphics_memory(second);
    assert!(mm.host_ptr_manager().get_fragment(0x40_0000, 1).is_none());
    assert!(mm.host_ptr_manager().get_fragment(0x40_0000, 0).is_some());
    mm.free_graphics_memory(first);
    assert_eq!(mm.pinned_count(), 0);
}

#[test]
fn partial_overlap_is_refused_without_side_effects() {
    let mm = OsAgnosticMemoryManager::new();
    let first = mm
        .allocate_graphics_memory_for_host_ptr(&properties(2 * PAGE_SIZE), 0x20_0000 as *const u8)
        .unwrap();

    let err = mm
        .allocate_graphics_memory_for_host_ptr(&properties(2 * PAGE_SIZE), 0x20_1000 as *const u8)
        .unwrap_err();
    assert!(matches!(
        err,
        NeoError::FragmentOverlap {
            status: OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment,
            ..
        }
    ));
    assert_eq!(mm.host_ptr_manager().fragment_count(), 1);
    assert_eq!(mm.host_ptr_manager().get_fragment(0x20_0000, 0).unwrap().ref_count, 1);

    mm.free_graphics_memory(first);
    assert_eq!(mm.pinned_count(), 0);
}

#[test]
fn failed_pin_leaves_the_manager_unchanged() {
    let mm = OsAgnosticMemoryManager::new();
    let kept = mm
        .allocate_graphics_memory_for_host_ptr(&properties(PAGE_SIZE), 0x30_0000 as *const u8)
        .unwrap();

    mm.fail_next_populate();
    let result = mm.allocate_graphics_memory_for_host_ptr(&properties(3 * PAGE_SIZE), 0x30_0800 as *const u8);

    assert!(matches!(result, Err(NeoError::OutOfMemory)));
    assert_eq!(mm.host_ptr_manager().fragment_count(), 1);
    assert_eq!(mm.host_ptr_manager().get_fragment(0x30_0000, 0).unwrap().ref_count, 1);
    assert_eq!(mm.pinned_count(), 1);

    mm.free_graphics_memory(kept);
}

proptest! {
    #[test]
    fn requirements_cover_exactly_the_touched_pages(ptr in 1usize..(1 << 32), size in 1usize..(1 << 20)) {
        let requirements = HostPtrManager::get_allocation_requirements(ptr, size);
        let first = requirements.fragments()[0];
        let last = requirements.fragments()[requirements.required_fragments_count - 1];

        prop_assert_eq!(first.ptr, ptr & !(PAGE_SIZE - 1));
        prop_assert_eq!(last.ptr + last.size, align_up(ptr + size, PAGE_SIZE));
        prop_assert_eq!(
            requirements.fragments().iter().map(|f| f.size).sum::<usize>(),
            requirements.total_required_size
        );
        for pair in requirements.fragments().windows(2) {
            prop_assert_eq!(pair[0].ptr + pair[0].size, pair[1].ptr);
        }
    }

    #[test]
    fn page_disjoint_ranges_share_no_fragment_and_release_symmetrically(
        first_page in 1usize..1024,
        first_offset in 0usize..PAGE_SIZE,
        first_size in 1usize..(16 * PAGE_SIZE),
        gap_pages in 0usize..4,
        second_offset in 0usize..PAGE_SIZE,
        second_size in 1usize..(16 * PAGE_SIZE),
        release_first_first in any::<bool>(),
    ) {
        let mm = OsAgnosticMemoryManager::new();
        let first_ptr = first_page * PAGE_SIZE + first_offset;
        let second_ptr = align_up(first_ptr + first_size, PAGE_SIZE) + gap_pages * PAGE_SIZE + second_offset;

        let a = mm.allocate_graphics_memory_for_host_ptr(&properties(first_size), first_ptr as *const u8).unwrap();
        let b = mm.allocate_graphics_memory_for_host_ptr(&properties(second_size), second_ptr as *const u8).unwrap();

        prop_assert_eq!(
            mm.host_ptr_manager().fragment_count(),
            a.fragments().fragment_count() + b.fragments().fragment_count()
        );
        for fragment in a.fragments().fragments() {
            prop_assert!(b.fragments().fragments().iter().all(|other| other.cpu_ptr != fragment.cpu_ptr));
        }

        let (x, y) = if release_first_first { (a, b) } else { (b, a) };
        mm.free_graphics_memory(x);
        mm.free_graphics_memory(y);
        prop_assert_eq!(mm.host_ptr_manager().fragment_count(), 0);
        prop_assert_eq!(mm.pinned_count(), 0);
    }
}
