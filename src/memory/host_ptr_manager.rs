//! Tracks which page-aligned slices of host memory are pinned for GPU access.
//!
//! Fragments are keyed by root device and start address. Requests are split
//! into at most three fragments (see
//! [`HostPtrManager::get_allocation_requirements`]); each one reuses a stored
//! fragment that covers it, is split around stored fragments it fully
//! contains, or is pinned fresh through the memory manager. A request that
//! partially overlaps a stored fragment is rejected, so a page is never
//! pinned twice.

use crate::error::{NeoError, NeoResult};
use crate::memory::host_ptr_defines::{
    AllocationFragment, AllocationRequirements, FragmentPosition, FragmentStorage,
    FragmentStorageData, OsHandleStorage, OverlapStatus, RequirementsStatus,
};
use crate::memory::memory_manager::MemoryManager;
use crate::utils::{PAGE_SIZE, align_down, align_up};
use std::collections::BTreeMap;
use std::ops::Bound::Excluded;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// `(root_device_index, fragment start)`.
type FragmentKey = (u32, usize);
type FragmentMap = BTreeMap<FragmentKey, FragmentStorage>;

#[derive(Debug, Default)]
pub struct HostPtrManager {
    fragments: Mutex<FragmentMap>,
}

/// Exclusive access to the fragment map.
///
/// Every manager operation is also available here, so code that already
/// holds the guard never locks again.
#[derive(Debug)]
pub struct HostPtrManagerGuard<'a> {
    map: MutexGuard<'a, FragmentMap>,
}

impl HostPtrManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the fragment map for the lifetime of the returned guard.
    pub fn obtain_ownership(&self) -> HostPtrManagerGuard<'_> {
        HostPtrManagerGuard {
            map: self.fragments.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Splits `[ptr, ptr + size)` into page-aligned fragments.
    #[must_use]
    pub fn get_allocation_requirements(ptr: usize, size: usize) -> AllocationRequirements {
        let end = ptr + size;
        let aligned_start = align_down(ptr, PAGE_SIZE);
        let aligned_end = align_up(end, PAGE_SIZE);
        let whole_pages_end = align_down(end, PAGE_SIZE);

        let mut requirements = AllocationRequirements {
            total_required_size: aligned_end - aligned_start,
            ..AllocationRequirements::default()
        };
        let mut push = |position, ptr, size| {
            requirements.allocation_fragments[requirements.required_fragments_count] =
                AllocationFragment { position, ptr, size };
            requirements.required_fragments_count += 1;
        };

        let mut middle_start = aligned_start;
        if ptr != aligned_start {
            push(FragmentPosition::Leading, aligned_start, PAGE_SIZE);
            middle_start += PAGE_SIZE;
        }
        if whole_pages_end > middle_start {
            push(FragmentPosition::Middle, middle_start, whole_pages_end - middle_start);
        }
        if end != whole_pages_end && whole_pages_end >= middle_start {
            push(FragmentPosition::Trailing, whole_pages_end, PAGE_SIZE);
        }

        requirements
    }

    #[must_use]
    pub fn get_fragment(&self, ptr: usize, root_device_index: u32) -> Option<FragmentStorage> {
        self.obtain_ownership().get_fragment(ptr, root_device_index)
    }

    #[must_use]
    pub fn get_fragment_containing(&self, ptr: usize, root_device_index: u32) -> Option<FragmentStorage> {
        self.obtain_ownership().get_fragment_containing(ptr, root_device_index)
    }

    #[must_use]
    pub fn get_fragment_and_check_for_overlaps(
        &self,
        ptr: usize,
        size: usize,
        root_device_index: u32,
    ) -> (Option<FragmentStorage>, OverlapStatus) {
        self.obtain_ownership()
            .get_fragment_and_check_for_overlaps(ptr, size, root_device_index)
    }

    #[must_use]
    pub fn check_allocations_for_overlapping(
        &self,
        requirements: &AllocationRequirements,
        root_device_index: u32,
    ) -> RequirementsStatus {
        self.obtain_ownership()
            .check_allocations_for_overlapping(requirements, root_device_index)
    }

    pub fn store_fragment(&self, fragment: FragmentStorage, root_device_index: u32) {
        self.obtain_ownership().store_fragment(fragment, root_device_index);
    }

    pub fn store_fragment_data(&self, data: &FragmentStorageData, root_device_index: u32) {
        self.obtain_ownership().store_fragment_data(data, root_device_index);
    }

    /// See [`HostPtrManagerGuard::prepare_os_storage_for_allocation`].
    ///
    /// # Errors
    /// Returns `FragmentOverlap` on partial overlap, or the memory manager's
    /// error if pinning fails.
    pub fn prepare_os_storage_for_allocation<M: MemoryManager + ?Sized>(
        &self,
        memory_manager: &M,
        size: usize,
        ptr: usize,
        root_device_index: u32,
    ) -> NeoResult<OsHandleStorage> {
        self.obtain_ownership()
            .prepare_os_storage_for_allocation(memory_manager, size, ptr, root_device_index)
    }

    pub fn release_host_ptr<M: MemoryManager + ?Sized>(
        &self,
        memory_manager: &M,
        ptr: usize,
        root_device_index: u32,
    ) -> bool {
        self.obtain_ownership()
            .release_host_ptr(memory_manager, ptr, root_device_index)
    }

    pub fn release_handle_storage<M: MemoryManager + ?Sized>(
        &self,
        memory_manager: &M,
        storage: &mut OsHandleStorage,
        root_device_index: u32,
    ) {
        self.obtain_ownership()
            .release_handle_storage(memory_manager, storage, root_device_index);
    }

    /// Number of stored fragments across all root devices.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.obtain_ownership().fragment_count()
    }
}

impl HostPtrManagerGuard<'_> {
    // ===========================================================================================
    // Lookup
    // ===========================================================================================

    /// The fragment starting exactly at `ptr`.
    #[must_use]
    pub fn get_fragment(&self, ptr: usize, root_device_index: u32) -> Option<FragmentStorage> {
        self.map.get(&(root_device_index, ptr)).copied()
    }

    /// The stored fragment starting at or below `ptr`.
    fn predecessor(&self, ptr: usize, root_device_index: u32) -> Option<&FragmentStorage> {
        self.map
            .range((root_device_index, 0)..=(root_device_index, ptr))
            .next_back()
            .map(|(_, fragment)| fragment)
    }

    /// The fragment whose range contains `ptr`. Zero-sized fragments only
    /// match their own start.
    #[must_use]
    pub fn get_fragment_containing(&self, ptr: usize, root_device_index: u32) -> Option<FragmentStorage> {
        let fragment = self.predecessor(ptr, root_device_index)?;
        (fragment.fragment_cpu_pointer == ptr || ptr < fragment.end()).then_some(*fragment)
    }

    #[must_use]
    pub fn get_fragment_and_check_for_overlaps(
        &self,
        ptr: usize,
        size: usize,
        root_device_index: u32,
    ) -> (Option<FragmentStorage>, OverlapStatus) {
        let end = ptr + size;

        if let Some(fragment) = self.predecessor(ptr, root_device_index) {
            let start = fragment.fragment_cpu_pointer;
            if start == ptr && fragment.fragment_size == size {
                return (Some(*fragment), OverlapStatus::FragmentWithExactSizeAsStoredFragment);
            }
            if end <= fragment.end() && (ptr < fragment.end() || start == ptr) {
                return (Some(*fragment), OverlapStatus::FragmentWithinStoredFragment);
            }
            if ptr < fragment.end() {
                return (None, OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment);
            }
        }

        let successors = (Excluded((root_device_index, ptr)), Excluded((root_device_index, end)));
        if size > 0 && self.map.range(successors).next().is_some() {
            return (None, OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment);
        }

        (None, OverlapStatus::FragmentNotOverlappingWithAnyOther)
    }

    /// The stored fragments lying entirely inside `[ptr, ptr + size)`, in
    /// address order, or `None` if any stored fragment straddles either end.
    fn stored_fragments_within(&self, ptr: usize, size: usize, root_device_index: u32) -> Option<Vec<FragmentStorage>> {
        let end = ptr + size;

        if let Some((_, before)) = self
            .map
            .range((root_device_index, 0)..(root_device_index, ptr))
            .next_back()
            && before.end() > ptr
        {
            return None;
        }

        let mut inside = Vec::new();
        for fragment in self
            .map
            .range((root_device_index, ptr)..(root_device_index, end))
            .map(|(_, fragment)| fragment)
        {
            if fragment.end() > end {
                return None;
            }
            if fragment.fragment_size > 0 {
                inside.push(*fragment);
            }
        }
        Some(inside)
    }

    /// `Fatal` if any required fragment straddles the edge of a stored one.
    /// Stored fragments that a required fragment covers or fully contains
    /// are reusable and do not count.
    #[must_use]
    pub fn check_allocations_for_overlapping(
        &self,
        requirements: &AllocationRequirements,
        root_device_index: u32,
    ) -> RequirementsStatus {
        let overlapping = requirements.fragments().iter().any(|f| {
            let (_, status) = self.get_fragment_and_check_for_overlaps(f.ptr, f.size, root_device_index);
            status == OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment
                && self.stored_fragments_within(f.ptr, f.size, root_device_index).is_none()
        });
        if overlapping {
            RequirementsStatus::Fatal
        } else {
            RequirementsStatus::Success
        }
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.map.len()
    }

    // ===========================================================================================
    // Store & Release
    // ===========================================================================================

    /// Inserts `fragment`, or bumps the reference count of the fragment
    /// already stored at the same address on the same root device.
    pub fn store_fragment(&mut self, fragment: FragmentStorage, root_device_index: u32) {
        self.map
            .entry((root_device_index, fragment.fragment_cpu_pointer))
            .and_modify(|existing| existing.ref_count += 1)
            .or_insert(fragment);
    }

    pub fn store_fragment_data(&mut self, data: &FragmentStorageData, root_device_index: u32) {
        self.store_fragment(
            FragmentStorage {
                fragment_cpu_pointer: data.cpu_ptr,
                fragment_size: data.fragment_size,
                os_internal_storage: data.os_handle,
                ref_count: 1,
            },
            root_device_index,
        );
    }

    /// Drops one reference to the fragment at `ptr`; returns it once the
    /// last reference is gone and it has been removed from the map.
    pub fn release_fragment(&mut self, ptr: usize, root_device_index: u32) -> Option<FragmentStorage> {
        let key = (root_device_index, ptr);
        let Some(fragment) = self.map.get_mut(&key) else {
            warn!(
                ptr = format_args!("0x{ptr:x}"),
                root_device_index, "releasing unknown host pointer fragment"
            );
            return None;
        };

        fragment.ref_count = fragment.ref_count.saturating_sub(1);
        if fragment.ref_count == 0 {
            return self.map.remove(&key);
        }
        None
    }

    /// Drops one reference to the fragment at `ptr` and unpins it when it
    /// was the last. Returns whether the fragment was removed.
    pub fn release_host_ptr<M: MemoryManager + ?Sized>(
        &mut self,
        memory_manager: &M,
        ptr: usize,
        root_device_index: u32,
    ) -> bool {
        let Some(removed) = self.release_fragment(ptr, root_device_index) else {
            return false;
        };

        let mut storage = OsHandleStorage::single(FragmentStorageData {
            cpu_ptr: removed.fragment_cpu_pointer,
            fragment_size: removed.fragment_size,
            os_handle: removed.os_internal_storage,
            fresh_allocation: false,
            free_the_fragment: true,
        });
        memory_manager.clean_os_handles(&mut storage, root_device_index);
        trace!(ptr = format_args!("0x{ptr:x}"), "host pointer fragment unpinned");
        true
    }

    /// Releases every fragment of `storage`; those whose last reference
    /// goes away are unpinned together.
    pub fn release_handle_storage<M: MemoryManager + ?Sized>(
        &mut self,
        memory_manager: &M,
        storage: &mut OsHandleStorage,
        root_device_index: u32,
    ) {
        let mut any_freed = false;
        for data in storage.fragments_mut() {
            data.free_the_fragment = false;
            if let Some(removed) = self.release_fragment(data.cpu_ptr, root_device_index) {
                data.os_handle = removed.os_internal_storage;
                data.free_the_fragment = true;
                any_freed = true;
            }
        }

        if any_freed {
            memory_manager.clean_os_handles(storage, root_device_index);
        }
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Produces the fragments backing `[ptr, ptr + size)`.
    ///
    /// Required fragments already covered by a stored fragment reuse it
    /// (its reference count goes up and the returned entry names the stored
    /// fragment). A required fragment that fully contains stored fragments
    /// reuses those and pins only the gaps between them. Everything else is
    /// pinned through [`MemoryManager::populate_os_handles`] and stored with
    /// one reference.
    ///
    /// # Errors
    /// Returns `FragmentOverlap` if a required fragment partially overlaps a
    /// stored one. If pinning fails, the reference counts taken by this call
    /// are dropped again and the memory manager's error is returned.
    pub fn prepare_os_storage_for_allocation<M: MemoryManager + ?Sized>(
        &mut self,
        memory_manager: &M,
        size: usize,
        ptr: usize,
        root_device_index: u32,
    ) -> NeoResult<OsHandleStorage> {
        let requirements = HostPtrManager::get_allocation_requirements(ptr, size);
        let mut storage = OsHandleStorage::default();

        for fragment in requirements.fragments() {
            let (stored, status) =
                self.get_fragment_and_check_for_overlaps(fragment.ptr, fragment.size, root_device_index);
            match (stored, status) {
                (Some(stored), _) => storage.push(reused(&stored)),
                (None, OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment) => {
                    let Some(inside) = self.stored_fragments_within(fragment.ptr, fragment.size, root_device_index)
                    else {
                        warn!(
                            ptr = format_args!("0x{:x}", fragment.ptr),
                            size = fragment.size,
                            "host pointer partially overlaps a stored fragment"
                        );
                        return Err(NeoError::FragmentOverlap {
                            ptr: fragment.ptr,
                            size: fragment.size,
                            status,
                        });
                    };

                    let end = fragment.ptr + fragment.size;
                    let mut cursor = fragment.ptr;
                    for stored in &inside {
                        if stored.fragment_cpu_pointer > cursor {
                            storage.push(fresh(cursor, stored.fragment_cpu_pointer - cursor));
                        }
                        storage.push(reused(stored));
                        cursor = stored.end();
                    }
                    if cursor < end {
                        storage.push(fresh(cursor, end - cursor));
                    }
                }
                (None, _) => storage.push(fresh(fragment.ptr, fragment.size)),
            }
        }

        for data in storage.fragments().iter().filter(|d| !d.fresh_allocation) {
            let key = (root_device_index, data.cpu_ptr);
            if let Some(existing) = self.map.get_mut(&key) {
                existing.ref_count += 1;
            }
        }

        if let Err(e) = memory_manager.populate_os_handles(&mut storage, root_device_index) {
            warn!("pinning host pointer 0x{ptr:x} (+0x{size:x}) failed: {e}");
            for data in storage.fragments().iter().filter(|d| !d.fresh_allocation) {
                self.release_fragment(data.cpu_ptr, root_device_index);
            }
            return Err(e);
        }

        for data in storage.fragments().iter().filter(|d| d.fresh_allocation) {
            self.store_fragment_data(data, root_device_index);
        }

        debug!(
            ptr = format_args!("0x{ptr:x}"),
            size,
            root_device_index,
            fragments = storage.fragment_count(),
            "host pointer storage prepared"
        );
        Ok(storage)
    }
}

fn reused(stored: &FragmentStorage) -> FragmentStorageData {
    FragmentStorageData {
        cpu_ptr: stored.fragment_cpu_pointer,
        fragment_size: stored.fragment_size,
        os_handle: stored.os_internal_storage,
        fresh_allocation: false,
        free_the_fragment: false,
    }
}

fn fresh(ptr: usize, size: usize) -> FragmentStorageData {
    FragmentStorageData {
        cpu_ptr: ptr,
        fragment_size: size,
        os_handle: None,
        fresh_allocation: true,
        free_the_fragment: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::os_agnostic::OsAgnosticMemoryManager;
    use crate::os::OsHandle;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn fragment(ptr: usize, size: usize) -> FragmentStorage {
        FragmentStorage {
            fragment_cpu_pointer: ptr,
            fragment_size: size,
            os_internal_storage: None,
            ref_count: 1,
        }
    }

    #[test]
    fn unaligned_pointer_needs_three_fragments() {
        let requirements = HostPtrManager::get_allocation_requirements(0x1045, 10 * PAGE_SIZE - 1);

        assert_eq!(requirements.total_required_size, 11 * PAGE_SIZE);
        assert_eq!(
            requirements.fragments(),
            &[
                AllocationFragment {
                    position: FragmentPosition::Leading,
                    ptr: 0x1000,
                    size: PAGE_SIZE
                },
                AllocationFragment {
                    position: FragmentPosition::Middle,
                    ptr: 0x2000,
                    size: 9 * PAGE_SIZE
                },
                AllocationFragment {
                    position: FragmentPosition::Trailing,
                    ptr: 0xB000,
                    size: PAGE_SIZE
                },
            ]
        );
    }

    #[test]
    fn aligned_pointer_requirements() {
        let whole = HostPtrManager::get_allocation_requirements(0x4000, 2 * PAGE_SIZE);
        assert_eq!(whole.required_fragments_count, 1);
        assert_eq!(whole.fragments()[0].position, FragmentPosition::Middle);

        let partial = HostPtrManager::get_allocation_requirements(0x4000, 2 * PAGE_SIZE + 1);
        assert_eq!(partial.required_fragments_count, 2);
        assert_eq!(partial.fragments()[1].position, FragmentPosition::Trailing);
        assert_eq!(partial.fragments()[1].ptr, 0x6000);
        assert_eq!(partial.total_required_size, 3 * PAGE_SIZE);
    }

    #[test]
    fn small_unaligned_ranges() {
        let inside_one_page = HostPtrManager::get_allocation_requirements(0x1045, 0x10);
        assert_eq!(inside_one_page.required_fragments_count, 1);
        assert_eq!(inside_one_page.fragments()[0].position, FragmentPosition::Leading);

        let straddling = HostPtrManager::get_allocation_requirements(0x1FF0, 0x20);
        assert_eq!(
            straddling
                .fragments()
                .iter()
                .map(|f| (f.position, f.ptr))
                .collect::<Vec<_>>(),
            vec![
                (FragmentPosition::Leading, 0x1000),
                (FragmentPosition::Trailing, 0x2000)
            ]
        );
    }

    #[test]
    fn overlap_classification() {
        let manager = HostPtrManager::new();
        manager.store_fragment(fragment(0x3000, PAGE_SIZE), 0);
        manager.store_fragment(fragment(0x6000, 2 * PAGE_SIZE), 0);

        let status = |ptr, size| manager.get_fragment_and_check_for_overlaps(ptr, size, 0).1;

        assert_eq!(status(0x3000, PAGE_SIZE), OverlapStatus::FragmentWithExactSizeAsStoredFragment);
        assert_eq!(status(0x3000, 0x10), OverlapStatus::FragmentWithinStoredFragment);
        assert_eq!(status(0x7000, PAGE_SIZE), OverlapStatus::FragmentWithinStoredFragment);
        assert_eq!(status(0x4000, PAGE_SIZE), OverlapStatus::FragmentNotOverlappingWithAnyOther);
        assert_eq!(
            status(0x4000, PAGE_SIZE + 1),
            OverlapStatus::FragmentNotOverlappingWithAnyOther
        );
        assert_eq!(
            status(0x3000, PAGE_SIZE + 1),
            OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment
        );
        assert_eq!(
            status(0x5000, 2 * PAGE_SIZE),
            OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment
        );
        assert_eq!(
            status(0x2000, PAGE_SIZE + 1),
            OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment
        );
        assert_eq!(
            status(0x3800, PAGE_SIZE),
            OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment
        );
    }

    #[test]
    fn next_to_page_is_not_overlapping_but_one_byte_more_is() {
        let manager = HostPtrManager::new();
        manager.store_fragment(fragment(0x4000, PAGE_SIZE), 0);

        assert_eq!(
            manager.get_fragment_and_check_for_overlaps(0x3000, PAGE_SIZE, 0).1,
            OverlapStatus::FragmentNotOverlappingWithAnyOther
        );
        assert_eq!(
            manager.get_fragment_and_check_for_overlaps(0x3000, PAGE_SIZE + 1, 0).1,
            OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment
        );

        let requirements = HostPtrManager::get_allocation_requirements(0x3000, PAGE_SIZE + 1);
        assert_eq!(
            manager.check_allocations_for_overlapping(&requirements, 0),
            RequirementsStatus::Success,
            "page-granular fragments reuse the stored page"
        );
        let requirements = HostPtrManager::get_allocation_requirements(0x3000, 3 * PAGE_SIZE);
        assert_eq!(
            manager.check_allocations_for_overlapping(&requirements, 0),
            RequirementsStatus::Success,
            "a stored page inside the request is reused"
        );
    }

    #[test]
    fn straddling_a_stored_fragment_is_fatal() {
        let manager = HostPtrManager::new();
        manager.store_fragment(fragment(0x4000, 2 * PAGE_SIZE), 0);

        let straddling = HostPtrManager::get_allocation_requirements(0x5000, 2 * PAGE_SIZE);
        assert_eq!(manager.check_allocations_for_overlapping(&straddling, 0), RequirementsStatus::Fatal);
        let below = HostPtrManager::get_allocation_requirements(0x3000, 2 * PAGE_SIZE);
        assert_eq!(manager.check_allocations_for_overlapping(&below, 0), RequirementsStatus::Fatal);
        assert_eq!(
            manager.check_allocations_for_overlapping(&straddling, 1),
            RequirementsStatus::Success,
            "fragments of another root device never overlap"
        );
    }

    #[test]
    fn lookups_by_start_and_by_containment() {
        let manager = HostPtrManager::new();
        manager.store_fragment(fragment(0x2000, 2 * PAGE_SIZE), 0);
        manager.store_fragment(fragment(0x9000, 0), 0);

        assert!(manager.get_fragment(0x2000, 0).is_some());
        assert!(manager.get_fragment(0x3000, 0).is_none());
        assert_eq!(manager.get_fragment_containing(0x3FFF, 0).map(|f| f.fragment_cpu_pointer), Some(0x2000));
        assert!(manager.get_fragment_containing(0x4000, 0).is_none());
        assert!(manager.get_fragment_containing(0x1FFF, 0).is_none());
        assert!(manager.get_fragment_containing(0x9000, 0).is_some());
        assert!(manager.get_fragment_containing(0x9001, 0).is_none());
    }

    #[test]
    fn storing_the_same_key_merges() {
        let manager = HostPtrManager::new();
        manager.store_fragment(fragment(0x1000, PAGE_SIZE), 0);
        manager.store_fragment(fragment(0x1000, PAGE_SIZE), 0);
        manager.store_fragment_data(
            &FragmentStorageData {
                cpu_ptr: 0x1000,
                fragment_size: PAGE_SIZE,
                ..FragmentStorageData::default()
            },
            0,
        );

        assert_eq!(manager.fragment_count(), 1);
        assert_eq!(manager.get_fragment(0x1000, 0).unwrap().ref_count, 3);
    }

    #[test]
    fn release_symmetry() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();
        let n = 4;
        for _ in 0..n {
            manager.store_fragment(fragment(0x8000, PAGE_SIZE), 0);
        }

        for _ in 0..n - 1 {
            assert!(!manager.release_host_ptr(&mm, 0x8000, 0));
        }
        assert_eq!(manager.get_fragment(0x8000, 0).unwrap().ref_count, 1);

        assert!(manager.release_host_ptr(&mm, 0x8000, 0));
        assert!(manager.get_fragment(0x8000, 0).is_none());
        assert!(!manager.release_host_ptr(&mm, 0x8000, 0));
    }

    #[test]
    fn prepared_storage_pins_each_fresh_fragment_once() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();

        let storage = manager
            .prepare_os_storage_for_allocation(&mm, 10 * PAGE_SIZE - 1, 0x1045, 0)
            .unwrap();
        assert_eq!(storage.fragment_count(), 3);
        assert!(storage.fragments().iter().all(|d| d.fresh_allocation && d.os_handle.is_some()));
        assert_eq!(manager.fragment_count(), 3);
        assert_eq!(mm.pinned_count(), 3);
    }

    #[test]
    fn covering_fragment_is_reused() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();

        let first = manager
            .prepare_os_storage_for_allocation(&mm, 4 * PAGE_SIZE, 0x10000, 0)
            .unwrap();
        let second = manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x11000, 0)
            .unwrap();

        assert_eq!(mm.pinned_count(), 1);
        assert_eq!(second.fragment_count(), 1);
        assert!(!second.fragments()[0].fresh_allocation);
        assert_eq!(second.fragments()[0].cpu_ptr, 0x10000);
        assert_eq!(second.fragments()[0].os_handle, first.fragments()[0].os_handle);
        assert_eq!(manager.get_fragment(0x10000, 0).unwrap().ref_count, 2);
    }

    #[test]
    fn partial_overlap_is_reported() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();
        manager
            .prepare_os_storage_for_allocation(&mm, 2 * PAGE_SIZE, 0x4000, 0)
            .unwrap();

        let err = manager
            .prepare_os_storage_for_allocation(&mm, 2 * PAGE_SIZE, 0x5000, 0)
            .unwrap_err();
        match err {
            NeoError::FragmentOverlap { status, .. } => {
                assert_eq!(status, OverlapStatus::FragmentOverlappingAndBiggerThenStoredFragment);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(manager.get_fragment(0x4000, 0).unwrap().ref_count, 1);
        assert_eq!(mm.pinned_count(), 1);
    }

    #[test]
    fn failed_pin_rolls_back_reused_references() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();
        manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x20000, 0)
            .unwrap();

        mm.fail_next_populate();
        let result = manager.prepare_os_storage_for_allocation(&mm, PAGE_SIZE + 0x10, 0x20000, 0);

        assert!(result.is_err());
        assert_eq!(manager.get_fragment(0x20000, 0).unwrap().ref_count, 1);
        assert!(manager.get_fragment(0x21000, 0).is_none());
        assert_eq!(manager.fragment_count(), 1);
    }

    #[test]
    fn release_handle_storage_unpins_only_last_references() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();

        let mut a = manager
            .prepare_os_storage_for_allocation(&mm, 2 * PAGE_SIZE, 0x40000, 0)
            .unwrap();
        let mut b = manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x40000, 0)
            .unwrap();
        assert_eq!(mm.pinned_count(), 1);

        manager.release_handle_storage(&mm, &mut a, 0);
        assert!(!a.fragments()[0].free_the_fragment);
        assert_eq!(mm.pinned_count(), 1);

        manager.release_handle_storage(&mm, &mut b, 0);
        assert!(b.fragments()[0].free_the_fragment);
        assert_eq!(mm.pinned_count(), 0);
        assert_eq!(manager.fragment_count(), 0);
    }

    #[test]
    fn guard_allows_nested_operations_without_relocking() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();

        let mut guard = manager.obtain_ownership();
        let storage = guard
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x50000, 0)
            .unwrap();
        assert!(matches!(storage.fragments()[0].os_handle, Some(OsHandle::Simulated { .. })));
        assert!(guard.get_fragment(0x50000, 0).is_some());
        assert!(guard.release_host_ptr(&mm, 0x50000, 0));
        drop(guard);

        assert_eq!(manager.fragment_count(), 0);
    }

    #[test]
    fn contained_fragments_are_reused_and_gaps_pinned() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();
        let first = manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x10_1000, 0)
            .unwrap();
        let third = manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x10_3000, 0)
            .unwrap();

        let mut covering = manager
            .prepare_os_storage_for_allocation(&mm, 4 * PAGE_SIZE, 0x10_1000, 0)
            .unwrap();

        assert_eq!(
            covering
                .fragments()
                .iter()
                .map(|d| (d.cpu_ptr, d.fragment_size, d.fresh_allocation))
                .collect::<Vec<_>>(),
            vec![
                (0x10_1000, PAGE_SIZE, false),
                (0x10_2000, PAGE_SIZE, true),
                (0x10_3000, PAGE_SIZE, false),
                (0x10_4000, PAGE_SIZE, true),
            ]
        );
        assert_eq!(covering.fragments()[0].os_handle, first.fragments()[0].os_handle);
        assert_eq!(covering.fragments()[2].os_handle, third.fragments()[0].os_handle);
        assert_eq!(manager.get_fragment(0x10_1000, 0).unwrap().ref_count, 2);
        assert_eq!(manager.get_fragment(0x10_3000, 0).unwrap().ref_count, 2);
        assert_eq!(mm.pinned_count(), 4);

        manager.release_handle_storage(&mm, &mut covering, 0);
        assert_eq!(manager.fragment_count(), 2);
        assert_eq!(manager.get_fragment(0x10_1000, 0).unwrap().ref_count, 1);
        assert_eq!(mm.pinned_count(), 2);
    }

    #[test]
    fn failed_pin_rolls_back_contained_references() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();
        manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x11_1000, 0)
            .unwrap();

        mm.fail_next_populate();
        let result = manager.prepare_os_storage_for_allocation(&mm, 3 * PAGE_SIZE, 0x11_0000, 0);

        assert!(result.is_err());
        assert_eq!(manager.get_fragment(0x11_1000, 0).unwrap().ref_count, 1);
        assert_eq!(manager.fragment_count(), 1);
        assert_eq!(mm.pinned_count(), 1);
    }

    #[test]
    fn root_devices_keep_separate_fragments() {
        let mm = OsAgnosticMemoryManager::new();
        let manager = mm.host_ptr_manager();

        let on_first = manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x60_0000, 0)
            .unwrap();
        assert_eq!(
            manager.get_fragment_and_check_for_overlaps(0x60_0000, PAGE_SIZE, 1),
            (None, OverlapStatus::FragmentNotOverlappingWithAnyOther)
        );

        let on_second = manager
            .prepare_os_storage_for_allocation(&mm, PAGE_SIZE, 0x60_0000, 1)
            .unwrap();
        assert!(on_second.fragments()[0].fresh_allocation);
        assert_ne!(on_second.fragments()[0].os_handle, on_first.fragments()[0].os_handle);
        assert_eq!(manager.fragment_count(), 2);
        assert_eq!(mm.pinned_count(), 2);

        assert!(manager.release_host_ptr(&mm, 0x60_0000, 1));
        assert!(manager.get_fragment(0x60_0000, 1).is_none());
        assert_eq!(manager.get_fragment(0x60_0000, 0).unwrap().ref_count, 1);
    }

    proptest! {
        #[test]
        fn requirements_cover_the_range_with_page_aligned_fragments(
            ptr in 0usize..0x10_0000,
            size in 1usize..0x10_0000,
        ) {
            let requirements = HostPtrManager::get_allocation_requirements(ptr, size);
            let fragments = requirements.fragments();

            prop_assert!(!fragments.is_empty());
            prop_assert_eq!(fragments[0].ptr, align_down(ptr, PAGE_SIZE));
            let last = fragments[fragments.len() - 1];
            prop_assert_eq!(last.ptr + last.size, align_up(ptr + size, PAGE_SIZE));

            let mut covered = 0;
            for pair in fragments.windows(2) {
                prop_assert_eq!(pair[0].ptr + pair[0].size, pair[1].ptr);
            }
            for f in fragments {
                prop_assert_eq!(f.ptr % PAGE_SIZE, 0);
                prop_assert_eq!(f.size % PAGE_SIZE, 0);
                covered += f.size;
            }
            prop_assert_eq!(covered, requirements.total_required_size);
        }

        #[test]
        fn disjoint_page_ranges_share_no_fragment(
            a_page in 0usize..64,
            a_len in 1usize..8,
            gap in 0usize..4,
            b_len in 1usize..8,
        ) {
            let mm = OsAgnosticMemoryManager::new();
            let manager = mm.host_ptr_manager();
            let a_ptr = 0x100_0000 + a_page * PAGE_SIZE;
            let b_ptr = a_ptr + (a_len + gap) * PAGE_SIZE;

            let a = manager.prepare_os_storage_for_allocation(&mm, a_len * PAGE_SIZE, a_ptr, 0).unwrap();
            let b = manager.prepare_os_storage_for_allocation(&mm, b_len * PAGE_SIZE, b_ptr, 0).unwrap();

            for fa in a.fragments() {
                for fb in b.fragments() {
                    prop_assert_ne!(fa.cpu_ptr, fb.cpu_ptr);
                    prop_assert_ne!(fa.os_handle, fb.os_handle);
                }
            }
            prop_assert_eq!(mm.pinned_count(), 2);
        }
    }
}
