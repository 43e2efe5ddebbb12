use crate::error::{NeoError, NeoResult};
use crate::memory::host_ptr_defines::OsHandleStorage;
use crate::memory::host_ptr_manager::HostPtrManager;
use crate::memory::memory_manager::MemoryManager;
use crate::os::OsHandle;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// Memory manager of the simulated device. Pinning hands out fresh ids
/// instead of calling into a kernel driver.
#[derive(Debug, Default)]
pub struct OsAgnosticMemoryManager {
    host_ptr_manager: HostPtrManager,
    next_handle: AtomicU64,
    pinned: Mutex<HashSet<u64>>,
    fail_next_populate: AtomicBool,
}

impl OsAgnosticMemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fragments currently pinned.
    #[must_use]
    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Makes the next `populate_os_handles` fail after pinning its first
    /// fresh fragment, as a kernel running out of memory would.
    pub fn fail_next_populate(&self) {
        self.fail_next_populate.store(true, Ordering::Relaxed);
    }
}

impl MemoryManager for OsAgnosticMemoryManager {
    fn host_ptr_manager(&self) -> &HostPtrManager {
        &self.host_ptr_manager
    }

    fn populate_os_handles(&self, storage: &mut OsHandleStorage, _root_device_index: u32) -> NeoResult<()> {
        let fail = self.fail_next_populate.swap(false, Ordering::Relaxed);
        let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);

        for (n, data) in storage
            .fragments_mut()
            .iter_mut()
            .filter(|d| d.fresh_allocation)
            .enumerate()
        {
            if fail && n > 0 {
                break;
            }
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            pinned.insert(id);
            data.os_handle = Some(OsHandle::Simulated { id });
            trace!(id, cpu_ptr = format_args!("0x{:x}", data.cpu_ptr), "fragment pinned");
        }

        if fail {
            for data in storage.fragments_mut().iter_mut().filter(|d| d.fresh_allocation) {
                if let Some(OsHandle::Simulated { id }) = data.os_handle.take() {
                    pinned.remove(&id);
                }
            }
            return Err(NeoError::OutOfMemory);
        }
        Ok(())
    }

    fn clean_os_handles(&self, storage: &mut OsHandleStorage, _root_device_index: u32) {
        let mut pinned = self.pinned.lock().unwrap_or_else(PoisonError::into_inner);
        for data in storage.fragments_mut().iter_mut().filter(|d| d.free_the_fragment) {
            if let Some(OsHandle::Simulated { id }) = data.os_handle.take() {
                pinned.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::host_ptr_defines::FragmentStorageData;
    use crate::memory::{AllocationProperties, AllocationType};
    use crate::utils::PAGE_SIZE;

    #[test]
    fn host_ptr_allocation_round_trip() {
        let mm = OsAgnosticMemoryManager::new();
        let buffer = vec![0u8; 3 * PAGE_SIZE];
        let ptr = buffer.as_ptr();
        let properties = AllocationProperties::new(0, 2 * PAGE_SIZE, AllocationType::ExternalHostPtr);

        let allocation = mm.allocate_graphics_memory_for_host_ptr(&properties, ptr).unwrap();
        assert_eq!(allocation.cpu_ptr(), ptr as usize);
        assert_eq!(allocation.os_handles().count(), allocation.fragments().fragment_count());
        assert!(mm.pinned_count() > 0);

        mm.free_graphics_memory(allocation);
        assert_eq!(mm.pinned_count(), 0);
        assert_eq!(mm.host_ptr_manager().fragment_count(), 0);
    }

    #[test]
    fn empty_or_null_host_ptr_is_rejected() {
        let mm = OsAgnosticMemoryManager::new();
        let properties = AllocationProperties::new(0, 0, AllocationType::ExternalHostPtr);
        assert!(matches!(
            mm.allocate_graphics_memory_for_host_ptr(&properties, 0x1000 as *const u8),
            Err(NeoError::Unsupported(_))
        ));

        let properties = AllocationProperties::new(0, 16, AllocationType::ExternalHostPtr);
        assert!(mm.allocate_graphics_memory_for_host_ptr(&properties, std::ptr::null()).is_err());
    }

    #[test]
    fn failed_populate_releases_its_own_pins() {
        let mm = OsAgnosticMemoryManager::new();
        let requirements = HostPtrManager::get_allocation_requirements(0x1010, 2 * PAGE_SIZE);
        let mut handles = OsHandleStorage::default();
        for fragment in requirements.fragments() {
            handles.push(FragmentStorageData {
                cpu_ptr: fragment.ptr,
                fragment_size: fragment.size,
                fresh_allocation: true,
                ..FragmentStorageData::default()
            });
        }

        mm.fail_next_populate();
        assert!(mm.populate_os_handles(&mut handles, 0).is_err());
        assert_eq!(mm.pinned_count(), 0);
    }
}
