//! The WDDM kernel interface as seen from user mode.
//!
//! Only the calls the receiver and memory manager make are modelled; the
//! Windows side is supplied by the embedder.

use crate::error::NeoResult;
use crate::memory::host_ptr_defines::OsHandleStorage;
use crate::memory::host_ptr_manager::HostPtrManager;
use crate::memory::memory_manager::MemoryManager;
use crate::os::OsHandle;
use crate::utils::canonize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct D3dkmtHandle(pub u32);

/// A fence the GPU signals by writing `cpu_value`.
#[derive(Debug, Clone, Default)]
pub struct MonitoredFence {
    pub current_fence_value: u64,
    pub last_submitted_fence_value: u64,
    pub cpu_value: Arc<AtomicU64>,
}

impl MonitoredFence {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_fence_value: 1,
            ..Self::default()
        }
    }

    /// Whether the GPU has signalled `fence_value`.
    #[must_use]
    pub fn is_signalled(&self, fence_value: u64) -> bool {
        self.cpu_value.load(Ordering::Acquire) >= fence_value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitArguments {
    pub context_handle: D3dkmtHandle,
    pub hw_queue_handle: D3dkmtHandle,
    pub fence_value: u64,
    pub submission_id: u64,
}

pub trait Wddm: Send + Sync {
    /// Wraps `[cpu_ptr, cpu_ptr + size)` in a kernel allocation mapped at `gpu_va`.
    ///
    /// # Errors
    /// Returns the kernel status as an error.
    fn create_allocation_for_host_ptr(&self, cpu_ptr: usize, size: usize, gpu_va: u64) -> NeoResult<D3dkmtHandle>;

    fn destroy_allocations(&self, handles: &[D3dkmtHandle]);

    /// Makes every handle resident in one call; `false` if the kernel refused.
    fn make_resident(&self, handles: &[D3dkmtHandle]) -> bool;

    fn evict(&self, handles: &[D3dkmtHandle]) -> bool;

    /// Submits the batch at `gpu_va`.
    ///
    /// # Errors
    /// `DeviceLost` or `SubmissionFailed`.
    fn submit(&self, gpu_va: u64, size: usize, arguments: &SubmitArguments) -> NeoResult<()>;

    /// Blocks until `fence` reaches `fence_value`; `false` on timeout.
    fn wait_from_cpu(&self, fence_value: u64, fence: &MonitoredFence) -> bool;

    /// A fence for one context's submissions.
    fn create_monitored_fence(&self) -> MonitoredFence {
        MonitoredFence::new()
    }
}

/// Pins host fragments as WDDM allocations.
pub struct WddmMemoryManager<W: Wddm + ?Sized> {
    wddm: Arc<W>,
    host_ptr_manager: HostPtrManager,
}

impl<W: Wddm + ?Sized> WddmMemoryManager<W> {
    #[must_use]
    pub fn new(wddm: Arc<W>) -> Self {
        Self {
            wddm,
            host_ptr_manager: HostPtrManager::new(),
        }
    }

    #[must_use]
    pub fn wddm(&self) -> &Arc<W> {
        &self.wddm
    }
}

impl<W: Wddm + ?Sized> MemoryManager for WddmMemoryManager<W> {
    fn host_ptr_manager(&self) -> &HostPtrManager {
        &self.host_ptr_manager
    }

    fn populate_os_handles(&self, storage: &mut OsHandleStorage, _root_device_index: u32) -> NeoResult<()> {
        let mut created = Vec::new();

        for data in storage.fragments_mut().iter_mut().filter(|d| d.fresh_allocation) {
            let gpu_va = canonize(data.cpu_ptr as u64);
            match self
                .wddm
                .create_allocation_for_host_ptr(data.cpu_ptr, data.fragment_size, gpu_va)
            {
                Ok(handle) => {
                    trace!(handle = handle.0, cpu_ptr = format_args!("0x{:x}", data.cpu_ptr), "wddm fragment created");
                    data.os_handle = Some(OsHandle::Wddm { handle });
                    created.push(handle);
                }
                Err(e) => {
                    warn!("wddm allocation for 0x{:x} failed: {e}", data.cpu_ptr);
                    if !created.is_empty() {
                        self.wddm.destroy_allocations(&created);
                    }
                    for data in storage.fragments_mut().iter_mut().filter(|d| d.fresh_allocation) {
                        data.os_handle = None;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn clean_os_handles(&self, storage: &mut OsHandleStorage, _root_device_index: u32) {
        let handles: Vec<_> = storage
            .fragments_mut()
            .iter_mut()
            .filter(|d| d.free_the_fragment)
            .filter_map(|d| match d.os_handle.take() {
                Some(OsHandle::Wddm { handle }) => Some(handle),
                _ => None,
            })
            .collect();

        if !handles.is_empty() {
            self.wddm.destroy_allocations(&handles);
        }
    }
}

/// Extracts the WDDM handles of an allocation's fragments.
pub fn wddm_handles(handles: impl Iterator<Item = OsHandle>) -> Vec<D3dkmtHandle> {
    handles
        .filter_map(|h| match h {
            OsHandle::Wddm { handle } => Some(handle),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::NeoError;
    use std::sync::Mutex;

    /// Records every kernel call; `submit` signals the fence immediately.
    #[derive(Debug, Default)]
    pub(crate) struct MockWddm {
        pub next_handle: AtomicU64,
        pub created: Mutex<Vec<D3dkmtHandle>>,
        pub destroyed: Mutex<Vec<D3dkmtHandle>>,
        pub make_resident_calls: Mutex<Vec<Vec<D3dkmtHandle>>>,
        pub evict_calls: Mutex<Vec<Vec<D3dkmtHandle>>>,
        pub submits: Mutex<Vec<SubmitArguments>>,
        pub fail_create_after: Mutex<Option<usize>>,
        pub refuse_residency: std::sync::atomic::AtomicBool,
        pub fence: Mutex<Option<Arc<AtomicU64>>>,
    }

    impl Wddm for MockWddm {
        fn create_allocation_for_host_ptr(&self, _cpu_ptr: usize, _size: usize, _gpu_va: u64) -> NeoResult<D3dkmtHandle> {
            let mut created = self.created.lock().unwrap();
            if let Some(limit) = *self.fail_create_after.lock().unwrap()
                && created.len() >= limit
            {
                return Err(NeoError::OutOfMemory);
            }
            let handle = D3dkmtHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) as u32 + 0x100);
            created.push(handle);
            Ok(handle)
        }

        fn destroy_allocations(&self, handles: &[D3dkmtHandle]) {
            self.destroyed.lock().unwrap().extend_from_slice(handles);
        }

        fn make_resident(&self, handles: &[D3dkmtHandle]) -> bool {
            self.make_resident_calls.lock().unwrap().push(handles.to_vec());
            !self.refuse_residency.load(Ordering::Relaxed)
        }

        fn evict(&self, handles: &[D3dkmtHandle]) -> bool {
            self.evict_calls.lock().unwrap().push(handles.to_vec());
            true
        }

        fn submit(&self, _gpu_va: u64, _size: usize, arguments: &SubmitArguments) -> NeoResult<()> {
            self.submits.lock().unwrap().push(*arguments);
            if let Some(fence) = self.fence.lock().unwrap().as_ref() {
                fence.store(arguments.fence_value, Ordering::Release);
            }
            Ok(())
        }

        fn wait_from_cpu(&self, fence_value: u64, fence: &MonitoredFence) -> bool {
            fence.is_signalled(fence_value)
        }

        fn create_monitored_fence(&self) -> MonitoredFence {
            let fence = MonitoredFence::new();
            *self.fence.lock().unwrap() = Some(Arc::clone(&fence.cpu_value));
            fence
        }
    }

    #[test]
    fn failed_create_destroys_partial_pins() {
        let wddm = Arc::new(MockWddm::default());
        *wddm.fail_create_after.lock().unwrap() = Some(1);
        let mm = WddmMemoryManager::new(Arc::clone(&wddm));

        let result = mm
            .host_ptr_manager()
            .prepare_os_storage_for_allocation(&mm, 0x3000, 0x10_0800, 0);

        assert!(matches!(result, Err(NeoError::OutOfMemory)));
        assert_eq!(*wddm.destroyed.lock().unwrap(), *wddm.created.lock().unwrap());
        assert_eq!(mm.host_ptr_manager().fragment_count(), 0);
    }

    #[test]
    fn released_fragments_are_destroyed_together() {
        let wddm = Arc::new(MockWddm::default());
        let mm = WddmMemoryManager::new(Arc::clone(&wddm));

        let mut storage = mm
            .host_ptr_manager()
            .prepare_os_storage_for_allocation(&mm, 0x3000, 0x20_0800, 0)
            .unwrap();
        assert_eq!(storage.fragment_count(), 3);

        mm.host_ptr_manager().release_handle_storage(&mm, &mut storage, 0);
        let mut destroyed = wddm.destroyed.lock().unwrap().clone();
        destroyed.sort_by_key(|h| h.0);
        assert_eq!(destroyed, *wddm.created.lock().unwrap());
    }
}
