use crate::error::NeoResult;
use crate::memory::host_ptr_defines::OsHandleStorage;
use crate::memory::host_ptr_manager::HostPtrManager;
use crate::memory::memory_manager::MemoryManager;
use crate::os::OsHandle;
use crate::os::drm::DrmInterface;
use std::sync::Arc;
use tracing::{trace, warn};

/// Pins host fragments as i915 userptr objects.
pub struct DrmMemoryManager<D: DrmInterface + ?Sized> {
    drm: Arc<D>,
    host_ptr_manager: HostPtrManager,
}

impl<D: DrmInterface + ?Sized> DrmMemoryManager<D> {
    #[must_use]
    pub fn new(drm: Arc<D>) -> Self {
        Self {
            drm,
            host_ptr_manager: HostPtrManager::new(),
        }
    }

    #[must_use]
    pub fn drm(&self) -> &Arc<D> {
        &self.drm
    }
}

impl<D: DrmInterface + ?Sized> MemoryManager for DrmMemoryManager<D> {
    fn host_ptr_manager(&self) -> &HostPtrManager {
        &self.host_ptr_manager
    }

    fn populate_os_handles(&self, storage: &mut OsHandleStorage, _root_device_index: u32) -> NeoResult<()> {
        let mut created = Vec::new();

        for data in storage.fragments_mut().iter_mut().filter(|d| d.fresh_allocation) {
            match self.drm.gem_userptr(data.cpu_ptr, data.fragment_size, false) {
                Ok(bo_handle) => {
                    trace!(bo_handle, cpu_ptr = format_args!("0x{:x}", data.cpu_ptr), "userptr created");
                    data.os_handle = Some(OsHandle::Drm { bo_handle });
                    created.push(bo_handle);
                }
                Err(e) => {
                    warn!("userptr for 0x{:x} (+0x{:x}) failed: {e}", data.cpu_ptr, data.fragment_size);
                    for handle in created {
                        self.drm.gem_close(handle);
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
        for data in storage.fragments_mut().iter_mut().filter(|d| d.free_the_fragment) {
            if let Some(OsHandle::Drm { bo_handle }) = data.os_handle.take() {
                self.drm.gem_close(bo_handle);
            }
        }
    }
}
