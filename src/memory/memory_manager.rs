use crate::error::{NeoError, NeoResult};
use crate::memory::host_ptr_defines::OsHandleStorage;
use crate::memory::host_ptr_manager::HostPtrManager;
use crate::memory::{AllocationType, GraphicsAllocation};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: usize,
    pub allocation_type: AllocationType,
}

impl AllocationProperties {
    #[must_use]
    pub const fn new(root_device_index: u32, size: usize, allocation_type: AllocationType) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
        }
    }
}

/// Pins host memory for GPU access on one OS backend.
///
/// Implementors supply the kernel calls; the fragment bookkeeping and the
/// allocation lifecycle are shared.
pub trait MemoryManager: Send + Sync {
    fn host_ptr_manager(&self) -> &HostPtrManager;

    /// Creates kernel objects for every `fresh_allocation` entry of `storage`
    /// and records them in `os_handle`.
    ///
    /// # Errors
    /// Returns the kernel error. Handles created by this call before the
    /// failure have already been released.
    fn populate_os_handles(&self, storage: &mut OsHandleStorage, root_device_index: u32) -> NeoResult<()>;

    /// Releases the kernel objects of every `free_the_fragment` entry.
    fn clean_os_handles(&self, storage: &mut OsHandleStorage, root_device_index: u32);

    /// Wraps caller-owned memory at `ptr` in a GPU-visible allocation.
    ///
    /// # Errors
    /// `Unsupported` for a null pointer or empty range, `FragmentOverlap`
    /// when the range partially overlaps pinned memory, or the pinning
    /// error.
    fn allocate_graphics_memory_for_host_ptr(
        &self,
        properties: &AllocationProperties,
        ptr: *const u8,
    ) -> NeoResult<GraphicsAllocation> {
        if ptr.is_null() || properties.size == 0 {
            return Err(NeoError::Unsupported("host pointer allocation needs a non-empty range"));
        }

        let storage = self.host_ptr_manager().prepare_os_storage_for_allocation(
            self,
            properties.size,
            ptr as usize,
            properties.root_device_index,
        )?;

        let allocation = GraphicsAllocation::new(
            properties.allocation_type,
            properties.root_device_index,
            ptr as usize,
            properties.size,
            storage,
        );
        debug!(
            id = allocation.id(),
            gpu_address = format_args!("0x{:x}", allocation.gpu_address()),
            size = properties.size,
            "host pointer allocation created"
        );
        Ok(allocation)
    }

    fn free_graphics_memory(&self, allocation: GraphicsAllocation) {
        let root_device_index = allocation.root_device_index();
        let mut storage = allocation.into_fragments();
        self.host_ptr_manager()
            .release_handle_storage(self, &mut storage, root_device_index);
    }
}
