pub mod host_ptr_defines;
pub mod host_ptr_manager;
pub mod memory_manager;
pub mod os_agnostic;
pub mod residency;

pub use host_ptr_manager::{HostPtrManager, HostPtrManagerGuard};
pub use memory_manager::{AllocationProperties, MemoryManager};
pub use os_agnostic::OsAgnosticMemoryManager;

use crate::os::OsHandle;
use crate::utils::canonize;
use host_ptr_defines::OsHandleStorage;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Task count recorded for contexts that never used an allocation.
pub const OBJECT_NOT_USED: u32 = u32::MAX;

/// Residency bits and task counts are tracked for this many contexts.
pub const MAX_OS_CONTEXTS: usize = 32;

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationType {
    #[default]
    Unknown,
    Buffer,
    BufferHostMemory,
    CommandBuffer,
    ExternalHostPtr,
    LinearStream,
    TagBuffer,
    TimestampPacket,
}

/// Per-context residency bits of one allocation.
///
/// Residency handlers keep a [`Weak`] reference so they can clear the bit
/// of allocations they evict and notice allocations that were freed.
#[derive(Debug, Default)]
pub struct ResidencyBits(AtomicU32);

impl ResidencyBits {
    #[must_use]
    pub fn is_resident(&self, context_id: u32) -> bool {
        self.0.load(Ordering::Acquire) & context_bit(context_id) != 0
    }

    pub fn set(&self, context_id: u32, resident: bool) {
        if resident {
            self.0.fetch_or(context_bit(context_id), Ordering::AcqRel);
        } else {
            self.0.fetch_and(!context_bit(context_id), Ordering::AcqRel);
        }
    }
}

/// A GPU-visible memory object.
///
/// The memory itself belongs to whoever created the allocation; receivers
/// and residency handlers only hold `Arc` references. Per-context state is
/// atomic so it can be updated through those shared references.
#[derive(Debug)]
pub struct GraphicsAllocation {
    id: u64,
    allocation_type: AllocationType,
    root_device_index: u32,
    cpu_ptr: usize,
    size: usize,
    gpu_address: u64,
    fragments: OsHandleStorage,
    residency: Arc<ResidencyBits>,
    task_counts: [AtomicU32; MAX_OS_CONTEXTS],
    aub_writable: AtomicU32,
    tbx_writable: AtomicU32,
}

impl GraphicsAllocation {
    #[must_use]
    pub fn new(
        allocation_type: AllocationType,
        root_device_index: u32,
        cpu_ptr: usize,
        size: usize,
        fragments: OsHandleStorage,
    ) -> Self {
        Self {
            id: NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed),
            allocation_type,
            root_device_index,
            cpu_ptr,
            size,
            gpu_address: canonize(cpu_ptr as u64),
            fragments,
            residency: Arc::default(),
            task_counts: std::array::from_fn(|_| AtomicU32::new(OBJECT_NOT_USED)),
            aub_writable: AtomicU32::new(u32::MAX),
            tbx_writable: AtomicU32::new(u32::MAX),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    #[must_use]
    pub const fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    #[must_use]
    pub const fn cpu_ptr(&self) -> usize {
        self.cpu_ptr
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Canonical (sign-extended 48-bit) GPU virtual address.
    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    #[must_use]
    pub const fn fragments(&self) -> &OsHandleStorage {
        &self.fragments
    }

    /// The kernel handles of every pinned fragment, in address order.
    pub fn os_handles(&self) -> impl Iterator<Item = OsHandle> + '_ {
        self.fragments.fragments().iter().filter_map(|f| f.os_handle)
    }

    /// Hands the fragment storage back for release.
    #[must_use]
    pub fn into_fragments(self) -> OsHandleStorage {
        self.fragments
    }

    /// The host bytes backing the allocation.
    ///
    /// # Safety
    /// The memory at `cpu_ptr` must still be alive and not written
    /// concurrently for the lifetime of the returned slice.
    #[must_use]
    pub unsafe fn host_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.cpu_ptr as *const u8, self.size) }
    }

    // ===========================================================================================
    // Per-context state
    // ===========================================================================================

    #[must_use]
    pub fn is_resident(&self, context_id: u32) -> bool {
        self.residency.is_resident(context_id)
    }

    pub fn set_resident(&self, context_id: u32, resident: bool) {
        self.residency.set(context_id, resident);
    }

    /// A handle on the residency bits that does not keep the allocation alive.
    #[must_use]
    pub fn residency_bits(&self) -> Weak<ResidencyBits> {
        Arc::downgrade(&self.residency)
    }

    /// Records that `task_count` on `context_id` uses this allocation.
    pub fn update_task_count(&self, task_count: u32, context_id: u32) {
        self.task_counts[context_id as usize % MAX_OS_CONTEXTS].store(task_count, Ordering::Release);
    }

    /// The last task count recorded for `context_id`, or [`OBJECT_NOT_USED`].
    #[must_use]
    pub fn task_count(&self, context_id: u32) -> u32 {
        self.task_counts[context_id as usize % MAX_OS_CONTEXTS].load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_used_by_context(&self, context_id: u32) -> bool {
        self.task_count(context_id) != OBJECT_NOT_USED
    }

    // ===========================================================================================
    // Simulation write tracking
    // ===========================================================================================

    /// Whether the banks in `banks` still need their contents written to
    /// the AUB stream.
    #[must_use]
    pub fn is_aub_writable(&self, banks: u32) -> bool {
        self.aub_writable.load(Ordering::Acquire) & banks != 0
    }

    pub fn set_aub_writable(&self, writable: bool, banks: u32) {
        set_bank_bits(&self.aub_writable, writable, banks);
    }

    #[must_use]
    pub fn is_tbx_writable(&self, banks: u32) -> bool {
        self.tbx_writable.load(Ordering::Acquire) & banks != 0
    }

    pub fn set_tbx_writable(&self, writable: bool, banks: u32) {
        set_bank_bits(&self.tbx_writable, writable, banks);
    }
}

const fn context_bit(context_id: u32) -> u32 {
    1 << (context_id % MAX_OS_CONTEXTS as u32)
}

fn set_bank_bits(bits: &AtomicU32, set: bool, banks: u32) {
    if set {
        bits.fetch_or(banks, Ordering::AcqRel);
    } else {
        bits.fetch_and(!banks, Ordering::AcqRel);
    }
}
