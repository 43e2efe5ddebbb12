use crate::memory::{GraphicsAllocation, ResidencyBits};
use crate::os::wddm::{D3dkmtHandle, Wddm, wddm_handles};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOperationsStatus {
    Success,
    Failed,
    Unsupported,
    MemoryNotFound,
}

/// Controls whether allocations are paged in for one OS context.
pub trait ResidencyHandler: Send {
    fn make_resident(&mut self, allocation: &GraphicsAllocation) -> MemoryOperationsStatus;
    fn evict(&mut self, allocation: &GraphicsAllocation) -> MemoryOperationsStatus;
    fn is_resident(&self, allocation: &GraphicsAllocation) -> bool;
}

/// For devices with no residency control at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResidencyHandler;

impl ResidencyHandler for NullResidencyHandler {
    fn make_resident(&mut self, _allocation: &GraphicsAllocation) -> MemoryOperationsStatus {
        MemoryOperationsStatus::Unsupported
    }

    fn evict(&mut self, _allocation: &GraphicsAllocation) -> MemoryOperationsStatus {
        MemoryOperationsStatus::Unsupported
    }

    fn is_resident(&self, _allocation: &GraphicsAllocation) -> bool {
        false
    }
}

/// i915 pages buffers in from the exec-buffer object list, so explicit
/// residency requests are not supported.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmResidencyHandler;

impl ResidencyHandler for DrmResidencyHandler {
    fn make_resident(&mut self, _allocation: &GraphicsAllocation) -> MemoryOperationsStatus {
        MemoryOperationsStatus::Unsupported
    }

    fn evict(&mut self, _allocation: &GraphicsAllocation) -> MemoryOperationsStatus {
        MemoryOperationsStatus::Unsupported
    }

    fn is_resident(&self, _allocation: &GraphicsAllocation) -> bool {
        false
    }
}

/// Explicit residency through `Wddm::make_resident` / `Wddm::evict`.
///
/// The resident set is keyed by allocation id. Entries of allocations that
/// have since been freed are dropped before the next batch or trim; their
/// kernel handles were destroyed with them.
pub struct WddmResidencyHandler<W: Wddm + ?Sized> {
    wddm: Arc<W>,
    context_id: u32,
    resident: BTreeMap<u64, ResidentEntry>,
}

struct ResidentEntry {
    handles: Vec<D3dkmtHandle>,
    residency: Weak<ResidencyBits>,
}

impl ResidentEntry {
    fn new(allocation: &GraphicsAllocation) -> Self {
        Self {
            handles: wddm_handles(allocation.os_handles()),
            residency: allocation.residency_bits(),
        }
    }

    fn is_freed(&self) -> bool {
        self.residency.strong_count() == 0
    }
}

impl<W: Wddm + ?Sized> WddmResidencyHandler<W> {
    #[must_use]
    pub fn new(wddm: Arc<W>, context_id: u32) -> Self {
        Self {
            wddm,
            context_id,
            resident: BTreeMap::new(),
        }
    }

    /// Number of live allocations in the resident set.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.resident.values().filter(|entry| !entry.is_freed()).count()
    }

    /// Ids of the resident set, including freed allocations not yet dropped.
    pub fn resident_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.resident.keys().copied()
    }

    fn forget_freed(&mut self) {
        let before = self.resident.len();
        self.resident.retain(|_, entry| !entry.is_freed());
        let dropped = before - self.resident.len();
        if dropped > 0 {
            trace!(dropped, "freed allocations left the residency set");
        }
    }

    /// Makes every non-resident allocation of `allocations` resident with a
    /// single kernel call.
    pub fn make_resident_residency_allocations(&mut self, allocations: &[Arc<GraphicsAllocation>]) -> MemoryOperationsStatus {
        self.forget_freed();

        let mut pending: BTreeMap<u64, &GraphicsAllocation> = BTreeMap::new();
        for allocation in allocations {
            if !self.resident.contains_key(&allocation.id()) {
                pending.insert(allocation.id(), allocation);
            }
        }
        if pending.is_empty() {
            return MemoryOperationsStatus::Success;
        }

        let batch: Vec<_> = pending
            .values()
            .flat_map(|a| wddm_handles(a.os_handles()))
            .collect();
        if !batch.is_empty() && !self.wddm.make_resident(&batch) {
            warn!(count = pending.len(), "wddm refused residency batch");
            return MemoryOperationsStatus::Failed;
        }

        for (id, allocation) in pending {
            allocation.set_resident(self.context_id, true);
            self.resident.insert(id, ResidentEntry::new(allocation));
        }
        debug!(resident = self.resident.len(), "residency set updated");
        MemoryOperationsStatus::Success
    }

    /// Evicts everything this handler made resident and clears the context
    /// bit of each evicted allocation.
    pub fn trim_to_budget(&mut self) -> MemoryOperationsStatus {
        self.forget_freed();

        let handles: Vec<_> = self
            .resident
            .values()
            .flat_map(|entry| entry.handles.iter().copied())
            .collect();
        if !handles.is_empty() && !self.wddm.evict(&handles) {
            return MemoryOperationsStatus::Failed;
        }

        for entry in std::mem::take(&mut self.resident).into_values() {
            if let Some(residency) = entry.residency.upgrade() {
                residency.set(self.context_id, false);
            }
        }
        MemoryOperationsStatus::Success
    }
}

impl<W: Wddm + ?Sized> ResidencyHandler for WddmResidencyHandler<W> {
    fn make_resident(&mut self, allocation: &GraphicsAllocation) -> MemoryOperationsStatus {
        if self.resident.contains_key(&allocation.id()) {
            return MemoryOperationsStatus::Success;
        }

        let entry = ResidentEntry::new(allocation);
        if !entry.handles.is_empty() && !self.wddm.make_resident(&entry.handles) {
            return MemoryOperationsStatus::Failed;
        }

        allocation.set_resident(self.context_id, true);
        self.resident.insert(allocation.id(), entry);
        MemoryOperationsStatus::Success
    }

    fn evict(&mut self, allocation: &GraphicsAllocation) -> MemoryOperationsStatus {
        let Some(entry) = self.resident.get(&allocation.id()) else {
            return MemoryOperationsStatus::Success;
        };

        if !entry.handles.is_empty() && !self.wddm.evict(&entry.handles) {
            return MemoryOperationsStatus::Failed;
        }

        self.resident.remove(&allocation.id());
        allocation.set_resident(self.context_id, false);
        MemoryOperationsStatus::Success
    }

    fn is_resident(&self, allocation: &GraphicsAllocation) -> bool {
        self.resident.contains_key(&allocation.id())
    }
}
