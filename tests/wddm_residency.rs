use neo_rs::NeoResult;
use neo_rs::command_queue::{CL_SUCCESS, CommandQueueBuilder};
use neo_rs::command_stream::DispatchFlags;
use neo_rs::debug_settings::DebugSettings;
use neo_rs::execution_environment::ExecutionEnvironment;
use neo_rs::hw_info::ProductFamily;
use neo_rs::hw_info::products::base_hardware_info;
use neo_rs::hw_info::setup_hardware_info;
use neo_rs::memory::residency::{MemoryOperationsStatus, ResidencyHandler, WddmResidencyHandler};
use neo_rs::memory::{AllocationProperties, AllocationType, MemoryManager};
use neo_rs::os::wddm::{D3dkmtHandle, MonitoredFence, SubmitArguments, Wddm, WddmMemoryManager};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A kernel that signals each submission's fence as soon as it is made.
#[derive(Default)]
struct FakeWddm {
    next_handle: AtomicU32,
    make_resident_calls: Mutex<Vec<Vec<D3dkmtHandle>>>,
    evict_calls: Mutex<Vec<Vec<D3dkmtHandle>>>,
    submitted_fences: Mutex<Vec<u64>>,
    fence: Mutex<Option<Arc<AtomicU64>>>,
}

impl Wddm for FakeWddm {
    fn create_allocation_for_host_ptr(&self, _cpu_ptr: usize, _size: usize, _gpu_va: u64) -> NeoResult<D3dkmtHandle> {
        Ok(D3dkmtHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn destroy_allocations(&self, _handles: &[D3dkmtHandle]) {}

    fn make_resident(&self, handles: &[D3dkmtHandle]) -> bool {
        self.make_resident_calls.lock().unwrap().push(handles.to_vec());
        true
    }

    fn evict(&self, handles: &[D3dkmtHandle]) -> bool {
        self.evict_calls.lock().unwrap().push(handles.to_vec());
        true
    }

    fn submit(&self, _gpu_va: u64, _size: usize, arguments: &SubmitArguments) -> NeoResult<()> {
        self.submitted_fences.lock().unwrap().push(arguments.fence_value);
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
fn residency_changes_are_idempotent_in_both_directions() {
    let wddm = Arc::new(FakeWddm::default());
    let mm = WddmMemoryManager::new(Arc::clone(&wddm));
    let buffer = vec![0u8; 2 * 4096];
    let allocation = mm
        .allocate_graphics_memory_for_host_ptr(
            &AllocationProperties::new(0, buffer.len(), AllocationType::Buffer),
            buffer.as_ptr(),
        )
        .unwrap();

    let mut handler = WddmResidencyHandler::new(Arc::clone(&wddm), 0);
    assert_eq!(handler.evict(&allocation), MemoryOperationsStatus::Success);
    assert_eq!(handler.make_resident(&allocation), MemoryOperationsStatus::Success);
    assert_eq!(handler.make_resident(&allocation), MemoryOperationsStatus::Success);

    assert!(handler.is_resident(&allocation));
    assert_eq!(handler.resident_count(), 1);
    assert_eq!(wddm.make_resident_calls.lock().unwrap().len(), 1);

    assert_eq!(handler.evict(&allocation), MemoryOperationsStatus::Success);
    assert_eq!(handler.evict(&allocation), MemoryOperationsStatus::Success);
    assert!(!handler.is_resident(&allocation));
    assert_eq!(wddm.evict_calls.lock().unwrap().len(), 1);

    mm.free_graphics_memory(allocation);
}

#[test]
fn queue_submits_with_increasing_fence_values() {
    let wddm = Arc::new(FakeWddm::default());
    let mut hw = base_hardware_info(ProductFamily::Skylake).unwrap();
    setup_hardware_info(ProductFamily::Skylake, &mut hw, true, "default").unwrap();
    let environment =
        ExecutionEnvironment::from_wddm(Arc::new(DebugSettings::default()), Arc::clone(&wddm) as Arc<dyn Wddm>, hw)
            .unwrap();

    let mut queue = CommandQueueBuilder::new(&environment, 0).create().unwrap();
    assert_eq!(queue.receiver().backend_name(), "wddm");

    let first = queue.enqueue(&[0, 0], DispatchFlags::default(), &[]).unwrap();
    let second = queue.enqueue(&[0, 0], DispatchFlags::default(), &[]).unwrap();

    assert_eq!((first.flush_stamp, second.flush_stamp), (1, 2));
    assert_eq!(*wddm.submitted_fences.lock().unwrap(), vec![1, 2]);
    // The command buffer and tag page become resident once.
    assert_eq!(wddm.make_resident_calls.lock().unwrap().len(), 1);

    // Nothing executes the batches; complete them as the GPU would.
    queue.receiver().hw_tag().store(second.task_count);
    assert_eq!(queue.finish(), CL_SUCCESS);
}
