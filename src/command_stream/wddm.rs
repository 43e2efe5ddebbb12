use crate::command_stream::completion::TagBuffer;
use crate::command_stream::receiver::{BatchBuffer, SubmissionBackend};
use crate::error::{NeoError, NeoResult};
use crate::memory::residency::{MemoryOperationsStatus, WddmResidencyHandler};
use crate::os::OsContext;
use crate::os::wddm::{D3dkmtHandle, MonitoredFence, SubmitArguments, Wddm};
use std::sync::Arc;
use tracing::warn;

/// Submits through WDDM after making the batch's allocations resident.
/// The flush stamp is the monitored fence value of the submission.
pub struct WddmBackend<W: Wddm + ?Sized> {
    wddm: Arc<W>,
    residency: WddmResidencyHandler<W>,
    fence: MonitoredFence,
    context_handle: D3dkmtHandle,
    submission_id: u64,
}

impl<W: Wddm + ?Sized> WddmBackend<W> {
    #[must_use]
    pub fn new(wddm: Arc<W>) -> Self {
        Self {
            residency: WddmResidencyHandler::new(Arc::clone(&wddm), 0),
            fence: wddm.create_monitored_fence(),
            wddm,
            context_handle: D3dkmtHandle::default(),
            submission_id: 0,
        }
    }

    #[must_use]
    pub const fn monitored_fence(&self) -> &MonitoredFence {
        &self.fence
    }

    #[must_use]
    pub const fn residency(&self) -> &WddmResidencyHandler<W> {
        &self.residency
    }
}

impl<W: Wddm + ?Sized> SubmissionBackend for WddmBackend<W> {
    fn name(&self) -> &'static str {
        "wddm"
    }

    fn initialize(&mut self, os_context: &OsContext) -> NeoResult<()> {
        self.residency = WddmResidencyHandler::new(Arc::clone(&self.wddm), os_context.context_id);
        self.context_handle = D3dkmtHandle(os_context.context_id);
        Ok(())
    }

    fn submit(&mut self, batch: &BatchBuffer, commands: &[u8], _tag: &TagBuffer) -> NeoResult<u64> {
        let mut residency = batch.residency.clone();
        residency.push(Arc::clone(&batch.command_buffer));
        if self.residency.make_resident_residency_allocations(&residency) != MemoryOperationsStatus::Success {
            warn!(task_count = batch.task_count, "residency set rejected");
            return Err(NeoError::SubmissionFailed(
                "wddm refused to make the residency set resident".into(),
            ));
        }

        let fence_value = self.fence.current_fence_value;
        let arguments = SubmitArguments {
            context_handle: self.context_handle,
            hw_queue_handle: self.context_handle,
            fence_value,
            submission_id: self.submission_id,
        };
        self.wddm.submit(batch.gpu_address(), commands.len(), &arguments)?;

        self.fence.last_submitted_fence_value = fence_value;
        self.fence.current_fence_value += 1;
        self.submission_id += 1;
        Ok(fence_value)
    }

    fn wait_for_flush_stamp(&mut self, flush_stamp: u64) -> bool {
        if flush_stamp == 0 || self.fence.is_signalled(flush_stamp) {
            return true;
        }
        self.wddm.wait_from_cpu(flush_stamp, &self.fence)
    }
}
