#![allow(clippy::cast_possible_truncation)]

use crate::command_stream::completion::TagBuffer;
use crate::command_stream::receiver::{BatchBuffer, SubmissionBackend};
use crate::error::{NeoError, NeoResult};
use crate::hw_info::EngineType;
use crate::memory::GraphicsAllocation;
use crate::os::drm::ioctl::{I915_EXEC_BLT, I915_EXEC_NO_RELOC, I915_EXEC_RENDER};
use crate::os::drm::{DrmInterface, ExecBufferRequest, ExecObject};
use crate::os::{OsContext, OsHandle};
use crate::utils::canonize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Submits through `DRM_IOCTL_I915_GEM_EXECBUFFER2`.
///
/// Residency comes from the object list: every buffer object of every
/// allocation in the batch is listed, followed by the command buffer. The
/// flush stamp is the command buffer's handle, which `gem_wait` accepts.
pub struct DrmBackend<D: DrmInterface + ?Sized> {
    drm: Arc<D>,
    context_id: u32,
    engine_flag: u64,
}

impl<D: DrmInterface + ?Sized> DrmBackend<D> {
    #[must_use]
    pub fn new(drm: Arc<D>) -> Self {
        Self {
            drm,
            context_id: 0,
            engine_flag: I915_EXEC_RENDER,
        }
    }

    #[must_use]
    pub const fn context_id(&self) -> u32 {
        self.context_id
    }
}

fn exec_objects(allocation: &GraphicsAllocation, objects: &mut Vec<ExecObject>) {
    for fragment in allocation.fragments().fragments() {
        if let Some(OsHandle::Drm { bo_handle }) = fragment.os_handle
            && !objects.iter().any(|o| o.handle == bo_handle)
        {
            objects.push(ExecObject {
                handle: bo_handle,
                gpu_address: canonize(fragment.cpu_ptr as u64),
            });
        }
    }
}

impl<D: DrmInterface + ?Sized> SubmissionBackend for DrmBackend<D> {
    fn name(&self) -> &'static str {
        "drm"
    }

    fn initialize(&mut self, os_context: &OsContext) -> NeoResult<()> {
        self.context_id = self.drm.create_context()?;
        self.engine_flag = match os_context.engine.engine_type {
            EngineType::Bcs => I915_EXEC_BLT,
            EngineType::Rcs | EngineType::Ccs => I915_EXEC_RENDER,
        };
        debug!(context_id = self.context_id, "drm context created");
        Ok(())
    }

    fn submit(&mut self, batch: &BatchBuffer, commands: &[u8], _tag: &TagBuffer) -> NeoResult<u64> {
        let mut objects = Vec::new();
        for allocation in &batch.residency {
            exec_objects(allocation, &mut objects);
        }

        let mut batch_objects = Vec::new();
        exec_objects(&batch.command_buffer, &mut batch_objects);
        let Some(batch_object) = batch_objects.last().copied() else {
            return Err(NeoError::SubmissionFailed("command buffer has no buffer object".into()));
        };
        objects.retain(|o| o.handle != batch_object.handle);
        objects.push(batch_object);

        let request = ExecBufferRequest {
            objects,
            batch_start_offset: batch.start_offset as u32,
            batch_len: commands.len() as u32,
            context_id: self.context_id,
            flags: self.engine_flag | I915_EXEC_NO_RELOC,
        };
        self.drm.exec_buffer(&request)?;
        Ok(u64::from(batch_object.handle))
    }

    fn wait_for_flush_stamp(&mut self, flush_stamp: u64) -> bool {
        if flush_stamp == 0 {
            return true;
        }
        match self.drm.gem_wait(flush_stamp as u32, -1) {
            Ok(()) => true,
            Err(e) => {
                warn!(handle = flush_stamp, "gem_wait failed: {e}");
                false
            }
        }
    }
}

impl<D: DrmInterface + ?Sized> Drop for DrmBackend<D> {
    fn drop(&mut self) {
        if self.context_id != 0 {
            self.drm.destroy_context(self.context_id);
        }
    }
}
