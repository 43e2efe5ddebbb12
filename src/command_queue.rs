use crate::command_stream::{
    CommandStreamReceiver, CompletionStamp, DispatchFlags, create_command_stream_receiver,
};
use crate::debug_settings::{DebugSettings, flag_override};
use crate::error::{NeoError, NeoResult};
use crate::execution_environment::ExecutionEnvironment;
use crate::hw_helper::{self, DEFAULT_ENGINE_INDEX, EngineInstance, LOW_PRIORITY_ENGINE_INDEX};
use crate::memory::GraphicsAllocation;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const CL_SUCCESS: i32 = 0;
pub const CL_OUT_OF_RESOURCES: i32 = -5;

/// The status code an API entry point reports for `err`.
#[must_use]
pub fn error_code(err: &NeoError) -> i32 {
    match err {
        NeoError::SubmissionFailed(_) | NeoError::DeviceLost | NeoError::OutOfMemory => CL_OUT_OF_RESOURCES,
        _ => -1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    #[default]
    Normal,
    Low,
}

/// An in-order queue over one receiver.
///
/// Dropping the queue waits for everything it submitted.
pub struct CommandQueue {
    csr: Box<dyn CommandStreamReceiver>,
    settings: Arc<DebugSettings>,
    priority: QueuePriority,
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let task_count = self.csr.task_count();
        if task_count > 0 && !self.wait(task_count) {
            warn!(task_count, "command queue destroyed before its work completed");
        }
    }
}

impl CommandQueue {
    /// Submits `commands` and returns the stamp to wait on.
    ///
    /// # Errors
    /// Whatever the receiver reports; [`error_code`] maps it to a status.
    pub fn enqueue(
        &mut self,
        commands: &[u32],
        flags: DispatchFlags,
        residency: &[Arc<GraphicsAllocation>],
    ) -> NeoResult<CompletionStamp> {
        let flags = DispatchFlags {
            low_priority: flags.low_priority || self.priority == QueuePriority::Low,
            ..flags
        };
        self.csr
            .flush_task(commands, &flags, residency)
            .inspect_err(|e| error!(backend = self.csr.backend_name(), "enqueue failed: {e}"))
    }

    /// Submits every queued batch.
    pub fn flush(&mut self) -> i32 {
        if self.csr.flush_batched_submissions() {
            CL_SUCCESS
        } else {
            CL_OUT_OF_RESOURCES
        }
    }

    /// Flushes and blocks until the last enqueued task completes.
    pub fn finish(&mut self) -> i32 {
        let task_count = self.csr.task_count();
        if self.flush() != CL_SUCCESS || !self.wait(task_count) {
            return CL_OUT_OF_RESOURCES;
        }
        CL_SUCCESS
    }

    #[must_use]
    pub fn is_completed(&self, stamp: CompletionStamp) -> bool {
        self.csr.test_task_count_ready(stamp.task_count)
    }

    #[must_use]
    pub fn task_count(&self) -> u32 {
        self.csr.task_count()
    }

    #[must_use]
    pub const fn priority(&self) -> QueuePriority {
        self.priority
    }

    #[must_use]
    pub fn receiver(&self) -> &dyn CommandStreamReceiver {
        self.csr.as_ref()
    }

    fn wait(&mut self, task_count: u32) -> bool {
        let enable_timeout = flag_override(self.settings.enable_timeout).unwrap_or(false);
        self.csr
            .wait_for_completion_with_timeout(enable_timeout, self.settings.timeout_microseconds, task_count)
    }
}

pub struct CommandQueueBuilder<'a> {
    environment: &'a ExecutionEnvironment,
    root_device_index: u32,
    priority: QueuePriority,
    with_aub_dump: bool,
}

impl<'a> CommandQueueBuilder<'a> {
    #[must_use]
    pub const fn new(environment: &'a ExecutionEnvironment, root_device_index: u32) -> Self {
        Self {
            environment,
            root_device_index,
            priority: QueuePriority::Normal,
            with_aub_dump: false,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Mirrors every batch into an AUB stream next to the real submission.
    #[must_use]
    pub const fn with_aub_dump(mut self, enabled: bool) -> Self {
        self.with_aub_dump = enabled;
        self
    }

    /// Picks the engine for the priority and creates its receiver.
    ///
    /// # Errors
    /// `Unsupported` for a missing root device or engine, and any receiver
    /// creation error.
    pub fn create(self) -> NeoResult<CommandQueue> {
        let root = self.environment.root_device(self.root_device_index)?;
        let settings = self.environment.settings();
        let helper = hw_helper::get(root.hw_info.core_family());

        let engine = self.select_engine(&helper.get_gpgpu_engine_instances(&root.hw_info, &settings))?;
        let csr = create_command_stream_receiver(self.environment, self.root_device_index, engine, self.with_aub_dump)
            .inspect_err(|e| error!(?engine, "failed to create command stream receiver: {e}"))?;

        debug!(
            root_device = self.root_device_index,
            ?engine,
            priority = ?self.priority,
            backend = csr.backend_name(),
            "command queue created"
        );
        Ok(CommandQueue {
            csr,
            settings,
            priority: self.priority,
        })
    }

    fn select_engine(&self, engines: &[EngineInstance]) -> NeoResult<EngineInstance> {
        let index = match self.priority {
            QueuePriority::Normal => DEFAULT_ENGINE_INDEX,
            QueuePriority::Low => LOW_PRIORITY_ENGINE_INDEX,
        };
        engines
            .get(index)
            .copied()
            .ok_or(NeoError::Unsupported("engine not available"))
    }
}
