#![allow(clippy::cast_possible_truncation)]

//! The command stream receiver: turns caller-built commands into complete
//! batch buffers and tracks their completion.
//!
//! Every submission gets the next task count. The batch ends with a
//! `PIPE_CONTROL` whose post-sync operation writes that task count into the
//! tag page, so completion of task `n` is observed as `tag >= n`.

use crate::command_stream::commands::{MI_BATCH_BUFFER_END, PIPE_CONTROL_DWORDS, PipeControlArgs, PostSyncOperation};
use crate::command_stream::completion::{CompletionStamp, TagBuffer, base_wait_function};
use crate::command_stream::gpgpu_walker::GpgpuWalkerHelper;
use crate::command_stream::linear_stream::LinearStream;
use crate::command_stream::preamble::{PipelineSelectArgs, PreambleHelper};
use crate::debug_settings::DebugSettings;
use crate::error::{NeoError, NeoResult};
use crate::hw_helper::{GfxFamily, HwHelper};
use crate::hw_info::{EngineType, HardwareInfo, ThreadArbitrationPolicy};
use crate::memory::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager};
use crate::os::OsContext;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Default size of a receiver's command stream.
pub const COMMAND_STREAM_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Every `flush_task` submits.
    Immediate,
    /// Submissions queue up until `flush_batched_submissions` or a wait.
    Batched,
}

impl DispatchMode {
    /// Maps the `CsrDispatchMode` setting (1 = immediate, 2..=4 batched
    /// variants, anything else = default).
    #[must_use]
    pub const fn from_setting(value: i32) -> Self {
        match value {
            2..=4 => Self::Batched,
            _ => Self::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrStatus {
    Idle,
    Flushing,
    Submitted,
}

/// Per-submission requirements of the caller's commands.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchFlags {
    pub use_slm: bool,
    pub dc_flush: bool,
    pub low_priority: bool,
    pub media_sampler_required: bool,
    /// `NotPresent` keeps the receiver's current policy.
    pub thread_arbitration_policy: ThreadArbitrationPolicy,
    pub per_thread_scratch_size: u32,
    /// Timestamp slot to bracket the commands with; see
    /// [`GpgpuWalkerHelper::dispatch_profiling_commands_start`].
    pub profiling_timestamp_address: Option<u64>,
    /// Submit right away even in batched mode.
    pub blocking: bool,
}

impl Default for DispatchFlags {
    fn default() -> Self {
        Self {
            use_slm: false,
            dc_flush: false,
            low_priority: false,
            media_sampler_required: false,
            thread_arbitration_policy: ThreadArbitrationPolicy::NotPresent,
            per_thread_scratch_size: 0,
            profiling_timestamp_address: None,
            blocking: false,
        }
    }
}

impl DispatchFlags {
    #[must_use]
    pub const fn with_slm(mut self, use_slm: bool) -> Self {
        self.use_slm = use_slm;
        self
    }

    #[must_use]
    pub const fn with_dc_flush(mut self, dc_flush: bool) -> Self {
        self.dc_flush = dc_flush;
        self
    }

    #[must_use]
    pub const fn with_thread_arbitration_policy(mut self, policy: ThreadArbitrationPolicy) -> Self {
        self.thread_arbitration_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_scratch_size(mut self, per_thread_scratch_size: u32) -> Self {
        self.per_thread_scratch_size = per_thread_scratch_size;
        self
    }

    #[must_use]
    pub const fn with_profiling(mut self, timestamp_address: u64) -> Self {
        self.profiling_timestamp_address = Some(timestamp_address);
        self
    }

    #[must_use]
    pub const fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

/// One programmed batch, ready for a backend.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    pub command_buffer: Arc<GraphicsAllocation>,
    pub start_offset: usize,
    pub end_offset: usize,
    pub task_count: u32,
    pub low_priority: bool,
    pub os_context: OsContext,
    /// Everything the batch touches except the command buffer.
    pub residency: Vec<Arc<GraphicsAllocation>>,
}

impl BatchBuffer {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end_offset == self.start_offset
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.command_buffer.gpu_address() + self.start_offset as u64
    }
}

/// How a receiver hands finished batches to the device.
pub trait SubmissionBackend: Send {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns the kernel error when per-context setup fails.
    fn initialize(&mut self, _os_context: &OsContext) -> NeoResult<()> {
        Ok(())
    }

    /// Submits `commands` (the bytes of `batch`) and returns a flush stamp
    /// that [`SubmissionBackend::wait_for_flush_stamp`] understands.
    ///
    /// # Errors
    /// `DeviceLost` or `SubmissionFailed`.
    fn submit(&mut self, batch: &BatchBuffer, commands: &[u8], tag: &TagBuffer) -> NeoResult<u64>;

    /// Blocks on the kernel-side completion of `flush_stamp`; returns
    /// `false` if the kernel reported a failure.
    fn wait_for_flush_stamp(&mut self, _flush_stamp: u64) -> bool {
        true
    }
}

/// Submission and completion tracking for one OS context.
pub trait CommandStreamReceiver: Send {
    /// Programs and submits (or queues) one task.
    ///
    /// # Errors
    /// `DeviceLost` and `SubmissionFailed` from the backend, `OutOfMemory`
    /// if the task can never fit the command stream. A rejected immediate
    /// submission does not consume a task count.
    fn flush_task(
        &mut self,
        commands: &[u32],
        flags: &DispatchFlags,
        residency: &[Arc<GraphicsAllocation>],
    ) -> NeoResult<CompletionStamp>;

    /// Submits queued batches in order, stopping at the first failure.
    fn flush_batched_submissions(&mut self) -> bool;

    fn task_count(&self) -> u32;
    fn latest_flushed_task_count(&self) -> u32;
    fn completion_stamp(&self) -> CompletionStamp;
    fn hw_tag(&self) -> &TagBuffer;

    /// Non-blocking completion check.
    fn test_task_count_ready(&self, task_count: u32) -> bool {
        self.hw_tag().is_completed(task_count)
    }

    /// Flushes queued work if `task_count` is among it, then waits for
    /// the tag to reach `task_count`. Returns `false` on timeout.
    fn wait_for_completion_with_timeout(&mut self, enable_timeout: bool, timeout_us: i64, task_count: u32) -> bool;

    fn status(&self) -> CsrStatus;
    fn os_context(&self) -> &OsContext;
    fn dispatch_mode(&self) -> DispatchMode;
    fn backend_name(&self) -> &'static str;
}

/// Hardware state last programmed into the command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ProgrammedState {
    preamble_sent: bool,
    l3_config: Option<u32>,
    thread_arbitration_policy: Option<ThreadArbitrationPolicy>,
    media_sampler_required: Option<bool>,
    vfe_scratch_size: Option<u32>,
}

/// A batch waiting for `flush_batched_submissions`, with the state the
/// stream holds once it has run.
struct QueuedBatch {
    batch: BatchBuffer,
    state: ProgrammedState,
}

pub struct CommandStreamReceiverHw<F: GfxFamily, B: SubmissionBackend> {
    hw_info: Arc<HardwareInfo>,
    settings: Arc<DebugSettings>,
    helper: &'static dyn HwHelper,
    memory_manager: Arc<dyn MemoryManager>,
    os_context: OsContext,
    backend: B,

    stream: LinearStream,
    tag: Box<TagBuffer>,
    command_buffer: Option<Arc<GraphicsAllocation>>,
    tag_allocation: Option<Arc<GraphicsAllocation>>,

    dispatch_mode: DispatchMode,
    required_policy: ThreadArbitrationPolicy,
    state: ProgrammedState,
    submitted_state: ProgrammedState,
    task_count: u32,
    latest_flushed_task_count: u32,
    latest_flush_stamp: u64,
    last_stamp: CompletionStamp,
    status: CsrStatus,
    device_lost: bool,
    batched: VecDeque<QueuedBatch>,

    _family: PhantomData<fn() -> F>,
}

impl<F: GfxFamily, B: SubmissionBackend> CommandStreamReceiverHw<F, B> {
    /// Creates a receiver with its own command stream and tag page, both
    /// pinned through `memory_manager`.
    ///
    /// # Errors
    /// Returns allocation, pinning or backend initialization errors.
    pub fn new(
        hw_info: Arc<HardwareInfo>,
        settings: Arc<DebugSettings>,
        memory_manager: Arc<dyn MemoryManager>,
        os_context: OsContext,
        mut backend: B,
    ) -> NeoResult<Self> {
        backend.initialize(&os_context)?;
        Self::with_stream_size(hw_info, settings, memory_manager, os_context, COMMAND_STREAM_SIZE, backend)
    }

    /// Like [`CommandStreamReceiverHw::new`] with an explicit stream size,
    /// for a backend that is already initialized.
    ///
    /// # Errors
    /// Returns allocation or pinning errors.
    pub fn with_stream_size(
        hw_info: Arc<HardwareInfo>,
        settings: Arc<DebugSettings>,
        memory_manager: Arc<dyn MemoryManager>,
        os_context: OsContext,
        stream_size: usize,
        backend: B,
    ) -> NeoResult<Self> {
        let helper = crate::hw_helper::get(F::CORE_FAMILY);
        let stream = LinearStream::new(stream_size)?;
        let tag = Box::new(TagBuffer::new());
        let root = os_context.root_device_index;

        let command_buffer = memory_manager.allocate_graphics_memory_for_host_ptr(
            &AllocationProperties::new(root, stream.capacity(), AllocationType::CommandBuffer),
            stream.cpu_address() as *const u8,
        )?;
        let tag_allocation = match memory_manager.allocate_graphics_memory_for_host_ptr(
            &AllocationProperties::new(root, std::mem::size_of::<TagBuffer>(), AllocationType::TagBuffer),
            tag.cpu_address() as *const u8,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                memory_manager.free_graphics_memory(command_buffer);
                return Err(e);
            }
        };

        let required_policy = helper.get_thread_arbitration_policy(&hw_info, &settings);
        let dispatch_mode = DispatchMode::from_setting(settings.csr_dispatch_mode);
        debug!(
            family = F::NAME,
            backend = backend.name(),
            context = os_context.context_id,
            ?dispatch_mode,
            "command stream receiver created"
        );

        Ok(Self {
            hw_info,
            settings,
            helper,
            memory_manager,
            os_context,
            backend,
            stream,
            tag,
            command_buffer: Some(Arc::new(command_buffer)),
            tag_allocation: Some(Arc::new(tag_allocation)),
            dispatch_mode,
            required_policy,
            state: ProgrammedState::default(),
            submitted_state: ProgrammedState::default(),
            task_count: 0,
            latest_flushed_task_count: 0,
            latest_flush_stamp: 0,
            last_stamp: CompletionStamp::default(),
            status: CsrStatus::Idle,
            device_lost: false,
            batched: VecDeque::new(),
            _family: PhantomData,
        })
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[must_use]
    pub const fn stream(&self) -> &LinearStream {
        &self.stream
    }

    pub fn set_dispatch_mode(&mut self, mode: DispatchMode) {
        self.dispatch_mode = mode;
    }

    #[must_use]
    pub fn tag_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.tag_allocation.as_ref()
    }

    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.batched.len()
    }

    fn engine_type(&self) -> EngineType {
        self.os_context.engine.engine_type
    }

    fn programs_render_state(&self) -> bool {
        self.engine_type() != EngineType::Bcs
    }

    fn resolve_policy(&self, flags: &DispatchFlags) -> ThreadArbitrationPolicy {
        match flags.thread_arbitration_policy {
            ThreadArbitrationPolicy::NotPresent => self.required_policy,
            policy => policy,
        }
    }

    // ===========================================================================================
    // Programming
    // ===========================================================================================

    /// Upper bound of the bytes `flush_task` emits for `flags` and `commands`.
    fn required_space(&self, commands: &[u32], flags: &DispatchFlags) -> usize {
        let hw = &self.hw_info;
        let mut size = std::mem::size_of_val(commands) + PIPE_CONTROL_DWORDS * 4 + 8;

        if self.programs_render_state() {
            size += PreambleHelper::<F>::get_preamble_size(hw)
                + PreambleHelper::<F>::get_cmd_size_for_pipeline_select()
                + PreambleHelper::<F>::get_vfe_commands_size();
        }
        size += GpgpuWalkerHelper::<F>::get_size_for_cache_flush_after_walker(hw, self.helper, &self.settings);
        if flags.profiling_timestamp_address.is_some() {
            size += GpgpuWalkerHelper::<F>::get_profiling_commands_size();
        }
        size
    }

    fn program_state(&mut self, flags: &DispatchFlags) {
        let hw = Arc::clone(&self.hw_info);
        let l3_config = PreambleHelper::<F>::get_l3_config(&hw, flags.use_slm);
        let policy = self.resolve_policy(flags);

        if !self.state.preamble_sent {
            PreambleHelper::<F>::program_preamble(&mut self.stream, &hw, l3_config, policy);
            self.state.preamble_sent = true;
            self.state.l3_config = Some(l3_config);
            self.state.thread_arbitration_policy = Some(policy);
            trace!(l3_config, ?policy, "preamble programmed");
        } else {
            if self.state.l3_config != Some(l3_config) && PreambleHelper::<F>::is_l3_configurable(&hw) {
                PreambleHelper::<F>::program_l3(&mut self.stream, l3_config);
                self.state.l3_config = Some(l3_config);
            }
            if self.state.thread_arbitration_policy != Some(policy) && policy != ThreadArbitrationPolicy::NotPresent {
                PreambleHelper::<F>::program_thread_arbitration(&mut self.stream, policy);
                self.state.thread_arbitration_policy = Some(policy);
            }
        }

        if self.state.media_sampler_required != Some(flags.media_sampler_required) {
            let args = PipelineSelectArgs {
                media_sampler_required: flags.media_sampler_required,
            };
            PreambleHelper::<F>::program_pipeline_select(&mut self.stream, &args, &hw);
            self.state.media_sampler_required = Some(flags.media_sampler_required);
        }

        let scratch_size = flags.per_thread_scratch_size;
        if self.state.vfe_scratch_size.is_none_or(|programmed| scratch_size > programmed) {
            let engine = self.engine_type();
            PreambleHelper::<F>::program_vfe_state(&mut self.stream, &hw, self.helper, engine, 0, scratch_size);
            self.state.vfe_scratch_size = Some(scratch_size);
        }
    }

    fn program_task(&mut self, commands: &[u32], flags: &DispatchFlags, task_count: u32, tag_address: u64) {
        if self.programs_render_state() {
            self.program_state(flags);
        }

        if let Some(address) = flags.profiling_timestamp_address {
            GpgpuWalkerHelper::<F>::dispatch_profiling_commands_start(&mut self.stream, address);
        }
        self.stream.emit(commands);
        if let Some(address) = flags.profiling_timestamp_address {
            GpgpuWalkerHelper::<F>::dispatch_profiling_commands_end(&mut self.stream, address);
        }
        GpgpuWalkerHelper::<F>::program_cache_flush_after_walker(
            &mut self.stream,
            &self.hw_info,
            self.helper,
            &self.settings,
        );

        let tag_update = PipeControlArgs::cs_stall().with_dc_flush(flags.dc_flush).with_post_sync(
            PostSyncOperation::WriteImmediateData,
            tag_address,
            u64::from(task_count),
        );
        self.stream.emit(&tag_update.encode());
        self.stream.emit(&[MI_BATCH_BUFFER_END]);
        self.stream.align_to(8);
    }

    /// Makes room for `required` bytes, recycling the stream once every
    /// batch in it has completed.
    fn ensure_space(&mut self, required: usize) -> NeoResult<()> {
        if required > self.stream.capacity() {
            return Err(NeoError::OutOfMemory);
        }
        if self.stream.available() >= required {
            return Ok(());
        }

        if !self.flush_batched_submissions() {
            return Err(NeoError::SubmissionFailed("queued batches could not be flushed".into()));
        }
        let last = self.latest_flushed_task_count;
        self.backend.wait_for_flush_stamp(self.latest_flush_stamp);
        base_wait_function(&self.tag, false, 0, last);
        self.stream.reset();
        trace!(task_count = last, "command stream recycled");
        Ok(())
    }

    fn submit_batch(&mut self, batch: &BatchBuffer) -> NeoResult<u64> {
        let commands = self.stream.bytes(batch.start_offset, batch.end_offset);
        match self.backend.submit(batch, commands, &self.tag) {
            Ok(flush_stamp) => {
                self.latest_flushed_task_count = batch.task_count;
                self.latest_flush_stamp = flush_stamp;
                self.status = CsrStatus::Submitted;
                trace!(task_count = batch.task_count, flush_stamp, backend = self.backend.name(), "batch submitted");
                Ok(flush_stamp)
            }
            Err(e) => {
                if matches!(e, NeoError::DeviceLost) {
                    self.device_lost = true;
                }
                error!(task_count = batch.task_count, backend = self.backend.name(), "submission failed: {e}");
                Err(e)
            }
        }
    }
}

/// Records that the batch's task uses its command buffer and residency.
fn mark_used(batch: &BatchBuffer, context_id: u32) {
    batch.command_buffer.update_task_count(batch.task_count, context_id);
    for allocation in &batch.residency {
        allocation.update_task_count(batch.task_count, context_id);
    }
}

impl<F: GfxFamily, B: SubmissionBackend> CommandStreamReceiver for CommandStreamReceiverHw<F, B> {
    fn flush_task(
        &mut self,
        commands: &[u32],
        flags: &DispatchFlags,
        residency: &[Arc<GraphicsAllocation>],
    ) -> NeoResult<CompletionStamp> {
        if self.device_lost {
            return Err(NeoError::DeviceLost);
        }
        let (Some(command_buffer), Some(tag_allocation)) = (self.command_buffer.clone(), self.tag_allocation.clone())
        else {
            return Err(NeoError::DeviceLost);
        };

        self.ensure_space(self.required_space(commands, flags))?;

        let previous_status = self.status;
        self.status = CsrStatus::Flushing;
        let start_offset = self.stream.used();
        let task_count = self.task_count.wrapping_add(1);

        self.program_task(commands, flags, task_count, tag_allocation.gpu_address());

        let mut batch_residency = Vec::with_capacity(residency.len() + 1);
        batch_residency.extend(residency.iter().cloned());
        batch_residency.push(tag_allocation);

        let batch = BatchBuffer {
            command_buffer,
            start_offset,
            end_offset: self.stream.used(),
            task_count,
            low_priority: flags.low_priority || self.os_context.low_priority,
            os_context: self.os_context,
            residency: batch_residency,
        };

        let immediate = self.dispatch_mode == DispatchMode::Immediate || flags.blocking;
        let flush_stamp = if immediate {
            let submitted = if self.flush_batched_submissions() {
                self.submit_batch(&batch)
            } else {
                Err(NeoError::SubmissionFailed("queued batches could not be flushed".into()))
            };
            match submitted {
                Ok(stamp) => {
                    self.submitted_state = self.state;
                    mark_used(&batch, self.os_context.context_id);
                    stamp
                }
                Err(e) => {
                    self.stream.rewind(start_offset);
                    self.state = self.submitted_state;
                    self.status = previous_status;
                    return Err(e);
                }
            }
        } else {
            mark_used(&batch, self.os_context.context_id);
            self.batched.push_back(QueuedBatch {
                batch,
                state: self.state,
            });
            self.status = previous_status;
            0
        };

        self.task_count = task_count;
        self.last_stamp = CompletionStamp {
            task_count,
            flush_stamp,
        };
        Ok(self.last_stamp)
    }

    fn flush_batched_submissions(&mut self) -> bool {
        while let Some(queued) = self.batched.pop_front() {
            if self.submit_batch(&queued.batch).is_err() {
                let dropped = self.batched.len() + 1;
                self.batched.clear();
                self.state = self.submitted_state;
                warn!(dropped, "dropping queued batches after a failed submission");
                return false;
            }
            self.submitted_state = queued.state;
        }
        true
    }

    fn task_count(&self) -> u32 {
        self.task_count
    }

    fn latest_flushed_task_count(&self) -> u32 {
        self.latest_flushed_task_count
    }

    fn completion_stamp(&self) -> CompletionStamp {
        self.last_stamp
    }

    fn hw_tag(&self) -> &TagBuffer {
        &self.tag
    }

    fn wait_for_completion_with_timeout(&mut self, enable_timeout: bool, timeout_us: i64, task_count: u32) -> bool {
        if task_count > self.latest_flushed_task_count && !self.flush_batched_submissions() {
            return false;
        }
        if task_count > self.latest_flushed_task_count {
            return false;
        }

        if !self.backend.wait_for_flush_stamp(self.latest_flush_stamp) {
            warn!(task_count, backend = self.backend.name(), "kernel wait failed");
        }
        let completed = base_wait_function(&self.tag, enable_timeout, timeout_us, task_count);
        if completed && self.tag.is_completed(self.latest_flushed_task_count) {
            self.status = CsrStatus::Idle;
        }
        completed
    }

    fn status(&self) -> CsrStatus {
        self.status
    }

    fn os_context(&self) -> &OsContext {
        &self.os_context
    }

    fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

impl<F: GfxFamily, B: SubmissionBackend> Drop for CommandStreamReceiverHw<F, B> {
    fn drop(&mut self) {
        self.batched.clear();
        if self.latest_flushed_task_count > 0
            && !self.device_lost
            && !base_wait_function(&self.tag, true, 1_000_000, self.latest_flushed_task_count)
        {
            warn!(
                task_count = self.latest_flushed_task_count,
                "destroying receiver with work still in flight"
            );
        }

        for allocation in [self.command_buffer.take(), self.tag_allocation.take()].into_iter().flatten() {
            match Arc::try_unwrap(allocation) {
                Ok(allocation) => self.memory_manager.free_graphics_memory(allocation),
                Err(shared) => warn!(id = shared.id(), "receiver allocation still referenced; leaving it pinned"),
            }
        }
    }
}
