use crate::command_stream::completion::TagBuffer;
use crate::command_stream::receiver::{BatchBuffer, SubmissionBackend};
use crate::error::NeoResult;
use crate::hw_info::EngineType;
use std::collections::VecDeque;
use tracing::trace;

/// Memory bank the simulated device writes to.
pub const DEFAULT_BANK: u32 = 1;

/// Sink for the memory writes and batch submissions of a simulated device.
pub trait AubStream: Send {
    fn write_memory(&mut self, gpu_address: u64, data: &[u8], bank: u32);
    fn submit_batch_buffer(&mut self, gpu_address: u64, engine: EngineType);
    fn poll_for_completion(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AubRecord {
    MemoryWrite { gpu_address: u64, data: Vec<u8>, bank: u32 },
    BatchBuffer { gpu_address: u64, engine: EngineType },
    PollForCompletion,
}

/// Records an [`AubMemoryStream`] keeps unless told otherwise.
pub const DEFAULT_RECORD_LIMIT: usize = 4096;

/// An [`AubStream`] that keeps the most recent records in memory.
///
/// Once `limit` records are held, each new record displaces the oldest.
#[derive(Debug)]
pub struct AubMemoryStream {
    records: VecDeque<AubRecord>,
    limit: usize,
    discarded: u64,
}

impl Default for AubMemoryStream {
    fn default() -> Self {
        Self::with_limit(DEFAULT_RECORD_LIMIT)
    }
}

impl AubMemoryStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit: limit.max(1),
            discarded: 0,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &AubRecord> {
        self.records.iter()
    }

    /// Hands over every held record, oldest first.
    pub fn drain(&mut self) -> Vec<AubRecord> {
        self.records.drain(..).collect()
    }

    /// Records displaced by the limit so far.
    #[must_use]
    pub const fn discarded(&self) -> u64 {
        self.discarded
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, AubRecord::BatchBuffer { .. }))
            .count()
    }

    fn push(&mut self, record: AubRecord) {
        if self.records.len() == self.limit {
            self.records.pop_front();
            self.discarded += 1;
        }
        self.records.push_back(record);
    }
}

impl AubStream for AubMemoryStream {
    fn write_memory(&mut self, gpu_address: u64, data: &[u8], bank: u32) {
        self.push(AubRecord::MemoryWrite {
            gpu_address,
            data: data.to_vec(),
            bank,
        });
    }

    fn submit_batch_buffer(&mut self, gpu_address: u64, engine: EngineType) {
        self.push(AubRecord::BatchBuffer { gpu_address, engine });
    }

    fn poll_for_completion(&mut self) {
        self.push(AubRecord::PollForCompletion);
    }
}

/// Backend of the simulated device.
///
/// Writes each allocation the first time a batch references it, then the
/// batch itself. Nothing executes the batch, so the backend completes the
/// task by writing the tag. Waiting adds one completion poll per newly
/// sent batch.
pub struct AubBackend<A: AubStream> {
    stream: A,
    writes_tag: bool,
    latest_sent_task_count: u32,
    polled_task_count: u32,
}

impl<A: AubStream> AubBackend<A> {
    #[must_use]
    pub const fn new(stream: A) -> Self {
        Self {
            stream,
            writes_tag: true,
            latest_sent_task_count: 0,
            polled_task_count: 0,
        }
    }

    /// Records batches without completing them; used to mirror another
    /// backend's submissions.
    #[must_use]
    pub const fn dump_only(stream: A) -> Self {
        Self {
            stream,
            writes_tag: false,
            latest_sent_task_count: 0,
            polled_task_count: 0,
        }
    }

    #[must_use]
    pub const fn stream(&self) -> &A {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut A {
        &mut self.stream
    }

    /// Polls for the latest sent batch unless that was already done.
    pub fn poll_for_completion(&mut self) {
        if self.polled_task_count == self.latest_sent_task_count {
            return;
        }
        self.polled_task_count = self.latest_sent_task_count;
        self.stream.poll_for_completion();
    }
}

impl<A: AubStream> SubmissionBackend for AubBackend<A> {
    fn name(&self) -> &'static str {
        "aub"
    }

    fn submit(&mut self, batch: &BatchBuffer, commands: &[u8], tag: &TagBuffer) -> NeoResult<u64> {
        for allocation in &batch.residency {
            if !allocation.is_aub_writable(DEFAULT_BANK) {
                continue;
            }
            // SAFETY: allocations in a batch's residency list are kept alive
            // by their owners until the batch completes.
            let bytes = unsafe { allocation.host_bytes() };
            self.stream.write_memory(allocation.gpu_address(), bytes, DEFAULT_BANK);
            allocation.set_aub_writable(false, DEFAULT_BANK);
        }

        self.stream.write_memory(batch.gpu_address(), commands, DEFAULT_BANK);
        self.stream
            .submit_batch_buffer(batch.gpu_address(), batch.os_context.engine.engine_type);
        self.latest_sent_task_count = batch.task_count;

        if self.writes_tag {
            tag.store(batch.task_count);
        }
        trace!(task_count = batch.task_count, bytes = commands.len(), "batch written to aub stream");
        Ok(u64::from(batch.task_count))
    }

    fn wait_for_flush_stamp(&mut self, _flush_stamp: u64) -> bool {
        self.poll_for_completion();
        true
    }
}
