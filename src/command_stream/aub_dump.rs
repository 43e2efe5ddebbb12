use crate::command_stream::aub::{AubBackend, AubStream};
use crate::command_stream::completion::TagBuffer;
use crate::command_stream::receiver::{BatchBuffer, SubmissionBackend};
use crate::error::NeoResult;
use crate::os::OsContext;
use tracing::warn;

/// Submits through `B` and mirrors every batch into an AUB stream.
///
/// The mirror is written whether or not `B` accepted the batch; the
/// caller always sees `B`'s result. Waits poll the mirror after `B`.
pub struct AubDumpBackend<B: SubmissionBackend, A: AubStream> {
    base: B,
    aub: AubBackend<A>,
}

impl<B: SubmissionBackend, A: AubStream> AubDumpBackend<B, A> {
    #[must_use]
    pub const fn new(base: B, stream: A) -> Self {
        Self {
            base,
            aub: AubBackend::dump_only(stream),
        }
    }

    #[must_use]
    pub const fn base(&self) -> &B {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B {
        &mut self.base
    }

    #[must_use]
    pub const fn aub_stream(&self) -> &A {
        self.aub.stream()
    }
}

impl<B: SubmissionBackend, A: AubStream> SubmissionBackend for AubDumpBackend<B, A> {
    fn name(&self) -> &'static str {
        self.base.name()
    }

    fn initialize(&mut self, os_context: &OsContext) -> NeoResult<()> {
        self.base.initialize(os_context)
    }

    fn submit(&mut self, batch: &BatchBuffer, commands: &[u8], tag: &TagBuffer) -> NeoResult<u64> {
        let result = self.base.submit(batch, commands, tag);
        if let Err(e) = self.aub.submit(batch, commands, tag) {
            warn!(task_count = batch.task_count, "aub mirror failed: {e}");
        }
        result
    }

    fn wait_for_flush_stamp(&mut self, flush_stamp: u64) -> bool {
        let completed = self.base.wait_for_flush_stamp(flush_stamp);
        self.aub.poll_for_completion();
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_stream::aub::{AubMemoryStream, AubRecord};
    use crate::command_stream::receiver::tests::RecordingBackend;
    use crate::command_stream::receiver::{CommandStreamReceiver, CommandStreamReceiverHw, DispatchFlags};
    use crate::debug_settings::DebugSettings;
    use crate::error::NeoError;
    use crate::hw_helper::gen9::Gen9Family;
    use crate::hw_helper::tests::hw_info;
    use crate::hw_helper::{EngineInstance, EngineUsage};
    use crate::hw_info::{EngineType, ProductFamily};
    use crate::memory::OsAgnosticMemoryManager;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn receiver() -> CommandStreamReceiverHw<Gen9Family, AubDumpBackend<RecordingBackend, AubMemoryStream>> {
        let base = RecordingBackend {
            complete: true,
            ..RecordingBackend::default()
        };
        CommandStreamReceiverHw::new(
            Arc::new(hw_info(ProductFamily::Skylake)),
            Arc::new(DebugSettings::default()),
            Arc::new(OsAgnosticMemoryManager::new()),
            OsContext::new(0, EngineInstance::new(EngineType::Rcs, EngineUsage::Regular)),
            AubDumpBackend::new(base, AubMemoryStream::new()),
        )
        .unwrap()
    }

    fn polls(backend: &AubDumpBackend<RecordingBackend, AubMemoryStream>) -> usize {
        backend
            .aub_stream()
            .records()
            .filter(|r| matches!(r, AubRecord::PollForCompletion))
            .count()
    }

    #[test]
    fn batches_are_mirrored_and_waits_poll_the_mirror() {
        let mut csr = receiver();
        let stamp = csr.flush_task(&[], &DispatchFlags::default(), &[]).unwrap();

        assert_eq!(csr.backend().base().submitted.len(), 1);
        assert_eq!(csr.backend().aub_stream().batch_count(), 1);
        assert_eq!(polls(csr.backend()), 0);

        assert!(csr.wait_for_completion_with_timeout(true, 1000, stamp.task_count));
        assert_eq!(polls(csr.backend()), 1);
    }

    #[test]
    fn base_rejection_is_reported_but_still_mirrored() {
        let mut csr = receiver();
        csr.backend_mut().base_mut().fail_next = Some(NeoError::SubmissionFailed("rejected".into()));

        assert!(csr.flush_task(&[], &DispatchFlags::default(), &[]).is_err());
        assert!(csr.backend().base().submitted.is_empty());
        assert_eq!(csr.backend().aub_stream().batch_count(), 1);
    }
}
