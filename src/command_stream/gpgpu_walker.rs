use crate::command_stream::commands::{PIPE_CONTROL_DWORDS, PipeControlArgs, PostSyncOperation};
use crate::command_stream::linear_stream::LinearStream;
use crate::debug_settings::DebugSettings;
use crate::hw_helper::{GfxFamily, HwHelper};
use crate::hw_info::HardwareInfo;
use std::marker::PhantomData;

/// Byte offset of the end timestamp inside a profiling timestamp slot.
pub const PROFILING_END_OFFSET: u64 = 8;

pub struct GpgpuWalkerHelper<F>(PhantomData<fn() -> F>);

impl<F: GfxFamily> GpgpuWalkerHelper<F> {
    #[must_use]
    pub fn get_size_for_cache_flush_after_walker(
        hw: &HardwareInfo,
        helper: &dyn HwHelper,
        settings: &DebugSettings,
    ) -> usize {
        if helper.cache_flush_after_walker_supported(hw, settings) {
            PIPE_CONTROL_DWORDS * 4
        } else {
            0
        }
    }

    /// Flushes the data cache after a walker when the hardware or the
    /// override asks for it. Returns whether anything was emitted.
    pub fn program_cache_flush_after_walker(
        stream: &mut LinearStream,
        hw: &HardwareInfo,
        helper: &dyn HwHelper,
        settings: &DebugSettings,
    ) -> bool {
        if !helper.cache_flush_after_walker_supported(hw, settings) {
            return false;
        }
        stream.emit(&PipeControlArgs::cs_stall().with_dc_flush(true).encode());
        true
    }

    #[must_use]
    pub const fn get_profiling_commands_size() -> usize {
        2 * PIPE_CONTROL_DWORDS * 4
    }

    /// Writes the context start timestamp to `timestamp_address`.
    pub fn dispatch_profiling_commands_start(stream: &mut LinearStream, timestamp_address: u64) {
        let pc = PipeControlArgs::default().with_post_sync(
            PostSyncOperation::WriteTimestamp,
            timestamp_address,
            0,
        );
        stream.emit(&pc.encode());
    }

    /// Stalls until the walker retires, then writes the end timestamp to
    /// `timestamp_address + PROFILING_END_OFFSET`.
    pub fn dispatch_profiling_commands_end(stream: &mut LinearStream, timestamp_address: u64) {
        let pc = PipeControlArgs::cs_stall().with_post_sync(
            PostSyncOperation::WriteTimestamp,
            timestamp_address + PROFILING_END_OFFSET,
            0,
        );
        stream.emit(&pc.encode());
    }
}
