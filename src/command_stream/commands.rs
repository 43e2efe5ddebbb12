#![allow(clippy::cast_possible_truncation)]

//! Encoders for the handful of GPU commands the receiver emits, plus a small
//! decoder used to inspect streams.

use crate::bit_helpers::{get_field, set_field};
use crate::error::{NeoError, NeoResult};

// ===============================================================================================
// Opcodes
// ===============================================================================================

pub const MI_NOOP: u32 = 0x0000_0000;
pub const MI_BATCH_BUFFER_END: u32 = 0x0500_0000;
pub const MI_LOAD_REGISTER_IMM: u32 = 0x1100_0001;
pub const PIPELINE_SELECT: u32 = 0x6904_0000;
pub const PIPE_CONTROL: u32 = 0x7A00_0004;
pub const MEDIA_VFE_STATE: u32 = 0x7000_0007;

pub const LOAD_REGISTER_IMM_DWORDS: usize = 3;
pub const PIPE_CONTROL_DWORDS: usize = 6;
pub const MEDIA_VFE_STATE_DWORDS: usize = 9;

pub const PIPELINE_SELECT_GPGPU: u32 = 2;
/// Mask bits making the pipeline selection field authoritative.
pub const PIPELINE_SELECT_ENABLE_MASK_BITS: u32 = 0x3;
/// Mask bit for the media sampler DOP clock gate field.
pub const MEDIA_SAMPLER_DOP_CLOCK_GATE_MASK_BITS: u32 = 0x10;

const MEDIA_SAMPLER_DOP_CLOCK_GATE_BIT: u32 = 4;

// PIPE_CONTROL dword 1
const PC_DEPTH_CACHE_FLUSH: u32 = 0;
const PC_STATE_CACHE_INVALIDATION: u32 = 2;
const PC_CONSTANT_CACHE_INVALIDATION: u32 = 3;
const PC_DC_FLUSH: u32 = 5;
const PC_TEXTURE_CACHE_INVALIDATION: u32 = 10;
const PC_INSTRUCTION_CACHE_INVALIDATION: u32 = 11;
const PC_RENDER_TARGET_CACHE_FLUSH: u32 = 12;
const PC_POST_SYNC_SHIFT: u32 = 14;
const PC_CS_STALL: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PostSyncOperation {
    #[default]
    NoWrite = 0,
    WriteImmediateData = 1,
    WriteTimestamp = 3,
}

impl PostSyncOperation {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::WriteImmediateData,
            3 => Self::WriteTimestamp,
            _ => Self::NoWrite,
        }
    }
}

// ===============================================================================================
// PIPE_CONTROL
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeControlArgs {
    pub cs_stall: bool,
    pub dc_flush: bool,
    pub render_target_cache_flush: bool,
    pub depth_cache_flush: bool,
    pub texture_cache_invalidation: bool,
    pub instruction_cache_invalidation: bool,
    pub constant_cache_invalidation: bool,
    pub state_cache_invalidation: bool,
    pub post_sync: PostSyncOperation,
    pub address: u64,
    pub immediate_data: u64,
}

impl PipeControlArgs {
    #[must_use]
    pub const fn cs_stall() -> Self {
        Self {
            cs_stall: true,
            dc_flush: false,
            render_target_cache_flush: false,
            depth_cache_flush: false,
            texture_cache_invalidation: false,
            instruction_cache_invalidation: false,
            constant_cache_invalidation: false,
            state_cache_invalidation: false,
            post_sync: PostSyncOperation::NoWrite,
            address: 0,
            immediate_data: 0,
        }
    }

    #[must_use]
    pub const fn with_dc_flush(mut self, enable: bool) -> Self {
        self.dc_flush = enable;
        self
    }

    #[must_use]
    pub const fn with_render_cache_flushes(mut self, enable: bool) -> Self {
        self.render_target_cache_flush = enable;
        self.depth_cache_flush = enable;
        self
    }

    #[must_use]
    pub const fn with_post_sync(mut self, op: PostSyncOperation, address: u64, data: u64) -> Self {
        self.post_sync = op;
        self.address = address;
        self.immediate_data = data;
        self
    }

    #[must_use]
    pub fn encode(&self) -> [u32; PIPE_CONTROL_DWORDS] {
        let flags = [
            (PC_DEPTH_CACHE_FLUSH, self.depth_cache_flush),
            (PC_STATE_CACHE_INVALIDATION, self.state_cache_invalidation),
            (PC_CONSTANT_CACHE_INVALIDATION, self.constant_cache_invalidation),
            (PC_DC_FLUSH, self.dc_flush),
            (PC_TEXTURE_CACHE_INVALIDATION, self.texture_cache_invalidation),
            (PC_INSTRUCTION_CACHE_INVALIDATION, self.instruction_cache_invalidation),
            (PC_RENDER_TARGET_CACHE_FLUSH, self.render_target_cache_flush),
            (PC_CS_STALL, self.cs_stall),
        ];
        let mut dw1 = flags
            .iter()
            .filter(|(_, on)| *on)
            .fold(0u32, |acc, (bit, _)| acc | (1 << bit));
        dw1 = set_field(dw1, PC_POST_SYNC_SHIFT, 2, self.post_sync as u32);

        [
            PIPE_CONTROL,
            dw1,
            self.address as u32 & !0x3,
            (self.address >> 32) as u32,
            self.immediate_data as u32,
            (self.immediate_data >> 32) as u32,
        ]
    }

    fn decode(dw: &[u32]) -> Self {
        let bit = |b: u32| dw[1] & (1 << b) != 0;
        Self {
            cs_stall: bit(PC_CS_STALL),
            dc_flush: bit(PC_DC_FLUSH),
            render_target_cache_flush: bit(PC_RENDER_TARGET_CACHE_FLUSH),
            depth_cache_flush: bit(PC_DEPTH_CACHE_FLUSH),
            texture_cache_invalidation: bit(PC_TEXTURE_CACHE_INVALIDATION),
            instruction_cache_invalidation: bit(PC_INSTRUCTION_CACHE_INVALIDATION),
            constant_cache_invalidation: bit(PC_CONSTANT_CACHE_INVALIDATION),
            state_cache_invalidation: bit(PC_STATE_CACHE_INVALIDATION),
            post_sync: PostSyncOperation::from_bits(get_field(dw[1], PC_POST_SYNC_SHIFT, 2)),
            address: u64::from(dw[2]) | (u64::from(dw[3]) << 32),
            immediate_data: u64::from(dw[4]) | (u64::from(dw[5]) << 32),
        }
    }
}

// ===============================================================================================
// Other Commands
// ===============================================================================================

#[must_use]
pub const fn load_register_imm(register: u32, value: u32) -> [u32; LOAD_REGISTER_IMM_DWORDS] {
    [MI_LOAD_REGISTER_IMM, register, value]
}

#[must_use]
pub const fn pipeline_select(selection: u32, mask_bits: u32, media_sampler_dop_clock_gate: bool) -> u32 {
    let dw = set_field(PIPELINE_SELECT, 0, 2, selection);
    let dw = set_field(dw, MEDIA_SAMPLER_DOP_CLOCK_GATE_BIT, 1, media_sampler_dop_clock_gate as u32);
    set_field(dw, 8, 8, mask_bits)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaVfeStateArgs {
    pub scratch_address: u64,
    /// Encoded as log2(bytes / 1 KiB).
    pub per_thread_scratch_space: u32,
    pub max_threads: u32,
    pub number_of_urb_entries: u32,
}

impl MediaVfeStateArgs {
    #[must_use]
    pub const fn encode(&self) -> [u32; MEDIA_VFE_STATE_DWORDS] {
        let dw1 = (self.scratch_address as u32 & !0x3FF) | (self.per_thread_scratch_space & 0xF);
        let dw3 = set_field(0, 16, 16, self.max_threads);
        let dw3 = set_field(dw3, 8, 8, self.number_of_urb_entries);
        [
            MEDIA_VFE_STATE,
            dw1,
            (self.scratch_address >> 32) as u32,
            dw3,
            0,
            0,
            0,
            0,
            0,
        ]
    }
}

/// Encodes a per-thread scratch size in bytes into the VFE field.
#[must_use]
pub const fn per_thread_scratch_space_field(bytes: u32) -> u32 {
    if bytes <= 1024 {
        return 0;
    }
    (bytes.next_power_of_two() / 1024).trailing_zeros()
}

// ===============================================================================================
// Decoding
// ===============================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Noop,
    BatchBufferEnd,
    LoadRegisterImm {
        register: u32,
        value: u32,
    },
    PipelineSelect {
        selection: u32,
        mask_bits: u32,
        media_sampler_dop_clock_gate: bool,
    },
    PipeControl(PipeControlArgs),
    MediaVfeState {
        scratch_address_low: u32,
        per_thread_scratch_space: u32,
        max_threads: u32,
    },
    Unknown(u32),
}

fn command_length(header: u32) -> usize {
    match header >> 29 {
        // MI commands
        0 => match header {
            MI_NOOP | MI_BATCH_BUFFER_END => 1,
            _ => (header & 0x3F) as usize + 2,
        },
        3 if header & 0xFFFF_0000 == PIPELINE_SELECT => 1,
        _ => (header & 0xFF) as usize + 2,
    }
}

/// Splits `dwords` into commands. Unrecognized commands are reported as
/// [`ParsedCommand::Unknown`] and skipped by their length field.
///
/// # Errors
/// Returns `Driver` if a command runs past the end of the buffer.
pub fn parse_commands(dwords: &[u32]) -> NeoResult<Vec<ParsedCommand>> {
    let mut commands = Vec::new();
    let mut offset = 0;

    while offset < dwords.len() {
        let header = dwords[offset];
        let len = command_length(header);
        let Some(dw) = dwords.get(offset..offset + len) else {
            return Err(NeoError::Driver(format!(
                "command 0x{header:08x} at dword {offset} is truncated"
            )));
        };

        let parsed = if header == MI_NOOP {
            ParsedCommand::Noop
        } else if header == MI_BATCH_BUFFER_END {
            ParsedCommand::BatchBufferEnd
        } else if header == MI_LOAD_REGISTER_IMM {
            ParsedCommand::LoadRegisterImm {
                register: dw[1],
                value: dw[2],
            }
        } else if header & 0xFFFF_0000 == PIPELINE_SELECT {
            ParsedCommand::PipelineSelect {
                selection: get_field(header, 0, 2),
                mask_bits: get_field(header, 8, 8),
                media_sampler_dop_clock_gate: get_field(header, MEDIA_SAMPLER_DOP_CLOCK_GATE_BIT, 1) != 0,
            }
        } else if header == PIPE_CONTROL {
            ParsedCommand::PipeControl(PipeControlArgs::decode(dw))
        } else if header == MEDIA_VFE_STATE {
            ParsedCommand::MediaVfeState {
                scratch_address_low: dw[1] & !0x3FF,
                per_thread_scratch_space: dw[1] & 0xF,
                max_threads: get_field(dw[3], 16, 16),
            }
        } else {
            ParsedCommand::Unknown(header)
        };

        commands.push(parsed);
        offset += len;
    }

    Ok(commands)
}
