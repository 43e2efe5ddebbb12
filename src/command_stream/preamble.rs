use crate::command_stream::commands::{
    LOAD_REGISTER_IMM_DWORDS, MEDIA_SAMPLER_DOP_CLOCK_GATE_MASK_BITS, MEDIA_VFE_STATE_DWORDS,
    MediaVfeStateArgs, PIPE_CONTROL_DWORDS, PIPELINE_SELECT_ENABLE_MASK_BITS, PIPELINE_SELECT_GPGPU,
    PipeControlArgs, load_register_imm, per_thread_scratch_space_field, pipeline_select,
};
use crate::command_stream::linear_stream::LinearStream;
use crate::hw_helper::{GfxFamily, HwHelper};
use crate::hw_info::{EngineType, HardwareInfo, ThreadArbitrationPolicy};
use std::marker::PhantomData;

/// `L3SQC_REG4` and its LQSC read-only performance disable bit.
const L3SQC_REG4: u32 = 0xB118;
const L3SQC_BIT_LQSC_RO_PERF_DIS: u32 = 0x0800_0000;

const URB_ENTRIES_FOR_VFE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineSelectArgs {
    pub media_sampler_required: bool,
}

pub struct PreambleHelper<F>(PhantomData<fn() -> F>);

impl<F: GfxFamily> PreambleHelper<F> {
    // ===========================================================================================
    // L3 Configuration
    // ===========================================================================================

    /// L3 register value for the product; products missing from the family
    /// table get the first entry's SLM configuration.
    #[must_use]
    pub fn get_l3_config(hw: &HardwareInfo, use_slm: bool) -> u32 {
        let product = hw.platform.product_family;
        match F::L3_CONFIGS.iter().find(|c| c.product == product) {
            Some(config) if use_slm => config.value_for_slm,
            Some(config) => config.value_for_no_slm,
            None => F::L3_CONFIGS.first().map_or(0, |c| c.value_for_slm),
        }
    }

    #[must_use]
    pub fn is_l3_configurable(hw: &HardwareInfo) -> bool {
        Self::get_l3_config(hw, true) != Self::get_l3_config(hw, false)
    }

    pub fn program_l3(stream: &mut LinearStream, l3_config: u32) {
        stream.emit(&load_register_imm(F::L3CNTL_REGISTER, l3_config));
    }

    // ===========================================================================================
    // Pipeline Select & VFE
    // ===========================================================================================

    #[must_use]
    pub const fn get_cmd_size_for_pipeline_select() -> usize {
        4
    }

    pub fn program_pipeline_select(stream: &mut LinearStream, args: &PipelineSelectArgs, _hw: &HardwareInfo) {
        let (mask, gate) = if F::PIPELINE_SELECT_MEDIA_SAMPLER_DOP_CLOCK_GATE {
            (
                PIPELINE_SELECT_ENABLE_MASK_BITS | MEDIA_SAMPLER_DOP_CLOCK_GATE_MASK_BITS,
                !args.media_sampler_required,
            )
        } else {
            (PIPELINE_SELECT_ENABLE_MASK_BITS, false)
        };
        stream.emit(&[pipeline_select(PIPELINE_SELECT_GPGPU, mask, gate)]);
    }

    pub fn add_pipe_control_before_vfe_cmd(stream: &mut LinearStream, hw: &HardwareInfo, engine: EngineType) {
        let flush = hw.workaround_table.wa_send_mi_flush_before_vfe;
        let render_flush = flush && (engine != EngineType::Ccs || F::RENDER_CACHE_FLUSH_BEFORE_VFE_ON_CCS);

        let pc = PipeControlArgs::cs_stall()
            .with_dc_flush(flush)
            .with_render_cache_flushes(render_flush);
        stream.emit(&pc.encode());
    }

    #[must_use]
    pub const fn get_vfe_commands_size() -> usize {
        (PIPE_CONTROL_DWORDS + MEDIA_VFE_STATE_DWORDS) * 4
    }

    /// Emits `MEDIA_VFE_STATE` preceded by the pipe control it requires.
    pub fn program_vfe_state(
        stream: &mut LinearStream,
        hw: &HardwareInfo,
        helper: &dyn HwHelper,
        engine: EngineType,
        scratch_address: u64,
        per_thread_scratch_size: u32,
    ) {
        Self::add_pipe_control_before_vfe_cmd(stream, hw, engine);

        let vfe = MediaVfeStateArgs {
            scratch_address,
            per_thread_scratch_space: per_thread_scratch_space_field(per_thread_scratch_size),
            max_threads: helper.get_max_threads_for_vfe(hw),
            number_of_urb_entries: URB_ENTRIES_FOR_VFE,
        };
        stream.emit(&vfe.encode());
    }

    // ===========================================================================================
    // Thread Arbitration
    // ===========================================================================================

    #[must_use]
    pub const fn get_thread_arbitration_commands_size() -> usize {
        match F::THREAD_ARBITRATION_REGISTER {
            Some(_) => (PIPE_CONTROL_DWORDS + LOAD_REGISTER_IMM_DWORDS) * 4,
            None => 0,
        }
    }

    /// # Panics
    /// Panics for [`ThreadArbitrationPolicy::NotPresent`].
    pub fn program_thread_arbitration(stream: &mut LinearStream, policy: ThreadArbitrationPolicy) {
        assert_ne!(
            policy,
            ThreadArbitrationPolicy::NotPresent,
            "cannot program a not-present thread arbitration policy"
        );

        let Some(register) = F::THREAD_ARBITRATION_REGISTER else {
            return;
        };
        let value = match policy {
            ThreadArbitrationPolicy::AgeBased => F::THREAD_ARBITRATION_VALUES[0],
            ThreadArbitrationPolicy::RoundRobin => F::THREAD_ARBITRATION_VALUES[1],
            _ => F::THREAD_ARBITRATION_VALUES[2],
        };

        stream.emit(&PipeControlArgs::cs_stall().encode());
        stream.emit(&load_register_imm(register, (F::THREAD_ARBITRATION_MASK << 16) | value));
    }

    // ===========================================================================================
    // Preamble
    // ===========================================================================================

    #[must_use]
    pub const fn get_additional_commands_size(hw: &HardwareInfo) -> usize {
        if hw.workaround_table.wa_disable_lsqc_ro_perf_for_ocl {
            LOAD_REGISTER_IMM_DWORDS * 4
        } else {
            0
        }
    }

    #[must_use]
    pub const fn get_preamble_size(hw: &HardwareInfo) -> usize {
        LOAD_REGISTER_IMM_DWORDS * 4
            + Self::get_thread_arbitration_commands_size()
            + Self::get_additional_commands_size(hw)
    }

    /// L3 configuration, thread arbitration (skipped for `NotPresent`) and
    /// workaround programming for a fresh context.
    pub fn program_preamble(
        stream: &mut LinearStream,
        hw: &HardwareInfo,
        l3_config: u32,
        policy: ThreadArbitrationPolicy,
    ) {
        Self::program_l3(stream, l3_config);
        if policy != ThreadArbitrationPolicy::NotPresent {
            Self::program_thread_arbitration(stream, policy);
        }
        if hw.workaround_table.wa_disable_lsqc_ro_perf_for_ocl {
            stream.emit(&load_register_imm(L3SQC_REG4, L3SQC_BIT_LQSC_RO_PERF_DIS));
        }
    }
}
