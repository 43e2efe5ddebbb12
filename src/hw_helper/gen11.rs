use crate::command_stream::preamble::PreambleHelper;
use crate::hw_helper::{GfxFamily, HwHelper, HwHelperHw, L3Config};
use crate::hw_info::{GfxCoreFamily, HardwareInfo, ProductFamily, ThreadArbitrationPolicy};

/// Icelake generation.
#[derive(Debug, Clone, Copy)]
pub struct Gen11Family;

impl GfxFamily for Gen11Family {
    const CORE_FAMILY: GfxCoreFamily = GfxCoreFamily::Gen11;
    const NAME: &'static str = "Gen11";

    const L3_CONFIGS: &'static [L3Config] = &[L3Config {
        product: ProductFamily::IcelakeLp,
        value_for_slm: 0xB000_0821,
        value_for_no_slm: 0xD000_0020,
    }];

    // RowChickenReg4
    const THREAD_ARBITRATION_REGISTER: Option<u32> = Some(0xE48C);
    const THREAD_ARBITRATION_MASK: u32 = 0x180;
    const THREAD_ARBITRATION_VALUES: [u32; 3] = [0x0, 0x80, 0x100];

    const PIPELINE_SELECT_MEDIA_SAMPLER_DOP_CLOCK_GATE: bool = true;
    const RENDER_CACHE_FLUSH_BEFORE_VFE_ON_CCS: bool = true;
}

pub static GEN11_HW_HELPER: HwHelperHw<Gen11Family> = HwHelperHw::new();

/// Scratch is sized for eight threads per EU regardless of the fused topology.
const SCRATCH_THREADS_PER_EU: u32 = 8;

impl HwHelper for HwHelperHw<Gen11Family> {
    fn core_family(&self) -> GfxCoreFamily {
        Gen11Family::CORE_FAMILY
    }

    fn is_l3_configurable(&self, hw: &HardwareInfo) -> bool {
        PreambleHelper::<Gen11Family>::is_l3_configurable(hw)
    }

    fn get_compute_units_used_for_scratch(&self, hw: &HardwareInfo) -> u32 {
        let gt = &hw.gt_system_info;
        gt.max_sub_slices_supported * gt.max_eu_per_sub_slice * SCRATCH_THREADS_PER_EU
    }

    fn get_default_thread_arbitration_policy(&self) -> ThreadArbitrationPolicy {
        ThreadArbitrationPolicy::RoundRobinAfterDependency
    }
}
