use crate::command_stream::preamble::PreambleHelper;
use crate::hw_helper::{GfxFamily, HwHelper, HwHelperHw, L3Config};
use crate::hw_info::{GfxCoreFamily, HardwareInfo, ProductFamily};

/// Skylake generation.
#[derive(Debug, Clone, Copy)]
pub struct Gen9Family;

impl GfxFamily for Gen9Family {
    const CORE_FAMILY: GfxCoreFamily = GfxCoreFamily::Gen9;
    const NAME: &'static str = "Gen9";

    const L3_CONFIGS: &'static [L3Config] = &[L3Config {
        product: ProductFamily::Skylake,
        value_for_slm: 0x6000_0121,
        value_for_no_slm: 0x8000_0140,
    }];

    // DEBUG_CONTROL_REG2
    const THREAD_ARBITRATION_REGISTER: Option<u32> = Some(0xE404);
    const THREAD_ARBITRATION_MASK: u32 = 0x100;
    const THREAD_ARBITRATION_VALUES: [u32; 3] = [0x0, 0x100, 0x100];

    const PIPELINE_SELECT_MEDIA_SAMPLER_DOP_CLOCK_GATE: bool = true;
    const RENDER_CACHE_FLUSH_BEFORE_VFE_ON_CCS: bool = true;
}

pub static GEN9_HW_HELPER: HwHelperHw<Gen9Family> = HwHelperHw::new();

impl HwHelper for HwHelperHw<Gen9Family> {
    fn core_family(&self) -> GfxCoreFamily {
        Gen9Family::CORE_FAMILY
    }

    fn is_l3_configurable(&self, hw: &HardwareInfo) -> bool {
        PreambleHelper::<Gen9Family>::is_l3_configurable(hw)
    }
}
