use crate::command_stream::preamble::PreambleHelper;
use crate::debug_settings::DebugSettings;
use crate::hw_helper::{EngineInstance, EngineUsage, GfxFamily, HwHelper, HwHelperHw, L3Config};
use crate::hw_info::{EngineType, GfxCoreFamily, HardwareInfo, ProductFamily};

/// Tigerlake generation.
#[derive(Debug, Clone, Copy)]
pub struct Gen12LpFamily;

impl GfxFamily for Gen12LpFamily {
    const CORE_FAMILY: GfxCoreFamily = GfxCoreFamily::Gen12Lp;
    const NAME: &'static str = "Gen12LP";

    const L3_CONFIGS: &'static [L3Config] = &[L3Config {
        product: ProductFamily::TigerlakeLp,
        value_for_slm: 0xD000_0020,
        value_for_no_slm: 0xD000_0020,
    }];

    const THREAD_ARBITRATION_REGISTER: Option<u32> = None;
    const THREAD_ARBITRATION_MASK: u32 = 0;
    const THREAD_ARBITRATION_VALUES: [u32; 3] = [0; 3];

    const PIPELINE_SELECT_MEDIA_SAMPLER_DOP_CLOCK_GATE: bool = false;
    const RENDER_CACHE_FLUSH_BEFORE_VFE_ON_CCS: bool = false;
}

pub static GEN12LP_HW_HELPER: HwHelperHw<Gen12LpFamily> = HwHelperHw::new();

impl HwHelper for HwHelperHw<Gen12LpFamily> {
    fn core_family(&self) -> GfxCoreFamily {
        Gen12LpFamily::CORE_FAMILY
    }

    fn is_l3_configurable(&self, hw: &HardwareInfo) -> bool {
        PreambleHelper::<Gen12LpFamily>::is_l3_configurable(hw)
    }

    fn get_gpgpu_engine_instances(&self, hw: &HardwareInfo, _settings: &DebugSettings) -> Vec<EngineInstance> {
        let mut engines = vec![
            EngineInstance::new(hw.capability_table.default_engine_type, EngineUsage::Regular),
            EngineInstance::new(EngineType::Rcs, EngineUsage::LowPriority),
            EngineInstance::new(EngineType::Rcs, EngineUsage::Internal),
        ];

        if hw.feature_table.ftr_ccs_node && hw.capability_table.default_engine_type != EngineType::Ccs {
            engines.push(EngineInstance::new(EngineType::Ccs, EngineUsage::Regular));
        }
        if hw.capability_table.blitter_operations_supported {
            engines.push(EngineInstance::new(EngineType::Bcs, EngineUsage::Regular));
        }

        engines
    }

    fn is_page_table_manager_supported(&self, hw: &HardwareInfo) -> bool {
        hw.capability_table.ftr_render_compressed_buffers
            || hw.capability_table.ftr_render_compressed_images
    }
}
