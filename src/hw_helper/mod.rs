//! Per-generation capability queries.
//!
//! Every compiled-in core family has exactly one [`HwHelper`] singleton,
//! looked up through [`get`] with the family taken from [`HardwareInfo`].
//! The trait's provided methods are the shared behavior; each family
//! overrides the subset where its hardware differs.

pub mod family;
#[cfg(feature = "gen11")]
pub mod gen11;
#[cfg(feature = "gen12lp")]
pub mod gen12lp;
#[cfg(feature = "gen9")]
pub mod gen9;
mod registry;

pub use family::{GfxFamily, HwHelperHw, L3Config};
pub use registry::{get, init, try_get};

use crate::debug_settings::{DebugSettings, flag_override};
use crate::hw_info::products;
use crate::hw_info::{EngineType, GfxCoreFamily, HardwareInfo, ProductFamily, ThreadArbitrationPolicy};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineUsage {
    Regular,
    LowPriority,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineInstance {
    pub engine_type: EngineType,
    pub usage: EngineUsage,
}

impl EngineInstance {
    #[must_use]
    pub const fn new(engine_type: EngineType, usage: EngineUsage) -> Self {
        Self { engine_type, usage }
    }
}

/// Index of the default submission engine in [`HwHelper::get_gpgpu_engine_instances`].
pub const DEFAULT_ENGINE_INDEX: usize = 0;
/// Index of the engine reserved for low priority contexts.
pub const LOW_PRIORITY_ENGINE_INDEX: usize = 1;

pub trait HwHelper: Send + Sync + fmt::Debug {
    fn core_family(&self) -> GfxCoreFamily;

    /// Whether the L3 configuration differs between SLM and non-SLM workloads.
    fn is_l3_configurable(&self, hw: &HardwareInfo) -> bool;

    fn render_compressed_buffers_supported(&self, hw: &HardwareInfo, settings: &DebugSettings) -> bool {
        flag_override(settings.render_compressed_buffers_enabled)
            .unwrap_or(hw.capability_table.ftr_render_compressed_buffers)
    }

    fn render_compressed_images_supported(&self, hw: &HardwareInfo, settings: &DebugSettings) -> bool {
        flag_override(settings.render_compressed_images_enabled)
            .unwrap_or(hw.capability_table.ftr_render_compressed_images)
    }

    fn cache_flush_after_walker_supported(&self, hw: &HardwareInfo, settings: &DebugSettings) -> bool {
        match settings.enable_cache_flush_after_walker {
            1 => true,
            0 => false,
            _ => hw.capability_table.support_cache_flush_after_walker,
        }
    }

    fn get_max_threads_for_vfe(&self, hw: &HardwareInfo) -> u32 {
        let gt = &hw.gt_system_info;
        if gt.eu_count == 0 {
            return 0;
        }
        let threads_per_eu = gt.thread_count / gt.eu_count
            + hw.capability_table.extra_quantity_threads_per_eu;
        gt.eu_count * threads_per_eu
    }

    fn get_max_threads_for_workgroup(&self, hw: &HardwareInfo, max_eus_per_subslice: u32) -> u32 {
        let gt = &hw.gt_system_info;
        if gt.eu_count == 0 {
            return 0;
        }
        max_eus_per_subslice * (gt.thread_count / gt.eu_count)
    }

    fn get_compute_units_used_for_scratch(&self, hw: &HardwareInfo) -> u32 {
        let gt = &hw.gt_system_info;
        if gt.eu_count == 0 {
            return 0;
        }
        gt.max_sub_slices_supported * gt.max_eu_per_sub_slice * gt.thread_count / gt.eu_count
    }

    /// Engines usable for GPGPU work. Index 0 is the default submission
    /// engine and index 1 is reserved for low priority contexts.
    fn get_gpgpu_engine_instances(&self, hw: &HardwareInfo, _settings: &DebugSettings) -> Vec<EngineInstance> {
        vec![
            EngineInstance::new(hw.capability_table.default_engine_type, EngineUsage::Regular),
            EngineInstance::new(EngineType::Rcs, EngineUsage::LowPriority),
            EngineInstance::new(EngineType::Rcs, EngineUsage::Internal),
        ]
    }

    fn get_sub_devices_count(&self, _hw: &HardwareInfo, settings: &DebugSettings) -> u32 {
        u32::try_from(settings.create_multiple_sub_devices)
            .ok()
            .filter(|&count| count > 0)
            .unwrap_or(1)
    }

    fn get_engines_count(&self, hw: &HardwareInfo, settings: &DebugSettings) -> u32 {
        if !hw.feature_table.ftr_ccs_node {
            return 1;
        }
        if let Ok(count) = u32::try_from(settings.zex_number_of_ccs)
            && count > 0
        {
            return count;
        }
        hw.gt_system_info.ccs_info.number_of_ccs_enabled.max(1)
    }

    fn get_default_thread_arbitration_policy(&self) -> ThreadArbitrationPolicy {
        ThreadArbitrationPolicy::AgeBased
    }

    /// Arbitration policy to program: the debug override when it names a
    /// valid policy, otherwise the product default.
    fn get_thread_arbitration_policy(&self, hw: &HardwareInfo, settings: &DebugSettings) -> ThreadArbitrationPolicy {
        ThreadArbitrationPolicy::from_raw(settings.override_thread_arbitration_policy)
            .unwrap_or(hw.capability_table.default_thread_arbitration_policy)
    }

    fn is_page_table_manager_supported(&self, _hw: &HardwareInfo) -> bool {
        false
    }

    fn hw_info_config_supported(&self, product: ProductFamily) -> bool {
        products::descriptor(product).is_some_and(|d| d.core_family == self.core_family())
    }
}
