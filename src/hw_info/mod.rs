pub mod config;
pub mod products;

pub use config::{HwConfig, setup_hardware_info};
pub use products::{DeviceIdLookup, find_device, hardware_info_for_device};

// ===============================================================================================
// Identity Enums
// ===============================================================================================

/// A specific SKU line within a core family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ProductFamily {
    #[default]
    Unknown,
    Skylake,
    IcelakeLp,
    TigerlakeLp,
}

impl ProductFamily {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Skylake => "skl",
            Self::IcelakeLp => "icllp",
            Self::TigerlakeLp => "tgllp",
        }
    }

    /// Resolves a short product name (`"skl"`, `"icllp"`, `"tgllp"`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "skl" | "skylake" => Some(Self::Skylake),
            "icllp" | "icelake_lp" => Some(Self::IcelakeLp),
            "tgllp" | "tigerlake_lp" => Some(Self::TigerlakeLp),
            _ => None,
        }
    }
}

/// A hardware generation sharing one command-encoding ABI.
///
/// The discriminant doubles as the slot index in the helper registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum GfxCoreFamily {
    Gen9 = 0,
    Gen11 = 1,
    Gen12Lp = 2,
}

impl GfxCoreFamily {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::Gen9, Self::Gen11, Self::Gen12Lp];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Hardware engine classes a context can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EngineType {
    /// Render command streamer.
    #[default]
    Rcs,
    /// Blitter (copy) command streamer.
    Bcs,
    /// Compute command streamer.
    Ccs,
}

/// Thread arbitration policies the EU scheduler can be programmed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum ThreadArbitrationPolicy {
    AgeBased = 0,
    #[default]
    RoundRobin = 1,
    RoundRobinAfterDependency = 2,
    NotPresent = -1,
}

impl ThreadArbitrationPolicy {
    /// Maps a raw override value; anything unknown is `None`.
    #[must_use]
    pub const fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::AgeBased),
            1 => Some(Self::RoundRobin),
            2 => Some(Self::RoundRobinAfterDependency),
            _ => None,
        }
    }
}

// ===============================================================================================
// Hardware Description
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Platform {
    pub product_family: ProductFamily,
    pub render_core_family: Option<GfxCoreFamily>,
    pub device_id: u16,
    pub revision_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CcsInfo {
    pub is_valid: bool,
    pub number_of_ccs_enabled: u32,
}

/// Topology counters (`GT_SYSTEM_INFO`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GtSystemInfo {
    pub slice_count: u32,
    pub sub_slice_count: u32,
    pub eu_count: u32,
    pub thread_count: u32,
    pub max_eu_per_sub_slice: u32,
    pub max_slices_supported: u32,
    pub max_sub_slices_supported: u32,
    pub l3_bank_count: u32,
    pub ccs_info: CcsInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureTable {
    pub ftr_ccs_node: bool,
    pub ftr_ppgtt: bool,
    pub ftr_svm: bool,
    pub ftr_e2e_compression: bool,
    pub ftr_local_memory: bool,
    pub ftr_gp_gpu_mid_thread_level_preempt: bool,
    pub ftr_l3_ia_coherency: bool,
    pub ftr_64k_pages: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkaroundTable {
    pub wa_send_mi_flush_before_vfe: bool,
    pub wa_disable_lsqc_ro_perf_for_ocl: bool,
    pub wa_enable_preemption_granularity_control_by_umd: bool,
}

/// Runtime policy derived from the product.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CapabilityTable {
    pub default_engine_type: EngineType,
    pub ftr_render_compressed_buffers: bool,
    pub ftr_render_compressed_images: bool,
    pub support_cache_flush_after_walker: bool,
    /// Nanoseconds per profiling timer tick.
    pub default_profiling_timer_resolution: f64,
    pub extra_quantity_threads_per_eu: u32,
    pub blitter_operations_supported: bool,
    pub default_thread_arbitration_policy: ThreadArbitrationPolicy,
    pub ftr_supports_coherency: bool,
}

/// Immutable description of one GPU variant, shared by every helper of a root device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HardwareInfo {
    pub platform: Platform,
    pub gt_system_info: GtSystemInfo,
    pub feature_table: FeatureTable,
    pub workaround_table: WorkaroundTable,
    pub capability_table: CapabilityTable,
}

impl HardwareInfo {
    /// Core family of the described device.
    ///
    /// # Panics
    /// Panics if the platform was never set up (no core family assigned).
    #[must_use]
    pub fn core_family(&self) -> GfxCoreFamily {
        self.platform
            .render_core_family
            .expect("hardware info has no core family; was it set up?")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_names_round_trip() {
        for product in [
            ProductFamily::Skylake,
            ProductFamily::IcelakeLp,
            ProductFamily::TigerlakeLp,
        ] {
            assert_eq!(ProductFamily::from_name(product.name()), Some(product));
        }
        assert_eq!(ProductFamily::from_name("bdw"), None);
    }

    #[test]
    fn core_family_indices_are_dense() {
        for (i, family) in GfxCoreFamily::ALL.iter().enumerate() {
            assert_eq!(family.index(), i);
        }
    }

    #[test]
    fn arbitration_policy_from_raw() {
        assert_eq!(
            ThreadArbitrationPolicy::from_raw(0),
            Some(ThreadArbitrationPolicy::AgeBased)
        );
        assert_eq!(ThreadArbitrationPolicy::from_raw(-1), None);
        assert_eq!(ThreadArbitrationPolicy::from_raw(7), None);
    }
}
