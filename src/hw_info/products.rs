use crate::error::{NeoError, NeoResult};
use crate::hw_info::config::setup_hardware_info;
use crate::hw_info::{
    CapabilityTable, EngineType, FeatureTable, GfxCoreFamily, HardwareInfo, Platform,
    ProductFamily, ThreadArbitrationPolicy, WorkaroundTable,
};

// ===============================================================================================
// Product Descriptors
// ===============================================================================================

/// One supported `SxSSxEU` topology of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfigEntry {
    pub name: &'static str,
    pub l3_bank_count: u32,
}

/// Static per-product data used by hardware-info setup.
#[derive(Debug, Clone, Copy)]
pub struct ProductDescriptor {
    pub product_family: ProductFamily,
    pub core_family: GfxCoreFamily,
    pub threads_per_eu: u32,
    pub default_config: &'static str,
    pub supported_configs: &'static [HwConfigEntry],
}

impl ProductDescriptor {
    #[must_use]
    pub fn find_config(&self, name: &str) -> Option<&'static HwConfigEntry> {
        self.supported_configs.iter().find(|c| c.name == name)
    }
}

const SKL_DESCRIPTOR: ProductDescriptor = ProductDescriptor {
    product_family: ProductFamily::Skylake,
    core_family: GfxCoreFamily::Gen9,
    threads_per_eu: 7,
    default_config: "1x3x8",
    supported_configs: &[
        HwConfigEntry { name: "1x2x6", l3_bank_count: 2 },
        HwConfigEntry { name: "1x3x6", l3_bank_count: 4 },
        HwConfigEntry { name: "1x3x8", l3_bank_count: 4 },
        HwConfigEntry { name: "2x3x8", l3_bank_count: 8 },
        HwConfigEntry { name: "3x3x8", l3_bank_count: 12 },
    ],
};

const ICLLP_DESCRIPTOR: ProductDescriptor = ProductDescriptor {
    product_family: ProductFamily::IcelakeLp,
    core_family: GfxCoreFamily::Gen11,
    threads_per_eu: 7,
    default_config: "1x8x8",
    supported_configs: &[
        HwConfigEntry { name: "1x1x8", l3_bank_count: 4 },
        HwConfigEntry { name: "1x4x8", l3_bank_count: 4 },
        HwConfigEntry { name: "1x6x8", l3_bank_count: 6 },
        HwConfigEntry { name: "1x8x8", l3_bank_count: 8 },
    ],
};

const TGLLP_DESCRIPTOR: ProductDescriptor = ProductDescriptor {
    product_family: ProductFamily::TigerlakeLp,
    core_family: GfxCoreFamily::Gen12Lp,
    threads_per_eu: 7,
    default_config: "1x6x16",
    supported_configs: &[
        HwConfigEntry { name: "1x2x16", l3_bank_count: 4 },
        HwConfigEntry { name: "1x6x16", l3_bank_count: 8 },
    ],
};

pub const SUPPORTED_PRODUCTS: [ProductFamily; 3] = [
    ProductFamily::Skylake,
    ProductFamily::IcelakeLp,
    ProductFamily::TigerlakeLp,
];

#[must_use]
pub const fn descriptor(product: ProductFamily) -> Option<&'static ProductDescriptor> {
    match product {
        ProductFamily::Skylake => Some(&SKL_DESCRIPTOR),
        ProductFamily::IcelakeLp => Some(&ICLLP_DESCRIPTOR),
        ProductFamily::TigerlakeLp => Some(&TGLLP_DESCRIPTOR),
        ProductFamily::Unknown => None,
    }
}

// ===============================================================================================
// Base Tables
// ===============================================================================================

const fn skl_capabilities() -> CapabilityTable {
    CapabilityTable {
        default_engine_type: EngineType::Rcs,
        ftr_render_compressed_buffers: false,
        ftr_render_compressed_images: false,
        support_cache_flush_after_walker: false,
        default_profiling_timer_resolution: 83.333,
        extra_quantity_threads_per_eu: 0,
        blitter_operations_supported: false,
        default_thread_arbitration_policy: ThreadArbitrationPolicy::AgeBased,
        ftr_supports_coherency: true,
    }
}

const fn icllp_capabilities() -> CapabilityTable {
    CapabilityTable {
        default_engine_type: EngineType::Rcs,
        ftr_render_compressed_buffers: false,
        ftr_render_compressed_images: false,
        support_cache_flush_after_walker: false,
        default_profiling_timer_resolution: 83.333,
        extra_quantity_threads_per_eu: 0,
        blitter_operations_supported: false,
        default_thread_arbitration_policy: ThreadArbitrationPolicy::RoundRobinAfterDependency,
        ftr_supports_coherency: true,
    }
}

const fn tgllp_capabilities() -> CapabilityTable {
    CapabilityTable {
        default_engine_type: EngineType::Ccs,
        ftr_render_compressed_buffers: false,
        ftr_render_compressed_images: false,
        support_cache_flush_after_walker: true,
        default_profiling_timer_resolution: 52.083,
        extra_quantity_threads_per_eu: 0,
        blitter_operations_supported: false,
        default_thread_arbitration_policy: ThreadArbitrationPolicy::AgeBased,
        ftr_supports_coherency: false,
    }
}

/// Platform identity and capability table for `product`, with an empty
/// topology. Feature and workaround tables are filled by [`setup_hardware_info`].
///
/// # Errors
/// Returns `InvalidHwConfig` for [`ProductFamily::Unknown`].
pub fn base_hardware_info(product: ProductFamily) -> NeoResult<HardwareInfo> {
    let descriptor = descriptor(product).ok_or_else(|| {
        NeoError::InvalidHwConfig(format!("no hardware description for {product:?}"))
    })?;

    let capability_table = match product {
        ProductFamily::Skylake => skl_capabilities(),
        ProductFamily::IcelakeLp => icllp_capabilities(),
        _ => tgllp_capabilities(),
    };

    Ok(HardwareInfo {
        platform: Platform {
            product_family: product,
            render_core_family: Some(descriptor.core_family),
            device_id: 0,
            revision_id: 0,
        },
        capability_table,
        ..HardwareInfo::default()
    })
}

pub(crate) fn setup_feature_and_workaround_table(hw: &mut HardwareInfo) {
    let ftr = &mut hw.feature_table;
    let wa = &mut hw.workaround_table;

    ftr.ftr_ppgtt = true;
    ftr.ftr_svm = true;
    ftr.ftr_gp_gpu_mid_thread_level_preempt = true;

    match hw.platform.product_family {
        ProductFamily::Skylake => {
            ftr.ftr_l3_ia_coherency = true;
            wa.wa_send_mi_flush_before_vfe = true;
            wa.wa_disable_lsqc_ro_perf_for_ocl = true;
            wa.wa_enable_preemption_granularity_control_by_umd = true;
        }
        ProductFamily::IcelakeLp => {
            ftr.ftr_l3_ia_coherency = true;
            wa.wa_send_mi_flush_before_vfe = true;
        }
        ProductFamily::TigerlakeLp => {
            ftr.ftr_ccs_node = true;
            ftr.ftr_e2e_compression = true;
            ftr.ftr_64k_pages = true;
        }
        ProductFamily::Unknown => {}
    }
}

// ===============================================================================================
// Device ID Lookup
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdLookup {
    pub device_id: u16,
    pub product: ProductFamily,
    pub config: &'static str,
    pub name: &'static str,
}

const DEVICE_ID_LOOKUP_TABLE: &[DeviceIdLookup] = &[
    /* Skylake */
    DeviceIdLookup {
        device_id: 0x1902,
        product: ProductFamily::Skylake,
        config: "1x2x6",
        name: "Intel(R) HD Graphics 510",
    },
    DeviceIdLookup {
        device_id: 0x1906,
        product: ProductFamily::Skylake,
        config: "1x2x6",
        name: "Intel(R) HD Graphics 510",
    },
    DeviceIdLookup {
        device_id: 0x1912,
        product: ProductFamily::Skylake,
        config: "1x3x8",
        name: "Intel(R) HD Graphics 530",
    },
    DeviceIdLookup {
        device_id: 0x1916,
        product: ProductFamily::Skylake,
        config: "1x3x8",
        name: "Intel(R) HD Graphics 520",
    },
    DeviceIdLookup {
        device_id: 0x191B,
        product: ProductFamily::Skylake,
        config: "1x3x8",
        name: "Intel(R) HD Graphics 530",
    },
    DeviceIdLookup {
        device_id: 0x1926,
        product: ProductFamily::Skylake,
        config: "2x3x8",
        name: "Intel(R) Iris(R) Graphics 540",
    },
    DeviceIdLookup {
        device_id: 0x193B,
        product: ProductFamily::Skylake,
        config: "3x3x8",
        name: "Intel(R) Iris(R) Pro Graphics 580",
    },
    /* Icelake LP */
    DeviceIdLookup {
        device_id: 0x8A52,
        product: ProductFamily::IcelakeLp,
        config: "1x8x8",
        name: "Intel(R) Iris(R) Plus Graphics",
    },
    DeviceIdLookup {
        device_id: 0x8A5A,
        product: ProductFamily::IcelakeLp,
        config: "1x6x8",
        name: "Intel(R) Iris(R) Plus Graphics",
    },
    DeviceIdLookup {
        device_id: 0x8A56,
        product: ProductFamily::IcelakeLp,
        config: "1x4x8",
        name: "Intel(R) UHD Graphics",
    },
    DeviceIdLookup {
        device_id: 0x8A71,
        product: ProductFamily::IcelakeLp,
        config: "1x1x8",
        name: "Intel(R) UHD Graphics",
    },
    /* Tigerlake LP */
    DeviceIdLookup {
        device_id: 0x9A49,
        product: ProductFamily::TigerlakeLp,
        config: "1x6x16",
        name: "Intel(R) Iris(R) Xe Graphics",
    },
    DeviceIdLookup {
        device_id: 0x9A40,
        product: ProductFamily::TigerlakeLp,
        config: "1x6x16",
        name: "Intel(R) Iris(R) Xe Graphics",
    },
    DeviceIdLookup {
        device_id: 0x9A78,
        product: ProductFamily::TigerlakeLp,
        config: "1x2x16",
        name: "Intel(R) UHD Graphics",
    },
];

#[must_use]
pub fn find_device(device_id: u16) -> Option<&'static DeviceIdLookup> {
    DEVICE_ID_LOOKUP_TABLE
        .iter()
        .find(|entry| entry.device_id == device_id)
}

/// Builds a fully set-up [`HardwareInfo`] for a PCI device id.
///
/// # Errors
/// Returns `UnknownProduct` if the id is not in the lookup table.
pub fn hardware_info_for_device(device_id: u16, revision_id: u16) -> NeoResult<HardwareInfo> {
    let entry = find_device(device_id).ok_or(NeoError::UnknownProduct(device_id))?;

    let mut hw = base_hardware_info(entry.product)?;
    setup_hardware_info(entry.product, &mut hw, true, entry.config)?;
    hw.platform.device_id = device_id;
    hw.platform.revision_id = revision_id;

    Ok(hw)
}
