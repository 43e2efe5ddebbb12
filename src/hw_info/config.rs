use crate::error::{NeoError, NeoResult};
use crate::hw_info::products::{self, descriptor};
use crate::hw_info::{CcsInfo, GtSystemInfo, HardwareInfo, ProductFamily};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// A parsed `SxSSxEU` topology string, e.g. `"1x3x8"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    pub slices: u32,
    pub sub_slices_per_slice: u32,
    pub eus_per_sub_slice: u32,
}

impl FromStr for HwConfig {
    type Err = NeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NeoError::InvalidHwConfig(format!("cannot parse {s:?} as SxSSxEU"));

        let mut parts = s.trim().split('x');
        let mut next = || -> NeoResult<u32> {
            let value: u32 = parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
            if value == 0 {
                return Err(invalid());
            }
            Ok(value)
        };

        let config = Self {
            slices: next()?,
            sub_slices_per_slice: next()?,
            eus_per_sub_slice: next()?,
        };

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(config)
    }
}

impl fmt::Display for HwConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.slices, self.sub_slices_per_slice, self.eus_per_sub_slice
        )
    }
}

/// Fills `hw.gt_system_info` (and optionally the feature/workaround tables)
/// for `product` using `config`, either `"default"` or an `SxSSxEU` string the
/// product supports.
///
/// On error `hw` is left exactly as it was passed in.
///
/// # Errors
/// Returns `InvalidHwConfig` if the product has no setup function or the
/// string is unparseable or not a topology of that product.
pub fn setup_hardware_info(
    product: ProductFamily,
    hw: &mut HardwareInfo,
    setup_feature_table: bool,
    config: &str,
) -> NeoResult<()> {
    let descriptor = descriptor(product).ok_or_else(|| {
        NeoError::InvalidHwConfig(format!("no setup function for {product:?}"))
    })?;

    let name = if config == "default" {
        descriptor.default_config
    } else {
        config
    };

    let parsed: HwConfig = name.parse().inspect_err(|e| warn!("{e}"))?;
    let Some(entry) = descriptor.find_config(name) else {
        warn!(product = product.name(), config = name, "unsupported hardware config");
        return Err(NeoError::InvalidHwConfig(format!(
            "{name} is not a configuration of {}",
            product.name()
        )));
    };

    let sub_slice_count = parsed.slices * parsed.sub_slices_per_slice;
    let eu_count = sub_slice_count * parsed.eus_per_sub_slice;
    let has_ccs = product == ProductFamily::TigerlakeLp;

    hw.gt_system_info = GtSystemInfo {
        slice_count: parsed.slices,
        sub_slice_count,
        eu_count,
        thread_count: eu_count * descriptor.threads_per_eu,
        max_eu_per_sub_slice: parsed.eus_per_sub_slice,
        max_slices_supported: parsed.slices,
        max_sub_slices_supported: sub_slice_count,
        l3_bank_count: entry.l3_bank_count,
        ccs_info: CcsInfo {
            is_valid: has_ccs,
            number_of_ccs_enabled: u32::from(has_ccs),
        },
    };
    hw.platform.product_family = product;
    hw.platform.render_core_family = Some(descriptor.core_family);

    if setup_feature_table {
        products::setup_feature_and_workaround_table(hw);
    }

    debug!(
        product = product.name(),
        config = %parsed,
        eu_count,
        "hardware info set up"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_topology_strings() {
        let config: HwConfig = "2x3x8".parse().unwrap();
        assert_eq!(
            config,
            HwConfig {
                slices: 2,
                sub_slices_per_slice: 3,
                eus_per_sub_slice: 8
            }
        );
        assert_eq!(config.to_string(), "2x3x8");
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in ["erroneous", "1x3", "1x3x8x2", "0x3x8", "1xx8", "", "axbxc"] {
            assert!(bad.parse::<HwConfig>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn erroneous_config_leaves_system_info_zeroed() {
        let mut hw = HardwareInfo::default();
        let result = setup_hardware_info(ProductFamily::Skylake, &mut hw, false, "erroneous");

        assert!(matches!(result, Err(NeoError::InvalidHwConfig(_))));
        assert_eq!(hw.gt_system_info.slice_count, 0);
        assert_eq!(hw.gt_system_info.sub_slice_count, 0);
        assert_eq!(hw.gt_system_info.eu_count, 0);
        assert_eq!(hw, HardwareInfo::default());
    }

    #[test]
    fn well_formed_but_unsupported_config_is_rejected() {
        let mut hw = HardwareInfo::default();
        assert!(setup_hardware_info(ProductFamily::IcelakeLp, &mut hw, true, "1x3x8").is_err());
        assert_eq!(hw.gt_system_info, GtSystemInfo::default());
        assert!(!hw.feature_table.ftr_ppgtt);
    }

    #[test]
    fn default_config_resolves_per_product() {
        let mut hw = HardwareInfo::default();
        setup_hardware_info(ProductFamily::Skylake, &mut hw, true, "default").unwrap();

        assert_eq!(hw.gt_system_info.slice_count, 1);
        assert_eq!(hw.gt_system_info.sub_slice_count, 3);
        assert_eq!(hw.gt_system_info.eu_count, 24);
        assert_eq!(hw.gt_system_info.thread_count, 24 * 7);
        assert_eq!(hw.gt_system_info.max_eu_per_sub_slice, 8);
        assert!(hw.workaround_table.wa_send_mi_flush_before_vfe);
    }

    #[test]
    fn feature_table_is_optional() {
        let mut hw = HardwareInfo::default();
        setup_hardware_info(ProductFamily::TigerlakeLp, &mut hw, false, "1x2x16").unwrap();
        assert_eq!(hw.gt_system_info.eu_count, 32);
        assert!(!hw.feature_table.ftr_ccs_node);
    }

    #[test]
    fn unknown_product_has_no_setup() {
        let mut hw = HardwareInfo::default();
        assert!(setup_hardware_info(ProductFamily::Unknown, &mut hw, true, "default").is_err());
    }
}
