//! Debug and override flags.
//!
//! A [`DebugSettings`] snapshot is built once per process (from a TOML file,
//! the environment, or both) and handed to every capability query as an
//! `Arc<DebugSettings>`. Integer flags use `-1` for "not overridden".

use crate::error::NeoResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

pub const UNSET: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DebugSettings {
    /// `0`/`1` force buffer compression off/on.
    #[serde(default = "unset")]
    pub render_compressed_buffers_enabled: i32,

    /// `0`/`1` force image compression off/on.
    #[serde(default = "unset")]
    pub render_compressed_images_enabled: i32,

    /// `1` forces a cache flush after each walker, `0` disables it.
    #[serde(default = "unset")]
    pub enable_cache_flush_after_walker: i32,

    /// Number of sub-devices to expose when greater than zero.
    #[serde(default = "unset")]
    pub create_multiple_sub_devices: i32,

    /// Number of compute engines to expose when greater than zero.
    #[serde(default = "unset")]
    pub zex_number_of_ccs: i32,

    /// Raw `ThreadArbitrationPolicy` value.
    #[serde(default = "unset")]
    pub override_thread_arbitration_policy: i32,

    /// `0`/`1` immediate dispatch, `2`..=`4` batched dispatch.
    #[serde(default = "unset")]
    pub csr_dispatch_mode: i32,

    /// `SxSSxEU` topology replacing the device's own.
    #[serde(default = "default_string")]
    pub hardware_info_override: String,

    /// Short product name (`"skl"`, `"icllp"`, `"tgllp"`).
    #[serde(default = "default_string")]
    pub product_family_override: String,

    #[serde(default = "unset")]
    pub enable_timeout: i32,

    #[serde(default = "unset_i64")]
    pub timeout_microseconds: i64,
}

const fn unset() -> i32 {
    UNSET
}

const fn unset_i64() -> i64 {
    UNSET as i64
}

fn default_string() -> String {
    "default".to_string()
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            render_compressed_buffers_enabled: unset(),
            render_compressed_images_enabled: unset(),
            enable_cache_flush_after_walker: unset(),
            create_multiple_sub_devices: unset(),
            zex_number_of_ccs: unset(),
            override_thread_arbitration_policy: unset(),
            csr_dispatch_mode: unset(),
            hardware_info_override: default_string(),
            product_family_override: default_string(),
            enable_timeout: unset(),
            timeout_microseconds: unset_i64(),
        }
    }
}

/// Flag names as they appear in settings files and the environment.
pub const FLAG_NAMES: [&str; 11] = [
    "RenderCompressedBuffersEnabled",
    "RenderCompressedImagesEnabled",
    "EnableCacheFlushAfterWalker",
    "CreateMultipleSubDevices",
    "ZexNumberOfCcs",
    "OverrideThreadArbitrationPolicy",
    "CsrDispatchMode",
    "HardwareInfoOverride",
    "ProductFamilyOverride",
    "EnableTimeout",
    "TimeoutMicroseconds",
];

impl DebugSettings {
    /// Load settings from a TOML file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read and `Config` if it is not valid TOML
    /// for these settings.
    pub fn load<P: AsRef<Path>>(path: P) -> NeoResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Defaults overlaid with the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides(|name| std::env::var(name).ok());
        settings
    }

    /// Overlays every flag for which `lookup` returns a value.
    /// Values that do not parse are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for name in FLAG_NAMES {
            let Some(raw) = lookup(name) else {
                continue;
            };
            match self.set_flag(name, raw.trim()) {
                Ok(()) => debug!(flag = name, value = raw.trim(), "debug flag overridden"),
                Err(e) => warn!(flag = name, value = %raw, "ignoring debug flag: {e}"),
            }
        }
    }

    fn set_flag(&mut self, name: &str, raw: &str) -> Result<(), std::num::ParseIntError> {
        match name {
            "RenderCompressedBuffersEnabled" => self.render_compressed_buffers_enabled = raw.parse()?,
            "RenderCompressedImagesEnabled" => self.render_compressed_images_enabled = raw.parse()?,
            "EnableCacheFlushAfterWalker" => self.enable_cache_flush_after_walker = raw.parse()?,
            "CreateMultipleSubDevices" => self.create_multiple_sub_devices = raw.parse()?,
            "ZexNumberOfCcs" => self.zex_number_of_ccs = raw.parse()?,
            "OverrideThreadArbitrationPolicy" => {
                self.override_thread_arbitration_policy = raw.parse()?;
            }
            "CsrDispatchMode" => self.csr_dispatch_mode = raw.parse()?,
            "HardwareInfoOverride" => self.hardware_info_override = raw.to_string(),
            "ProductFamilyOverride" => self.product_family_override = raw.to_string(),
            "EnableTimeout" => self.enable_timeout = raw.parse()?,
            "TimeoutMicroseconds" => self.timeout_microseconds = raw.parse()?,
            _ => {}
        }
        Ok(())
    }
}

/// `Some(value != 0)` when `flag` is overridden, `None` otherwise.
#[must_use]
pub const fn flag_override(flag: i32) -> Option<bool> {
    if flag == UNSET { None } else { Some(flag != 0) }
}
