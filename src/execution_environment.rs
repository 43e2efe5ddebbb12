#![allow(clippy::cast_possible_truncation)]

use crate::debug_settings::DebugSettings;
use crate::error::{NeoError, NeoResult};
use crate::hw_helper;
use crate::hw_info::products::base_hardware_info;
use crate::hw_info::{HardwareInfo, ProductFamily, hardware_info_for_device, setup_hardware_info};
use crate::memory::{MAX_OS_CONTEXTS, MemoryManager, OsAgnosticMemoryManager};
use crate::os::drm::ioctl::{I915_PARAM_CHIPSET_ID, I915_PARAM_REVISION};
use crate::os::drm::{DrmDevice, DrmInterface, DrmMemoryManager};
use crate::os::wddm::{Wddm, WddmMemoryManager};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

// ===============================================================================================
// Environment Structures
// ===============================================================================================

/// How submissions reach the GPU.
#[derive(Clone)]
pub enum OsInterface {
    /// No kernel driver; batches go to an in-process AUB stream.
    Simulated,
    Drm(Arc<dyn DrmInterface>),
    Wddm(Arc<dyn Wddm>),
}

impl fmt::Debug for OsInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simulated => "Simulated",
            Self::Drm(_) => "Drm",
            Self::Wddm(_) => "Wddm",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RootDeviceEnvironment {
    pub root_device_index: u32,
    pub hw_info: Arc<HardwareInfo>,
}

/// Everything receivers of a process share: settings, per-device hardware
/// descriptions, the memory manager and the kernel interface.
pub struct ExecutionEnvironment {
    settings: Arc<DebugSettings>,
    root_devices: Vec<RootDeviceEnvironment>,
    memory_manager: Arc<dyn MemoryManager>,
    os_interface: OsInterface,
    next_context_id: AtomicU32,
}

impl fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("root_devices", &self.root_devices)
            .field("os_interface", &self.os_interface)
            .finish_non_exhaustive()
    }
}

impl ExecutionEnvironment {
    /// One simulated root device per entry of `products`.
    ///
    /// # Errors
    /// `InvalidHwConfig` for an unknown product or a bad `HardwareInfoOverride`.
    pub fn simulated(settings: Arc<DebugSettings>, products: &[ProductFamily]) -> NeoResult<Self> {
        let mut hw_infos = Vec::with_capacity(products.len());
        for &product in products {
            let mut hw = base_hardware_info(product)?;
            setup_hardware_info(product, &mut hw, true, "default")?;
            hw_infos.push(hw);
        }
        Self::build(
            settings,
            hw_infos,
            Arc::new(OsAgnosticMemoryManager::new()),
            OsInterface::Simulated,
        )
    }

    /// A single root device behind an i915 node, identified by its PCI id.
    ///
    /// # Errors
    /// Kernel errors from `GETPARAM`, or `UnknownProduct` for unsupported ids.
    pub fn from_drm(settings: Arc<DebugSettings>, drm: Arc<dyn DrmInterface>) -> NeoResult<Self> {
        let device_id = u16::try_from(drm.get_param(I915_PARAM_CHIPSET_ID)?)
            .map_err(|_| NeoError::Driver("chipset id out of range".into()))?;
        let revision_id = u16::try_from(drm.get_param(I915_PARAM_REVISION)?).unwrap_or_default();
        let hw = hardware_info_for_device(device_id, revision_id)?;

        Self::build(
            settings,
            vec![hw],
            Arc::new(DrmMemoryManager::new(Arc::clone(&drm))),
            OsInterface::Drm(drm),
        )
    }

    /// A single root device behind a WDDM adapter whose description the
    /// embedder already queried.
    ///
    /// # Errors
    /// `InvalidHwConfig` for a bad `HardwareInfoOverride`.
    pub fn from_wddm(settings: Arc<DebugSettings>, wddm: Arc<dyn Wddm>, hw_info: HardwareInfo) -> NeoResult<Self> {
        Self::build(
            settings,
            vec![hw_info],
            Arc::new(WddmMemoryManager::new(Arc::clone(&wddm))),
            OsInterface::Wddm(wddm),
        )
    }

    fn build(
        settings: Arc<DebugSettings>,
        hw_infos: Vec<HardwareInfo>,
        memory_manager: Arc<dyn MemoryManager>,
        os_interface: OsInterface,
    ) -> NeoResult<Self> {
        hw_helper::init();

        let mut root_devices = Vec::with_capacity(hw_infos.len());
        for (index, mut hw) in hw_infos.into_iter().enumerate() {
            apply_hardware_info_override(&settings, &mut hw)?;
            root_devices.push(RootDeviceEnvironment {
                root_device_index: index as u32,
                hw_info: Arc::new(hw),
            });
        }

        debug!(root_devices = root_devices.len(), ?os_interface, "execution environment created");
        Ok(Self {
            settings,
            root_devices,
            memory_manager,
            os_interface,
            next_context_id: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn settings(&self) -> Arc<DebugSettings> {
        Arc::clone(&self.settings)
    }

    #[must_use]
    pub fn memory_manager(&self) -> Arc<dyn MemoryManager> {
        Arc::clone(&self.memory_manager)
    }

    #[must_use]
    pub const fn os_interface(&self) -> &OsInterface {
        &self.os_interface
    }

    #[must_use]
    pub fn root_devices(&self) -> &[RootDeviceEnvironment] {
        &self.root_devices
    }

    /// # Errors
    /// `Unsupported` if there is no root device at `index`.
    pub fn root_device(&self, index: u32) -> NeoResult<&RootDeviceEnvironment> {
        self.root_devices
            .get(index as usize)
            .ok_or(NeoError::Unsupported("no such root device"))
    }

    /// Hands out context ids; they wrap at the number of contexts an
    /// allocation can track.
    pub fn next_context_id(&self) -> u32 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed) % MAX_OS_CONTEXTS as u32
    }
}

fn apply_hardware_info_override(settings: &DebugSettings, hw: &mut HardwareInfo) -> NeoResult<()> {
    if settings.hardware_info_override == "default" {
        return Ok(());
    }
    let product = hw.platform.product_family;
    setup_hardware_info(product, hw, false, &settings.hardware_info_override)?;
    debug!(config = %settings.hardware_info_override, ?product, "hardware info overridden");
    Ok(())
}

// ===============================================================================================
// Global Environment Management
// ===============================================================================================

static GLOBAL_ENVIRONMENT: Mutex<Option<Arc<ExecutionEnvironment>>> = Mutex::new(None);

/// Returns the process-wide environment, creating it on first use.
///
/// A real i915 device is preferred; without one, `ProductFamilyOverride`
/// selects a simulated device.
///
/// # Errors
/// `Unsupported` when there is neither a usable device nor an override,
/// or whatever creating the environment fails with.
pub fn acquire(settings: Arc<DebugSettings>) -> NeoResult<Arc<ExecutionEnvironment>> {
    let mut guard = GLOBAL_ENVIRONMENT.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(environment) = guard.as_ref() {
        return Ok(Arc::clone(environment));
    }

    let environment = match DrmDevice::open_first() {
        Ok(device) => ExecutionEnvironment::from_drm(settings, Arc::new(device))?,
        Err(e) => {
            let Some(product) = ProductFamily::from_name(&settings.product_family_override) else {
                warn!("no i915 device ({e}) and no product override");
                return Err(NeoError::Unsupported("no GPU device found"));
            };
            info!(?product, "no i915 device; using a simulated device");
            ExecutionEnvironment::simulated(settings, &[product])?
        }
    };

    let environment = Arc::new(environment);
    *guard = Some(Arc::clone(&environment));
    drop(guard);

    Ok(environment)
}

/// Drops the process-wide environment. Receivers still holding it keep
/// their own reference.
pub fn release() {
    GLOBAL_ENVIRONMENT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}
