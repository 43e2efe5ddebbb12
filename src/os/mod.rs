pub mod drm;
pub mod wddm;

use crate::hw_helper::EngineInstance;
use wddm::D3dkmtHandle;

/// The kernel-side object backing one pinned fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsHandle {
    /// A GEM buffer object created over user memory.
    Drm { bo_handle: u32 },
    Wddm { handle: D3dkmtHandle },
    /// No kernel object; used by the simulated device.
    Simulated { id: u64 },
}

/// The hardware context a receiver submits through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsContext {
    pub context_id: u32,
    pub root_device_index: u32,
    pub engine: EngineInstance,
    pub low_priority: bool,
}

impl OsContext {
    #[must_use]
    pub const fn new(context_id: u32, engine: EngineInstance) -> Self {
        Self {
            context_id,
            root_device_index: 0,
            engine,
            low_priority: matches!(engine.usage, crate::hw_helper::EngineUsage::LowPriority),
        }
    }

    #[must_use]
    pub const fn with_root_device_index(mut self, root_device_index: u32) -> Self {
        self.root_device_index = root_device_index;
        self
    }
}
