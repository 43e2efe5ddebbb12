use crate::hw_info::{GfxCoreFamily, ProductFamily};
use std::fmt;
use std::marker::PhantomData;

/// L3 cache configuration register values of one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Config {
    pub product: ProductFamily,
    pub value_for_slm: u32,
    pub value_for_no_slm: u32,
}

/// Per-generation numeric policy.
///
/// Implemented by zero-sized marker types; generic helpers such as
/// `PreambleHelper<F>` read everything family-specific from here.
pub trait GfxFamily: Send + Sync + 'static {
    const CORE_FAMILY: GfxCoreFamily;
    const NAME: &'static str;

    /// The first entry is the fallback for products missing from the table.
    const L3_CONFIGS: &'static [L3Config];
    const L3CNTL_REGISTER: u32 = 0x7034;

    /// Register holding the EU thread arbitration policy, if software programs it.
    const THREAD_ARBITRATION_REGISTER: Option<u32>;
    const THREAD_ARBITRATION_MASK: u32;
    /// Register values for `AgeBased`, `RoundRobin` and `RoundRobinAfterDependency`.
    const THREAD_ARBITRATION_VALUES: [u32; 3];

    const PIPELINE_SELECT_MEDIA_SAMPLER_DOP_CLOCK_GATE: bool;
    /// Whether the pipe control ahead of `MEDIA_VFE_STATE` also flushes the
    /// render caches on the compute engine.
    const RENDER_CACHE_FLUSH_BEFORE_VFE_ON_CCS: bool;
}

pub struct HwHelperHw<F>(PhantomData<fn() -> F>);

impl<F> HwHelperHw<F> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<F> Default for HwHelperHw<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: GfxFamily> fmt::Debug for HwHelperHw<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwHelperHw<{}>", F::NAME)
    }
}
