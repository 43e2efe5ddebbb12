use crate::hw_helper::HwHelper;
use crate::hw_info::GfxCoreFamily;
use std::sync::OnceLock;
use tracing::debug;

type Factory = [Option<&'static dyn HwHelper>; GfxCoreFamily::COUNT];

static HW_HELPER_FACTORY: OnceLock<Factory> = OnceLock::new();

fn build_factory() -> Factory {
    let mut factory: Factory = [None; GfxCoreFamily::COUNT];

    #[cfg(feature = "gen9")]
    {
        factory[GfxCoreFamily::Gen9.index()] = Some(&super::gen9::GEN9_HW_HELPER);
    }
    #[cfg(feature = "gen11")]
    {
        factory[GfxCoreFamily::Gen11.index()] = Some(&super::gen11::GEN11_HW_HELPER);
    }
    #[cfg(feature = "gen12lp")]
    {
        factory[GfxCoreFamily::Gen12Lp.index()] = Some(&super::gen12lp::GEN12LP_HW_HELPER);
    }

    let enabled: Vec<_> = factory.iter().flatten().map(|h| h.core_family()).collect();
    debug!(?enabled, "hw helper registry initialized");
    factory
}

/// Populates the registry. Idempotent; [`get`] and [`try_get`] call it lazily.
pub fn init() {
    HW_HELPER_FACTORY.get_or_init(build_factory);
}

#[must_use]
pub fn try_get(family: GfxCoreFamily) -> Option<&'static dyn HwHelper> {
    HW_HELPER_FACTORY.get_or_init(build_factory)[family.index()]
}

/// Returns the helper singleton for `family`.
///
/// # Panics
/// Panics if support for `family` was not compiled in.
#[must_use]
pub fn get(family: GfxCoreFamily) -> &'static dyn HwHelper {
    try_get(family).unwrap_or_else(|| panic!("no HwHelper compiled in for {family:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
        for family in GfxCoreFamily::ALL {
            if let Some(helper) = try_get(family) {
                assert_eq!(helper.core_family(), family);
                assert!(std::ptr::addr_eq(helper, get(family)));
            }
        }
    }

    #[cfg(all(feature = "gen9", feature = "gen11", feature = "gen12lp"))]
    #[test]
    fn default_build_registers_every_family() {
        for family in GfxCoreFamily::ALL {
            assert!(try_get(family).is_some(), "{family:?} missing");
        }
    }

    #[cfg(not(feature = "gen11"))]
    #[test]
    #[should_panic(expected = "no HwHelper compiled in")]
    fn missing_family_panics() {
        let _ = get(GfxCoreFamily::Gen11);
    }
}
