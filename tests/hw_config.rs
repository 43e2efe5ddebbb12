use neo_rs::NeoError;
use neo_rs::debug_settings::DebugSettings;
use neo_rs::hw_helper;
use neo_rs::hw_info::products::base_hardware_info;
use neo_rs::hw_info::{GtSystemInfo, ProductFamily, hardware_info_for_device, setup_hardware_info};
use pretty_assertions::assert_eq;

#[test]
fn rejected_config_strings_leave_topology_zeroed() {
    for config in ["", "1x3", "1x3x8x2", "0x3x8", "axbxc", "4x4x4"] {
        let mut hw = base_hardware_info(ProductFamily::Skylake).unwrap();
        let result = setup_hardware_info(ProductFamily::Skylake, &mut hw, true, config);

        assert!(matches!(result, Err(NeoError::InvalidHwConfig(_))), "{config:?}");
        assert_eq!(hw.gt_system_info, GtSystemInfo::default(), "{config:?}");
    }
}

#[test]
fn unknown_device_ids_are_reported() {
    assert!(matches!(
        hardware_info_for_device(0xBEEF, 0),
        Err(NeoError::UnknownProduct(0xBEEF))
    ));
}

#[test]
fn debug_overrides_win_over_capabilities() {
    let hw = hardware_info_for_device(0x9A49, 0).unwrap();
    let helper = hw_helper::get(hw.core_family());
    let defaults = DebugSettings::default();

    let forced_off = DebugSettings {
        render_compressed_buffers_enabled: 0,
        render_compressed_images_enabled: 0,
        enable_cache_flush_after_walker: 0,
        ..DebugSettings::default()
    };
    let forced_on = DebugSettings {
        render_compressed_buffers_enabled: 1,
        render_compressed_images_enabled: 1,
        enable_cache_flush_after_walker: 1,
        ..DebugSettings::default()
    };

    assert_eq!(
        helper.render_compressed_buffers_supported(&hw, &defaults),
        hw.capability_table.ftr_render_compressed_buffers
    );
    assert_eq!(
        helper.cache_flush_after_walker_supported(&hw, &defaults),
        hw.capability_table.support_cache_flush_after_walker
    );
    for (settings, expected) in [(&forced_off, false), (&forced_on, true)] {
        assert_eq!(helper.render_compressed_buffers_supported(&hw, settings), expected);
        assert_eq!(helper.render_compressed_images_supported(&hw, settings), expected);
        assert_eq!(helper.cache_flush_after_walker_supported(&hw, settings), expected);
    }
}

#[test]
fn vfe_threads_for_a_gt2_skylake() {
    let mut hw = base_hardware_info(ProductFamily::Skylake).unwrap();
    setup_hardware_info(ProductFamily::Skylake, &mut hw, true, "1x3x8").unwrap();
    hw.gt_system_info.eu_count = 8;
    hw.gt_system_info.thread_count = 56;
    hw.capability_table.extra_quantity_threads_per_eu = 0;

    assert_eq!(hw_helper::get(hw.core_family()).get_max_threads_for_vfe(&hw), 56);
}

#[test]
fn sub_device_and_engine_counts_follow_overrides() {
    let hw = hardware_info_for_device(0x9A49, 0).unwrap();
    let helper = hw_helper::get(hw.core_family());

    assert_eq!(helper.get_sub_devices_count(&hw, &DebugSettings::default()), 1);
    assert_eq!(helper.get_engines_count(&hw, &DebugSettings::default()), 1);

    let settings = DebugSettings {
        create_multiple_sub_devices: 2,
        zex_number_of_ccs: 4,
        ..DebugSettings::default()
    };
    assert_eq!(helper.get_sub_devices_count(&hw, &settings), 2);
    assert_eq!(helper.get_engines_count(&hw, &settings), 4);

    let skl = hardware_info_for_device(0x1912, 0).unwrap();
    assert_eq!(hw_helper::get(skl.core_family()).get_engines_count(&skl, &settings), 1);
}
