use neo_rs::command_queue::{CL_SUCCESS, CommandQueueBuilder};
use neo_rs::command_stream::DispatchFlags;
use neo_rs::debug_settings::DebugSettings;
use neo_rs::execution_environment::ExecutionEnvironment;
use neo_rs::hw_helper;
use neo_rs::hw_info::ProductFamily;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("============================================================");
    println!("               neo-rs - Hardware Capabilities               ");
    println!("============================================================");

    let settings = Arc::new(DebugSettings::from_env());

    for product in [ProductFamily::Skylake, ProductFamily::IcelakeLp, ProductFamily::TigerlakeLp] {
        let environment = ExecutionEnvironment::simulated(Arc::clone(&settings), &[product])?;
        let hw = &environment.root_devices()[0].hw_info;
        let helper = hw_helper::get(hw.core_family());
        let gt = &hw.gt_system_info;

        println!("\n[+] {} ({:?})", product.name(), hw.core_family());
        println!(
            "    Topology: {}x{}x{} ({} EUs, {} threads)",
            gt.slice_count,
            gt.sub_slice_count / gt.slice_count.max(1),
            gt.max_eu_per_sub_slice,
            gt.eu_count,
            gt.thread_count
        );
        println!("    Max VFE threads:          {}", helper.get_max_threads_for_vfe(hw));
        println!("    L3 configurable:          {}", helper.is_l3_configurable(hw));
        println!(
            "    Compressed buffers/images: {}/{}",
            helper.render_compressed_buffers_supported(hw, &settings),
            helper.render_compressed_images_supported(hw, &settings)
        );
        println!(
            "    Cache flush after walker: {}",
            helper.cache_flush_after_walker_supported(hw, &settings)
        );
        println!("    Engines:");
        for engine in helper.get_gpgpu_engine_instances(hw, &settings) {
            println!("      - {:?} ({:?})", engine.engine_type, engine.usage);
        }

        let mut queue = CommandQueueBuilder::new(&environment, 0).create()?;
        let stamp = queue.enqueue(&[0, 0], DispatchFlags::default(), &[])?;
        let status = queue.finish();
        println!(
            "    Simulated submission: task {} {}",
            stamp.task_count,
            if status == CL_SUCCESS { "completed" } else { "FAILED" }
        );
    }

    Ok(())
}
