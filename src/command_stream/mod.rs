pub mod aub;
pub mod aub_dump;
pub mod commands;
pub mod completion;
pub mod drm;
pub mod gpgpu_walker;
pub mod linear_stream;
pub mod preamble;
pub mod receiver;
pub mod wddm;

pub use completion::{CompletionStamp, TagBuffer};
pub use linear_stream::LinearStream;
pub use receiver::{
    CommandStreamReceiver, CommandStreamReceiverHw, CsrStatus, DispatchFlags, DispatchMode, SubmissionBackend,
};

use crate::error::{NeoError, NeoResult};
use crate::execution_environment::{ExecutionEnvironment, OsInterface};
use crate::hw_helper::{EngineInstance, GfxFamily};
use crate::hw_info::GfxCoreFamily;
use crate::os::OsContext;
use aub::{AubBackend, AubMemoryStream};
use aub_dump::AubDumpBackend;
use drm::DrmBackend;
use std::sync::Arc;
use wddm::WddmBackend;

/// Builds the receiver for `engine` on a root device, picking the family
/// from the device's hardware info and the backend from the OS interface.
///
/// # Errors
/// `Unsupported` if the device's core family is not compiled in, or the
/// receiver's own construction errors.
pub fn create_command_stream_receiver(
    environment: &ExecutionEnvironment,
    root_device_index: u32,
    engine: EngineInstance,
    with_aub_dump: bool,
) -> NeoResult<Box<dyn CommandStreamReceiver>> {
    let root = environment.root_device(root_device_index)?;
    let os_context =
        OsContext::new(environment.next_context_id(), engine).with_root_device_index(root_device_index);

    match root.hw_info.platform.render_core_family {
        #[cfg(feature = "gen9")]
        Some(GfxCoreFamily::Gen9) => {
            build::<crate::hw_helper::gen9::Gen9Family>(environment, root_device_index, os_context, with_aub_dump)
        }
        #[cfg(feature = "gen11")]
        Some(GfxCoreFamily::Gen11) => {
            build::<crate::hw_helper::gen11::Gen11Family>(environment, root_device_index, os_context, with_aub_dump)
        }
        #[cfg(feature = "gen12lp")]
        Some(GfxCoreFamily::Gen12Lp) => {
            build::<crate::hw_helper::gen12lp::Gen12LpFamily>(environment, root_device_index, os_context, with_aub_dump)
        }
        #[allow(unreachable_patterns)]
        _ => Err(NeoError::Unsupported("core family not compiled in")),
    }
}

fn build<F: GfxFamily>(
    environment: &ExecutionEnvironment,
    root_device_index: u32,
    os_context: OsContext,
    with_aub_dump: bool,
) -> NeoResult<Box<dyn CommandStreamReceiver>> {
    let hw_info = Arc::clone(&environment.root_device(root_device_index)?.hw_info);
    let settings = environment.settings();
    let memory_manager = environment.memory_manager();

    Ok(match (environment.os_interface(), with_aub_dump) {
        (OsInterface::Simulated, _) => Box::new(CommandStreamReceiverHw::<F, _>::new(
            hw_info,
            settings,
            memory_manager,
            os_context,
            AubBackend::new(AubMemoryStream::new()),
        )?),
        (OsInterface::Drm(drm), false) => Box::new(CommandStreamReceiverHw::<F, _>::new(
            hw_info,
            settings,
            memory_manager,
            os_context,
            DrmBackend::new(Arc::clone(drm)),
        )?),
        (OsInterface::Drm(drm), true) => Box::new(CommandStreamReceiverHw::<F, _>::new(
            hw_info,
            settings,
            memory_manager,
            os_context,
            AubDumpBackend::new(DrmBackend::new(Arc::clone(drm)), AubMemoryStream::new()),
        )?),
        (OsInterface::Wddm(wddm), false) => Box::new(CommandStreamReceiverHw::<F, _>::new(
            hw_info,
            settings,
            memory_manager,
            os_context,
            WddmBackend::new(Arc::clone(wddm)),
        )?),
        (OsInterface::Wddm(wddm), true) => Box::new(CommandStreamReceiverHw::<F, _>::new(
            hw_info,
            settings,
            memory_manager,
            os_context,
            AubDumpBackend::new(WddmBackend::new(Arc::clone(wddm)), AubMemoryStream::new()),
        )?),
    })
}
