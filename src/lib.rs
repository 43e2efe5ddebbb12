//! User-mode driver core for Intel GPUs (Gen9, Gen11, Gen12LP).
//!
//! Capabilities come from the per-generation [`hw_helper`] singletons, work
//! is submitted through a [`command_stream::CommandStreamReceiver`], and host
//! memory is pinned page by page through [`memory::HostPtrManager`].

pub mod bit_helpers;
pub mod command_queue;
pub mod command_stream;
pub mod debug_settings;
pub mod error;
pub mod execution_environment;
pub mod hw_helper;
pub mod hw_info;
pub mod memory;
pub mod os;
pub mod utils;

pub use error::{NeoError, NeoResult};
