use crate::memory::host_ptr_defines::OverlapStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NeoError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kernel Driver Error: {0}")]
    Driver(String),

    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("Invalid hardware configuration: {0}")]
    InvalidHwConfig(String),

    #[error("Unknown product for device ID 0x{0:04x}")]
    UnknownProduct(u16),

    #[error("Host pointer 0x{ptr:x} (+0x{size:x}) overlaps a stored fragment: {status:?}")]
    FragmentOverlap {
        ptr: usize,
        size: usize,
        status: OverlapStatus,
    },

    #[error("Batch buffer submission failed: {0}")]
    SubmissionFailed(String),

    #[error("GPU device lost")]
    DeviceLost,

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Invalid debug settings file: {0}")]
    Config(#[from] toml::de::Error),
}

// A convenient alias
pub type NeoResult<T> = Result<T, NeoError>;
