pub mod device;
pub mod ioctl;
pub mod memory_manager;

pub use device::DrmDevice;
pub use memory_manager::DrmMemoryManager;

use crate::error::NeoResult;

/// One buffer object of an exec-buffer submission, pinned at `gpu_address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecObject {
    pub handle: u32,
    pub gpu_address: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecBufferRequest {
    /// Every object the batch touches; the batch buffer itself comes last.
    pub objects: Vec<ExecObject>,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub context_id: u32,
    pub flags: u64,
}

/// The subset of the i915 uAPI the driver uses.
pub trait DrmInterface: Send + Sync {
    /// Wraps user memory in a GEM object.
    ///
    /// # Errors
    /// Returns the ioctl error.
    fn gem_userptr(&self, ptr: usize, size: usize, read_only: bool) -> NeoResult<u32>;

    fn gem_close(&self, handle: u32);

    /// # Errors
    /// `DeviceLost` when the kernel reports a hung GPU, otherwise
    /// `SubmissionFailed`.
    fn exec_buffer(&self, request: &ExecBufferRequest) -> NeoResult<()>;

    /// Waits for every submission referencing `handle`; `timeout_ns < 0`
    /// waits forever.
    ///
    /// # Errors
    /// Returns the ioctl error, including `ETIME` on timeout.
    fn gem_wait(&self, handle: u32, timeout_ns: i64) -> NeoResult<()>;

    /// # Errors
    /// Returns the ioctl error.
    fn create_context(&self) -> NeoResult<u32>;

    fn destroy_context(&self, context_id: u32);

    /// # Errors
    /// Returns the ioctl error.
    fn get_param(&self, param: i32) -> NeoResult<i32>;
}
