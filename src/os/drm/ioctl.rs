use crate::utils::{iow, iowr};

// ===============================================================================================
// Constants
// ===============================================================================================

pub const DRM_IOCTL_BASE: u32 = 0x64; // 'd'
pub const DRM_COMMAND_BASE: u32 = 0x40;

pub const I915_PARAM_CHIPSET_ID: i32 = 4;
pub const I915_PARAM_REVISION: i32 = 32;

pub const I915_USERPTR_READ_ONLY: u32 = 0x1;

pub const I915_EXEC_RENDER: u64 = 1;
pub const I915_EXEC_BLT: u64 = 3;
pub const I915_EXEC_NO_RELOC: u64 = 1 << 11;
pub const I915_EXEC_BATCH_FIRST: u64 = 1 << 18;

pub const EXEC_OBJECT_SUPPORTS_48B_ADDRESS: u64 = 1 << 3;
pub const EXEC_OBJECT_PINNED: u64 = 1 << 4;

// ===============================================================================================
// Generic DRM
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

// ===============================================================================================
// i915
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetParamArgs {
    pub param: i32,
    pub pad: u32,
    /// Userspace pointer to an `i32` the driver writes the value into.
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemUserptrArgs {
    pub user_ptr: u64,
    pub user_size: u64,
    pub flags: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemExecObject2 {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    pub offset: u64,
    pub flags: u64,
    pub rsvd1: u64,
    pub rsvd2: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemExecbuffer2Args {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    /// Context id.
    pub rsvd1: u64,
    pub rsvd2: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemWaitArgs {
    pub bo_handle: u32,
    pub flags: u32,
    pub timeout_ns: i64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemContextCreateArgs {
    pub ctx_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemContextDestroyArgs {
    pub ctx_id: u32,
    pub pad: u32,
}

const _: () = assert!(std::mem::size_of::<GetParamArgs>() == 16);
const _: () = assert!(std::mem::size_of::<GemUserptrArgs>() == 24);
const _: () = assert!(std::mem::size_of::<GemExecObject2>() == 56);
const _: () = assert!(std::mem::size_of::<GemExecbuffer2Args>() == 64);
const _: () = assert!(std::mem::size_of::<GemWaitArgs>() == 16);

// ===============================================================================================
// IOCTL numbers
// ===============================================================================================

pub const DRM_IOCTL_GEM_CLOSE: u32 = iow::<GemCloseArgs>(DRM_IOCTL_BASE, 0x09);

pub const DRM_IOCTL_I915_GETPARAM: u32 = iowr::<GetParamArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x06);
pub const DRM_IOCTL_I915_GEM_EXECBUFFER2: u32 =
    iow::<GemExecbuffer2Args>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x29);
pub const DRM_IOCTL_I915_GEM_WAIT: u32 = iowr::<GemWaitArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x2c);
pub const DRM_IOCTL_I915_GEM_CONTEXT_CREATE: u32 =
    iowr::<GemContextCreateArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x2d);
pub const DRM_IOCTL_I915_GEM_CONTEXT_DESTROY: u32 =
    iow::<GemContextDestroyArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x2e);
pub const DRM_IOCTL_I915_GEM_USERPTR: u32 = iowr::<GemUserptrArgs>(DRM_IOCTL_BASE, DRM_COMMAND_BASE + 0x33);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        assert_eq!(DRM_IOCTL_I915_GETPARAM, 0xC010_6446);
        assert_eq!(DRM_IOCTL_I915_GEM_EXECBUFFER2, 0x4040_6469);
        assert_eq!(DRM_IOCTL_I915_GEM_WAIT, 0xC010_646C);
        assert_eq!(DRM_IOCTL_I915_GEM_USERPTR, 0xC018_6473);
    }
}
