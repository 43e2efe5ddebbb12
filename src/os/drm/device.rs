use crate::error::{NeoError, NeoResult};
use crate::os::drm::ioctl::{
    DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_I915_GEM_CONTEXT_CREATE, DRM_IOCTL_I915_GEM_CONTEXT_DESTROY,
    DRM_IOCTL_I915_GEM_EXECBUFFER2, DRM_IOCTL_I915_GEM_USERPTR, DRM_IOCTL_I915_GEM_WAIT,
    DRM_IOCTL_I915_GETPARAM, EXEC_OBJECT_PINNED, EXEC_OBJECT_SUPPORTS_48B_ADDRESS, GemCloseArgs,
    GemContextCreateArgs, GemContextDestroyArgs, GemExecObject2, GemExecbuffer2Args, GemUserptrArgs,
    GemWaitArgs, GetParamArgs, I915_USERPTR_READ_ONLY,
};
use crate::os::drm::{DrmInterface, ExecBufferRequest};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const RENDER_NODE_FIRST: u32 = 128;
const RENDER_NODE_LAST: u32 = 191;

/// A handle to an i915 render node (`/dev/dri/renderD*`).
///
/// The file is shared through an `Arc`, so clones are cheap and keep the
/// node open for as long as any receiver or memory manager needs it.
#[derive(Clone, Debug)]
pub struct DrmDevice {
    pub file: Arc<File>,
}

impl DrmDevice {
    /// # Errors
    /// Returns an error if the node cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file: Arc::new(file) })
    }

    /// Opens the first render node that answers an i915 `GETPARAM`.
    ///
    /// # Errors
    /// Returns `NotFound` if no node qualifies.
    pub fn open_first() -> io::Result<Self> {
        for minor in RENDER_NODE_FIRST..=RENDER_NODE_LAST {
            let path = format!("/dev/dri/renderD{minor}");
            let Ok(device) = Self::open(&path) else {
                continue;
            };
            if device.get_param(crate::os::drm::ioctl::I915_PARAM_CHIPSET_ID).is_ok() {
                debug!(path, "opened i915 render node");
                return Ok(device);
            }
        }
        Err(io::Error::new(io::ErrorKind::NotFound, "no i915 render node found"))
    }

    /// Generic unsafe helper to execute an IOCTL. Retries on `EINTR`/`EAGAIN`.
    ///
    /// # Safety
    /// The caller must ensure that `arg` is the argument type `cmd` expects.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR | libc::EAGAIN) => {}
                _ => return Err(err),
            }
        }
    }
}

impl DrmInterface for DrmDevice {
    fn gem_userptr(&self, ptr: usize, size: usize, read_only: bool) -> NeoResult<u32> {
        let mut args = GemUserptrArgs {
            user_ptr: ptr as u64,
            user_size: size as u64,
            flags: if read_only { I915_USERPTR_READ_ONLY } else { 0 },
            handle: 0,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_USERPTR, &mut args)? };
        Ok(args.handle)
    }

    fn gem_close(&self, handle: u32) {
        let mut args = GemCloseArgs { handle, pad: 0 };
        if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) } {
            warn!(handle, "GEM_CLOSE failed: {e}");
        }
    }

    fn exec_buffer(&self, request: &ExecBufferRequest) -> NeoResult<()> {
        let mut objects: Vec<GemExecObject2> = request
            .objects
            .iter()
            .map(|o| GemExecObject2 {
                handle: o.handle,
                offset: o.gpu_address,
                flags: EXEC_OBJECT_PINNED | EXEC_OBJECT_SUPPORTS_48B_ADDRESS,
                ..GemExecObject2::default()
            })
            .collect();

        let mut args = GemExecbuffer2Args {
            buffers_ptr: objects.as_mut_ptr() as u64,
            buffer_count: objects.len() as u32,
            batch_start_offset: request.batch_start_offset,
            batch_len: request.batch_len,
            flags: request.flags,
            rsvd1: u64::from(request.context_id),
            ..GemExecbuffer2Args::default()
        };

        match unsafe { self.ioctl(DRM_IOCTL_I915_GEM_EXECBUFFER2, &mut args) } {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Err(NeoError::DeviceLost),
            Err(e) => Err(NeoError::SubmissionFailed(e.to_string())),
        }
    }

    fn gem_wait(&self, handle: u32, timeout_ns: i64) -> NeoResult<()> {
        let mut args = GemWaitArgs {
            bo_handle: handle,
            flags: 0,
            timeout_ns,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_WAIT, &mut args)? };
        Ok(())
    }

    fn create_context(&self) -> NeoResult<u32> {
        let mut args = GemContextCreateArgs::default();
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_CREATE, &mut args)? };
        Ok(args.ctx_id)
    }

    fn destroy_context(&self, context_id: u32) {
        let mut args = GemContextDestroyArgs {
            ctx_id: context_id,
            pad: 0,
        };
        if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_DESTROY, &mut args) } {
            warn!(context_id, "context destroy failed: {e}");
        }
    }

    fn get_param(&self, param: i32) -> NeoResult<i32> {
        let mut value: i32 = 0;
        let mut args = GetParamArgs {
            param,
            pad: 0,
            value: (&raw mut value) as u64,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GETPARAM, &mut args)? };
        Ok(value)
    }
}
