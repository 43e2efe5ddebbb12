use crate::error::{NeoError, NeoResult};
use crate::utils::{PAGE_SIZE, align_up};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// A page-aligned, fixed-capacity command buffer.
///
/// The backing memory never moves, so it can be pinned for GPU access once
/// and reused for every submission.
#[derive(Debug)]
pub struct LinearStream {
    ptr: NonNull<u32>,
    layout: Layout,
    used: usize,
}

unsafe impl Send for LinearStream {}

impl LinearStream {
    /// Allocates a zeroed stream of at least `capacity` bytes (rounded up to a page).
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the allocation fails.
    pub fn new(capacity: usize) -> NeoResult<Self> {
        let size = align_up(capacity.max(PAGE_SIZE), PAGE_SIZE);
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| NeoError::OutOfMemory)?;

        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<u32>()).ok_or(NeoError::OutOfMemory)?;

        Ok(Self { ptr, layout, used: 0 })
    }

    #[must_use]
    pub fn cpu_address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub const fn available(&self) -> usize {
        self.layout.size() - self.used
    }

    /// Appends `dwords`.
    ///
    /// # Panics
    /// Panics if the stream does not have room for them; callers reserve
    /// space from the `get_*_size` helpers before programming.
    pub fn emit(&mut self, dwords: &[u32]) {
        let bytes = std::mem::size_of_val(dwords);
        assert!(
            bytes <= self.available(),
            "command stream overflow: {bytes} bytes requested, {} available",
            self.available()
        );

        // SAFETY: the destination range lies within the allocation (checked above)
        // and `used` is always dword aligned.
        unsafe {
            let dst = self.ptr.as_ptr().add(self.used / 4);
            std::ptr::copy_nonoverlapping(dwords.as_ptr(), dst, dwords.len());
        }
        self.used += bytes;
    }

    /// Pads with `MI_NOOP` until `used` is a multiple of `alignment` bytes.
    pub fn align_to(&mut self, alignment: usize) {
        while self.used % alignment != 0 {
            self.emit(&[super::commands::MI_NOOP]);
        }
    }

    /// Rewinds to `offset`, discarding everything written after it.
    ///
    /// # Panics
    /// Panics if `offset` lies past the written region or is not dword aligned.
    pub fn rewind(&mut self, offset: usize) {
        assert!(offset <= self.used && offset % 4 == 0, "invalid rewind offset {offset}");
        self.used = offset;
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// The written dwords in `[start, end)` byte offsets.
    #[must_use]
    pub fn dwords(&self, start: usize, end: usize) -> &[u32] {
        let end = end.min(self.used);
        let start = start.min(end);
        // SAFETY: `[start, end)` is within the initialized, written region.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start / 4), (end - start) / 4) }
    }

    #[must_use]
    pub fn bytes(&self, start: usize, end: usize) -> &[u8] {
        let dwords = self.dwords(start, end);
        // SAFETY: any u32 slice is a valid byte slice of four times the length.
        unsafe { std::slice::from_raw_parts(dwords.as_ptr().cast::<u8>(), dwords.len() * 4) }
    }
}

impl Drop for LinearStream {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast::<u8>(), self.layout) };
    }
}
