#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

// ===============================================================================================
// Memory Constants & Alignment
// ===============================================================================================

pub const PAGE_SIZE: usize = 4096;

/// Width of the GPU virtual address space; bit 47 is sign-extended into the
/// upper bits to form a canonical address.
const GPU_VA_BITS: u32 = 48;

#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[must_use]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Sign-extends a 48-bit GPU address into its canonical 64-bit form.
#[must_use]
pub const fn canonize(address: u64) -> u64 {
    let shift = 64 - GPU_VA_BITS;
    (((address << shift) as i64) >> shift) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment_helpers() {
        assert_eq!(align_down(0x1045, PAGE_SIZE), 0x1000);
        assert_eq!(align_up(0x1045, PAGE_SIZE), 0x2000);
        assert_eq!(align_up(0x2000, PAGE_SIZE), 0x2000);
    }

    #[test]
    fn canonical_addresses_extend_bit_47() {
        assert_eq!(canonize(0x0000_7fff_ffff_f000), 0x0000_7fff_ffff_f000);
        assert_eq!(canonize(0x0000_8000_0000_0000), 0xffff_8000_0000_0000);
    }

    #[test]
    fn drm_ioctl_numbers_match_uapi() {
        // DRM_IOCTL_GEM_CLOSE == _IOW('d', 0x09, struct drm_gem_close)
        assert_eq!(iow::<[u32; 2]>(0x64, 0x09), 0x4008_6409);
    }
}
