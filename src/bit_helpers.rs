//! Bit-field primitives used by the command encoders and capability tables.

/// Sets (`value == true`) or clears every bit of `bits` in `field`.
#[must_use]
pub const fn set_bits(field: u64, value: bool, bits: u64) -> u64 {
    if value { field | bits } else { field & !bits }
}

/// Returns whether bit `bit_position` of `field` is set.
///
/// Positions outside `0..64` are never set.
#[must_use]
pub const fn is_bit_set(field: u64, bit_position: u32) -> bool {
    if bit_position >= u64::BITS {
        return false;
    }
    field & (1u64 << bit_position) != 0
}

/// Returns whether any bit of `mask` is set in `field`.
#[must_use]
pub const fn is_any_bit_set(field: u64, mask: u64) -> bool {
    field & mask != 0
}

/// Returns whether every bit of `mask` is set in `field`.
#[must_use]
pub const fn is_value_set(field: u64, mask: u64) -> bool {
    field & mask == mask
}

/// Inserts `value` into the `width` bits of `dword` starting at `shift`.
/// Bits of `value` above `width` are discarded.
#[must_use]
pub const fn set_field(dword: u32, shift: u32, width: u32, value: u32) -> u32 {
    let mask = field_mask(shift, width);
    (dword & !mask) | ((value << shift) & mask)
}

/// Extracts the `width` bits of `dword` starting at `shift`.
#[must_use]
pub const fn get_field(dword: u32, shift: u32, width: u32) -> u32 {
    (dword & field_mask(shift, width)) >> shift
}

const fn field_mask(shift: u32, width: u32) -> u32 {
    if width >= u32::BITS {
        u32::MAX << shift
    } else {
        ((1u32 << width) - 1) << shift
    }
}
