//! Q15 values carrying one embedded recovery bit.
//!
//! Legal values lie in `LEGAL_MIN..=LEGAL_MAX`. A value with bit 1 is stored
//! shifted down by [`STATE_OFFSET`] into the otherwise unused range below
//! [`STATE_THRESHOLD`]; `i16::MIN` is a sentinel that never carries a bit.

pub const LEGAL_MAX: i16 = 0x1FFF;
pub const LEGAL_MIN: i16 = -0x1FFF;
pub const STATE_THRESHOLD: i16 = -0x4000;
pub const STATE_OFFSET: i16 = 0x6000;
pub const SENTINEL: i16 = i16::MIN;

/// Clamp an arithmetic result into the legal range.
pub fn saturate(value: i32) -> i16 {
    value.clamp(LEGAL_MIN as i32, LEGAL_MAX as i32) as i16
}

pub fn fold(value: i16, bit: bool) -> i16 {
    if value == SENTINEL {
        return SENTINEL;
    }
    let value = saturate(value as i32);
    if bit {
        value - STATE_OFFSET
    } else {
        value
    }
}

pub fn unfold(stored: i16) -> i16 {
    if embedded_bit(stored) {
        stored + STATE_OFFSET
    } else {
        stored
    }
}

pub fn embedded_bit(stored: i16) -> bool {
    stored < STATE_THRESHOLD && stored != SENTINEL
}
