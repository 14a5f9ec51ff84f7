//! Operation parameters packed into the 16-bit node `flags` field.
//!
//! Bits 15..8 carry a generic byte, bits 7..4 the kernel size and bits 3..0
//! the stride. Everything above the record boundary uses [`OpFlags`].

use crate::errors::{EngineError, Result};

const KERNEL_SHIFT: u16 = 4;
const GENERIC_SHIFT: u16 = 8;
const NIBBLE: u16 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags {
    pub generic: u8,
    /// 0 means "derive from the weights" or the operator default
    pub kernel_size: u8,
    /// 0 means the operator default
    pub stride: u8,
}

impl OpFlags {
    pub fn new(kernel_size: u8, stride: u8) -> Result<Self> {
        if kernel_size as u16 > NIBBLE || stride as u16 > NIBBLE {
            return Err(EngineError::Validation(format!(
                "kernel size {} / stride {} do not fit in 4 bits",
                kernel_size, stride
            )));
        }
        Ok(Self {
            generic: 0,
            kernel_size,
            stride,
        })
    }

    pub fn pack(self) -> u16 {
        ((self.generic as u16) << GENERIC_SHIFT)
            | ((self.kernel_size as u16 & NIBBLE) << KERNEL_SHIFT)
            | (self.stride as u16 & NIBBLE)
    }

    pub fn unpack(raw: u16) -> Self {
        Self {
            generic: (raw >> GENERIC_SHIFT) as u8,
            kernel_size: ((raw >> KERNEL_SHIFT) & NIBBLE) as u8,
            stride: (raw & NIBBLE) as u8,
        }
    }

    pub fn stride_or(self, default: u16) -> u16 {
        if self.stride == 0 {
            default
        } else {
            self.stride as u16
        }
    }

    pub fn kernel_or(self, default: u16) -> u16 {
        if self.kernel_size == 0 {
            default
        } else {
            self.kernel_size as u16
        }
    }
}
