//! Descriptor-driven value access.
//!
//! Activations are `[1, C, H, W]` tensors stored channel-tiled: channels are
//! grouped `tile_c` at a time, and inside a tile values are laid out `h, w, c`.
//! `tile_c == 1` is plain planar order, which is how test samples are stored.

use crate::errors::{EngineError, Result};
use crate::layout::{NvmLayout, SlotId, TensorDescriptor};
use crate::recovery::encoding::unfold;
use crate::storage::DurableStorage;

/// Linear offset of `(c, h, w)` in a channel-tiled `[1, C, H, W]` tensor.
pub fn activation_offset(c: u32, h: u32, w: u32, height: u32, width: u32, tile_c: u32) -> u32 {
    let tile_base = c / tile_c * tile_c;
    height * width * tile_base + (h * width + w) * tile_c + (c - tile_base)
}

/// Inverse of [`activation_offset`].
pub fn activation_coords(i: u32, height: u32, width: u32, tile_c: u32) -> (u32, u32, u32) {
    let tile_span = height * width * tile_c;
    let tile_base = i / tile_span * tile_c;
    let rem = i % tile_span;
    let pos = rem / tile_c;
    (tile_base + rem % tile_c, pos / width, pos % width)
}

/// Largest divisor of `channels` not above `target`.
pub fn fit_tile(channels: u16, target: u16) -> u16 {
    let target = target.clamp(1, channels.max(1));
    (1..=target).rev().find(|t| channels % t == 0).unwrap_or(1)
}

/// Logical values of one tensor, loaded into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    pub dims: [u16; 4],
    pub tile_c: u16,
    pub values: Vec<i32>,
}

impl Tensor {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, i: usize) -> i32 {
        self.values[i]
    }

    pub fn channels(&self) -> u32 {
        self.dims[1] as u32
    }

    pub fn height(&self) -> u32 {
        self.dims[2] as u32
    }

    pub fn width(&self) -> u32 {
        self.dims[3] as u32
    }

    /// Value at `(c, h, w)` of a 4-D activation.
    pub fn at(&self, c: u32, h: u32, w: u32) -> i32 {
        let i = activation_offset(
            c,
            h,
            w,
            self.height(),
            self.width(),
            self.tile_c.max(1) as u32,
        );
        self.values[i as usize]
    }

    /// Index of the largest value; ties go to the lowest index.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, i32)> = None;
        for (i, &v) in self.values.iter().enumerate() {
            if best.map_or(true, |(_, b)| v > b) {
                best = Some((i, v));
            }
        }
        best.map(|(i, _)| i)
    }
}

fn decode_values(desc: &TensorDescriptor, bytes: &[u8]) -> Result<Vec<i64>> {
    let n = desc.element_count() as usize;
    let mut values = Vec::with_capacity(n);
    match (desc.slot, desc.bitwidth) {
        (SlotId::Intermediate(_), 16) => {
            for i in 0..n as u32 {
                let at = desc.physical_index(i) as usize * 2;
                values.push(unfold(i16::from_le_bytes([bytes[at], bytes[at + 1]])) as i64);
            }
        }
        (_, 16) => {
            for chunk in bytes.chunks_exact(2).take(n) {
                values.push(i16::from_le_bytes([chunk[0], chunk[1]]) as i64);
            }
        }
        (_, 32) => {
            for chunk in bytes.chunks_exact(4).take(n) {
                values.push(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64);
            }
        }
        (_, 64) => {
            for chunk in bytes.chunks_exact(8).take(n) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                values.push(i64::from_le_bytes(raw));
            }
        }
        (slot, bits) => {
            return Err(EngineError::Invariant(format!(
                "cannot read {}-bit values from {:?}",
                bits, slot
            )))
        }
    }
    if values.len() != n {
        return Err(EngineError::Invariant(format!(
            "descriptor covers {} bytes, too short for {} values",
            bytes.len(),
            n
        )));
    }
    Ok(values)
}

/// Read every logical value `desc` refers to, skipping footprints and
/// stripping embedded recovery bits.
pub fn read_raw(
    storage: &mut dyn DurableStorage,
    layout: &NvmLayout,
    desc: &TensorDescriptor,
    sample_idx: u16,
) -> Result<Vec<i64>> {
    let range = layout.resolve(desc, sample_idx)?;
    let bytes = storage.read_vec(range.start, (range.end - range.start) as usize)?;
    decode_values(desc, &bytes)
}

pub fn read_tensor(
    storage: &mut dyn DurableStorage,
    layout: &NvmLayout,
    desc: &TensorDescriptor,
    sample_idx: u16,
) -> Result<Tensor> {
    let values = read_raw(storage, layout, desc, sample_idx)?
        .into_iter()
        .map(|v| v.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        .collect();
    Ok(Tensor {
        dims: desc.dims,
        tile_c: desc.tile_c,
        values,
    })
}
