//! NVM arena layout
//!
//! Bulk data grows up from [`INTERMEDIATE_VALUES_OFFSET`]:
//!
//! ```text
//! | self-test | slot 0 | slot 1 | ... | parameters | samples | labels | -> free <- | control |
//! ```
//!
//! Control structures grow down from the top of the arena, most frequently
//! written first: counters, first-run word, image header, the two commit record
//! copies, then the descriptor, node and input-reference tables.
//!
//! [`NvmLayout::compute`] is a pure function of [`LayoutInputs`]; boot recomputes
//! it from the loaded model and must land on the same offsets as `init` did.

pub mod flags;
pub mod records;

pub use flags::OpFlags;
pub use records::{
    checked_element_count, Counters, ImageHeader, OperationNode, RunState, SlotId, SlotInfo, TensorDescriptor,
    COUNTERS_SIZE, DESCRIPTOR_SIZE, DESC_FOOTPRINTS, DESC_TRANSPOSED, HEADER_SIZE, NODE_SIZE,
    MAX_ELEMENTS, SLOT_INFO_SIZE, SLOT_PARAMETERS, SLOT_TEST_SET,
};

use crate::errors::{EngineError, Result};
use std::ops::Range;

/// Start of the bulk region; bytes below are used by the storage self-test.
pub const INTERMEDIATE_VALUES_OFFSET: u32 = 256;

/// Turning points are 16-bit element offsets.
pub const MAX_SLOT_ELEMENTS: u32 = u16::MAX as u32;

/// Sizes everything else is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutInputs {
    pub nvm_size: u32,
    pub num_slots: u8,
    /// Largest intermediate tensor in bytes
    pub max_intermediate_bytes: u32,
    pub params_len: u32,
    /// Bytes per test sample
    pub sample_len: u32,
    pub n_samples: u16,
    pub nodes_len: u16,
    pub n_input: u16,
    pub n_input_refs: u16,
}

/// Byte range of one intermediate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRegion {
    pub base: u32,
    pub size: u32,
}

impl SlotRegion {
    /// 16-bit elements the slot can hold.
    pub fn elements(&self) -> u32 {
        self.size / 2
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmLayout {
    pub nvm_size: u32,
    pub num_slots: u8,
    pub slot_size: u32,
    pub slots_base: u32,
    pub params_base: u32,
    pub params_len: u32,
    pub samples_base: u32,
    pub sample_len: u32,
    pub n_samples: u16,
    pub labels_base: u32,
    /// First byte above the bulk region
    pub bulk_end: u32,

    pub counters_offset: u32,
    pub first_run_offset: u32,
    pub header_offset: u32,
    pub commit_offsets: [u32; 2],
    pub commit_len: u32,
    pub intermediate_table_offset: u32,
    pub param_table_offset: u32,
    pub node_table_offset: u32,
    pub input_refs_offset: u32,
    /// Lowest byte of the control region
    pub control_start: u32,
}

fn align4(n: u32) -> u32 {
    (n + 3) & !3
}

/// Allocates control structures downwards from the top of the arena.
struct DownCursor {
    top: u64,
}

impl DownCursor {
    fn take(&mut self, len: u64, what: &str) -> Result<u32> {
        self.top = self.top.checked_sub(len).ok_or_else(|| {
            EngineError::Layout(format!("control region underflows while placing {}", what))
        })?;
        Ok(self.top as u32)
    }
}

impl NvmLayout {
    /// Size of one commit record: run state, slot infos, sequence, CRC.
    pub fn commit_record_len(num_slots: u8) -> u32 {
        let n = num_slots as usize;
        (RunState::encoded_len(n) + n * SLOT_INFO_SIZE + 4 + 4) as u32
    }

    pub fn compute(inputs: &LayoutInputs) -> Result<Self> {
        if inputs.num_slots == 0 {
            return Err(EngineError::Layout("at least one slot is required".to_string()));
        }
        let slot_size = align4(inputs.max_intermediate_bytes.max(2));
        if slot_size / 2 > MAX_SLOT_ELEMENTS {
            return Err(EngineError::Layout(format!(
                "slot of {} bytes exceeds {} addressable elements",
                slot_size, MAX_SLOT_ELEMENTS
            )));
        }

        // Bulk region, upwards. Computed in u64 so oversized models report
        // a layout error instead of wrapping.
        let slots_base = INTERMEDIATE_VALUES_OFFSET as u64;
        let params_base = slots_base + inputs.num_slots as u64 * slot_size as u64;
        let samples_base = params_base + align4(inputs.params_len) as u64;
        let sample_stride = align4(inputs.sample_len) as u64;
        let labels_base = samples_base + sample_stride * inputs.n_samples as u64;
        let bulk_end = labels_base + align4(inputs.n_samples as u32) as u64;

        // Control region, downwards.
        let mut cursor = DownCursor {
            top: inputs.nvm_size as u64,
        };
        let counters_offset = cursor.take(COUNTERS_SIZE as u64, "counters")?;
        let first_run_offset = cursor.take(2, "first-run word")?;
        let header_offset = cursor.take(HEADER_SIZE as u64, "image header")?;
        let commit_len = Self::commit_record_len(inputs.num_slots);
        let commit_b = cursor.take(commit_len as u64, "commit record")?;
        let commit_a = cursor.take(commit_len as u64, "commit record")?;
        let intermediate_table_offset = cursor.take(
            inputs.nodes_len as u64 * DESCRIPTOR_SIZE as u64,
            "intermediate descriptors",
        )?;
        let param_table_offset = cursor.take(
            inputs.n_input as u64 * DESCRIPTOR_SIZE as u64,
            "parameter descriptors",
        )?;
        let node_table_offset =
            cursor.take(inputs.nodes_len as u64 * NODE_SIZE as u64, "node table")?;
        let input_refs_offset =
            cursor.take(align4(inputs.n_input_refs as u32 * 2) as u64, "input references")?;
        let control_start = cursor.top;

        if bulk_end > control_start {
            return Err(EngineError::Layout(format!(
                "bulk data ends at {} but control structures start at {} (arena is {} bytes)",
                bulk_end, control_start, inputs.nvm_size
            )));
        }

        Ok(Self {
            nvm_size: inputs.nvm_size,
            num_slots: inputs.num_slots,
            slot_size,
            slots_base: slots_base as u32,
            params_base: params_base as u32,
            params_len: inputs.params_len,
            samples_base: samples_base as u32,
            sample_len: sample_stride as u32,
            n_samples: inputs.n_samples,
            labels_base: labels_base as u32,
            bulk_end: bulk_end as u32,
            counters_offset,
            first_run_offset,
            header_offset,
            commit_offsets: [commit_a, commit_b],
            commit_len,
            intermediate_table_offset,
            param_table_offset,
            node_table_offset,
            input_refs_offset,
            control_start: control_start as u32,
        })
    }

    pub fn slot(&self, slot: u8) -> SlotRegion {
        SlotRegion {
            base: self.slots_base + slot as u32 * self.slot_size,
            size: self.slot_size,
        }
    }

    pub fn sample_offset(&self, sample_idx: u16) -> u32 {
        self.samples_base + sample_idx as u32 * self.sample_len
    }

    pub fn label_offset(&self, sample_idx: u16) -> u32 {
        self.labels_base + sample_idx as u32
    }

    /// Byte range a descriptor refers to.
    pub fn resolve(&self, desc: &TensorDescriptor, sample_idx: u16) -> Result<Range<u32>> {
        let (base, limit) = match desc.slot {
            SlotId::Intermediate(n) if n < self.num_slots => {
                let region = self.slot(n);
                (region.base, region.size)
            }
            SlotId::Intermediate(n) => {
                return Err(EngineError::Invariant(format!(
                    "descriptor names slot {} of {}",
                    n, self.num_slots
                )))
            }
            SlotId::Parameters => (self.params_base, self.params_len),
            SlotId::TestSet => (self.sample_offset(sample_idx), self.sample_len),
        };
        let end = desc.params_offset as u64 + desc.params_len as u64;
        if end > limit as u64 {
            return Err(EngineError::Invariant(format!(
                "descriptor range {}..{} exceeds its region of {} bytes",
                desc.params_offset, end, limit
            )));
        }
        let start = base + desc.params_offset;
        Ok(start..start + desc.params_len)
    }
}
