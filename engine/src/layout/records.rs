//! Byte-exact durable records.
//!
//! Every record encodes to a fixed number of little-endian bytes. Sizes and
//! field order are part of the NVM format and are re-derived on every boot.

use super::flags::OpFlags;
use crate::errors::{EngineError, Result};
use crate::recovery::TurningPoints;

pub const NODE_SIZE: usize = 64;
pub const NODE_NAME_LEN: usize = 54;
pub const DESCRIPTOR_SIZE: usize = 24;
pub const SLOT_INFO_SIZE: usize = 24;
pub const HEADER_SIZE: usize = 16;
pub const COUNTERS_SIZE: usize = 20;

/// Largest element count of any tensor. Keeps the byte size of 64-bit
/// parameters and footprint-widened activations within `u32`.
pub const MAX_ELEMENTS: u32 = u32::MAX / 32;

/// Product of `shape`, or `None` when it exceeds [`MAX_ELEMENTS`].
pub fn checked_element_count(shape: &[u16]) -> Option<u32> {
    shape
        .iter()
        .try_fold(1u32, |acc, &d| acc.checked_mul(d as u32))
        .filter(|&n| n <= MAX_ELEMENTS)
}

/// Slot identifier for constant parameter storage.
pub const SLOT_PARAMETERS: u8 = 0xFE;
/// Slot identifier for the external test input.
pub const SLOT_TEST_SET: u8 = 0xFF;

/// Values laid out `[c][h][w]` with channels transposed.
pub const DESC_TRANSPOSED: u8 = 0x01;
/// Every `tile_c` values are followed by footprint markers.
pub const DESC_FOOTPRINTS: u8 = 0x02;
const DESC_FOOTPRINT_SHIFT: u8 = 4;

pub const IMAGE_MAGIC: [u8; 4] = *b"ICNN";
pub const IMAGE_VERSION: u16 = 1;

pub(crate) fn read_u16_at(bytes: &[u8], start: usize, field: &str) -> Result<u16> {
    let slice = bytes.get(start..start + 2).ok_or_else(|| {
        EngineError::Corrupt(format!(
            "field {} out of bounds: start={}, len={}",
            field,
            start,
            bytes.len()
        ))
    })?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32_at(bytes: &[u8], start: usize, field: &str) -> Result<u32> {
    let slice = bytes.get(start..start + 4).ok_or_else(|| {
        EngineError::Corrupt(format!(
            "field {} out of bounds: start={}, len={}",
            field,
            start,
            bytes.len()
        ))
    })?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn expect_len(bytes: &[u8], len: usize, record: &str) -> Result<()> {
    if bytes.len() < len {
        return Err(EngineError::Corrupt(format!(
            "{} record too short: expected {}, got {}",
            record,
            len,
            bytes.len()
        )));
    }
    Ok(())
}

/// Where a tensor's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    /// One of the reusable intermediate buffers
    Intermediate(u8),
    Parameters,
    TestSet,
}

impl SlotId {
    pub fn to_raw(self) -> u8 {
        match self {
            SlotId::Intermediate(n) => n,
            SlotId::Parameters => SLOT_PARAMETERS,
            SlotId::TestSet => SLOT_TEST_SET,
        }
    }

    pub fn from_raw(raw: u8) -> Self {
        match raw {
            SLOT_PARAMETERS => SlotId::Parameters,
            SLOT_TEST_SET => SlotId::TestSet,
            n => SlotId::Intermediate(n),
        }
    }

    pub fn intermediate(self) -> Option<u8> {
        match self {
            SlotId::Intermediate(n) => Some(n),
            _ => None,
        }
    }
}

/// One node of the static operation graph (64 bytes on NVM).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationNode {
    pub name: String,
    pub inputs_len: u16,
    /// Index of the first input reference in the input-reference table
    pub inputs_offset: u16,
    /// Last node reading this node's output; `nodes_len` for the graph output
    pub max_output_id: u16,
    pub op_type: u16,
    pub flags: OpFlags,
}

impl OperationNode {
    pub fn encode(&self) -> [u8; NODE_SIZE] {
        let mut out = [0u8; NODE_SIZE];
        let name = self.name.as_bytes();
        let n = name.len().min(NODE_NAME_LEN - 1);
        out[..n].copy_from_slice(&name[..n]);
        out[54..56].copy_from_slice(&self.inputs_len.to_le_bytes());
        out[56..58].copy_from_slice(&self.inputs_offset.to_le_bytes());
        out[58..60].copy_from_slice(&self.max_output_id.to_le_bytes());
        out[60..62].copy_from_slice(&self.op_type.to_le_bytes());
        out[62..64].copy_from_slice(&self.flags.pack().to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, NODE_SIZE, "node")?;
        let name_end = bytes[..NODE_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NODE_NAME_LEN);
        Ok(Self {
            name: String::from_utf8_lossy(&bytes[..name_end]).into_owned(),
            inputs_len: read_u16_at(bytes, 54, "inputs_len")?,
            inputs_offset: read_u16_at(bytes, 56, "inputs_offset")?,
            max_output_id: read_u16_at(bytes, 58, "max_output_id")?,
            op_type: read_u16_at(bytes, 60, "op_type")?,
            flags: OpFlags::unpack(read_u16_at(bytes, 62, "flags")?),
        })
    }
}

/// Constant parameter or intermediate activation (24 bytes on NVM).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDescriptor {
    /// Byte offset inside the region named by `slot`
    pub params_offset: u32,
    /// Byte length including any footprint elements
    pub params_len: u32,
    /// 16, 32 or 64
    pub bitwidth: u8,
    pub slot: SlotId,
    pub tile_c: u16,
    /// Extents, unused trailing entries are 0
    pub dims: [u16; 4],
    pub flags: u8,
}

impl TensorDescriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut out = [0u8; DESCRIPTOR_SIZE];
        out[0..4].copy_from_slice(&self.params_offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.params_len.to_le_bytes());
        out[8] = self.bitwidth;
        out[9] = self.slot.to_raw();
        out[10..12].copy_from_slice(&self.tile_c.to_le_bytes());
        for (i, dim) in self.dims.iter().enumerate() {
            out[12 + 2 * i..14 + 2 * i].copy_from_slice(&dim.to_le_bytes());
        }
        out[20] = self.flags;
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, DESCRIPTOR_SIZE, "descriptor")?;
        let mut dims = [0u16; 4];
        for (i, dim) in dims.iter_mut().enumerate() {
            *dim = read_u16_at(bytes, 12 + 2 * i, "dims")?;
        }
        Ok(Self {
            params_offset: read_u32_at(bytes, 0, "params_offset")?,
            params_len: read_u32_at(bytes, 4, "params_len")?,
            bitwidth: bytes[8],
            slot: SlotId::from_raw(bytes[9]),
            tile_c: read_u16_at(bytes, 10, "tile_c")?,
            dims,
            flags: bytes[20],
        })
    }

    pub fn rank(&self) -> usize {
        self.dims.iter().take_while(|&&d| d != 0).count()
    }

    pub fn shape(&self) -> &[u16] {
        &self.dims[..self.rank()]
    }

    /// Number of logical values.
    pub fn element_count(&self) -> u32 {
        self.shape().iter().map(|&d| d as u32).product()
    }

    pub fn element_size(&self) -> u32 {
        (self.bitwidth / 8) as u32
    }

    /// Footprint elements following every `tile_c` values.
    pub fn footprints(&self) -> u16 {
        if self.flags & DESC_FOOTPRINTS == 0 {
            0
        } else {
            (self.flags >> DESC_FOOTPRINT_SHIFT).max(1) as u16
        }
    }

    pub fn set_footprints(&mut self, count: u16) {
        self.flags &= !(DESC_FOOTPRINTS | (0x0F << DESC_FOOTPRINT_SHIFT));
        if count > 0 {
            self.flags |= DESC_FOOTPRINTS | ((count.min(15) as u8) << DESC_FOOTPRINT_SHIFT);
        }
    }

    /// Values plus footprints in one group.
    pub fn group_stride(&self) -> u32 {
        self.tile_c.max(1) as u32 + self.footprints() as u32
    }

    /// Number of footprint groups.
    pub fn group_count(&self) -> u32 {
        self.element_count() / self.tile_c.max(1) as u32
    }

    /// Stored elements, footprints included.
    pub fn physical_count(&self) -> u32 {
        let n = self.element_count();
        match self.footprints() {
            0 => n,
            fp => n + (n / self.tile_c.max(1) as u32) * fp as u32,
        }
    }

    /// Stored position of logical value `i`.
    pub fn physical_index(&self, i: u32) -> u32 {
        match self.footprints() {
            0 => i,
            fp => i + (i / self.tile_c.max(1) as u32) * fp as u32,
        }
    }
}

/// Durable execution position (14 + 2 * num_slots bytes on NVM).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub nodes_len: u16,
    pub n_input: u16,
    /// Set while a sample is in progress
    pub running: bool,
    /// Set when the current sample was interrupted by a reset
    pub recovery: bool,
    pub run_counter: u16,
    /// Mirror of each slot's committed polarity
    pub state_bits: Vec<bool>,
    /// Next layer to execute; `nodes_len` means the sample is finished
    pub layer_idx: u16,
    pub sample_idx: u16,
}

impl RunState {
    pub fn new(nodes_len: u16, n_input: u16, num_slots: usize) -> Self {
        Self {
            nodes_len,
            n_input,
            running: false,
            recovery: false,
            run_counter: 0,
            state_bits: vec![false; num_slots],
            layer_idx: 0,
            sample_idx: 0,
        }
    }

    pub fn encoded_len(num_slots: usize) -> usize {
        14 + 2 * num_slots
    }

    /// Layer whose results were committed last in the current sample.
    pub fn last_committed_layer(&self) -> Option<u16> {
        self.layer_idx.checked_sub(1)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.state_bits.len()));
        out.extend_from_slice(&self.nodes_len.to_le_bytes());
        out.extend_from_slice(&self.n_input.to_le_bytes());
        out.extend_from_slice(&(self.running as u16).to_le_bytes());
        out.extend_from_slice(&(self.recovery as u16).to_le_bytes());
        out.extend_from_slice(&self.run_counter.to_le_bytes());
        for &bit in &self.state_bits {
            out.extend_from_slice(&(bit as u16).to_le_bytes());
        }
        out.extend_from_slice(&self.layer_idx.to_le_bytes());
        out.extend_from_slice(&self.sample_idx.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8], num_slots: usize) -> Result<Self> {
        expect_len(bytes, Self::encoded_len(num_slots), "run state")?;
        let mut state_bits = Vec::with_capacity(num_slots);
        for i in 0..num_slots {
            state_bits.push(read_u16_at(bytes, 10 + 2 * i, "state_bit")? != 0);
        }
        let tail = 10 + 2 * num_slots;
        Ok(Self {
            nodes_len: read_u16_at(bytes, 0, "nodes_len")?,
            n_input: read_u16_at(bytes, 2, "n_input")?,
            running: read_u16_at(bytes, 4, "running")? != 0,
            recovery: read_u16_at(bytes, 6, "recovery")? != 0,
            run_counter: read_u16_at(bytes, 8, "run_counter")?,
            state_bits,
            layer_idx: read_u16_at(bytes, tail, "layer_idx")?,
            sample_idx: read_u16_at(bytes, tail + 2, "sample_idx")?,
        })
    }
}

/// Per-slot recovery metadata (24 bytes on NVM).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotInfo {
    /// Polarity of the data last committed into the slot, before turning points
    pub state_bit: bool,
    pub turning_points: TurningPoints,
    /// Embedded progress cannot be trusted; the next writer must normalize
    pub untrusted: bool,
    /// Last committed footprint epoch, 0 when none is valid
    pub footprint_epoch: u16,
}

const SLOT_FLAG_UNTRUSTED: u8 = 0x01;

impl SlotInfo {
    pub fn untrusted() -> Self {
        Self {
            untrusted: true,
            ..Self::default()
        }
    }

    /// Embedded bit the committed data at element `x` carries.
    pub fn polarity(&self, x: u32) -> bool {
        self.state_bit ^ self.turning_points.flips_at(x)
    }

    pub fn encode(&self) -> [u8; SLOT_INFO_SIZE] {
        let mut out = [0u8; SLOT_INFO_SIZE];
        out[0] = self.state_bit as u8;
        out[1] = self.turning_points.len() as u8;
        out[2] = if self.untrusted { SLOT_FLAG_UNTRUSTED } else { 0 };
        out[4..6].copy_from_slice(&self.footprint_epoch.to_le_bytes());
        for (i, tp) in self.turning_points.as_slice().iter().enumerate() {
            out[8 + 2 * i..10 + 2 * i].copy_from_slice(&tp.to_le_bytes());
        }
        out
    }

    /// Decode a record; a turning point list that is too long or not strictly
    /// increasing is an invariant violation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, SLOT_INFO_SIZE, "slot info")?;
        let count = bytes[1] as usize;
        let mut raw = Vec::with_capacity(count.min(TurningPoints::CAPACITY));
        if count > TurningPoints::CAPACITY {
            return Err(EngineError::Invariant(format!(
                "slot info holds {} turning points, capacity is {}",
                count,
                TurningPoints::CAPACITY
            )));
        }
        for i in 0..count {
            raw.push(read_u16_at(bytes, 8 + 2 * i, "turning_point")?);
        }
        let turning_points = TurningPoints::from_sorted(&raw).ok_or_else(|| {
            EngineError::Invariant(format!("turning points not strictly increasing: {:?}", raw))
        })?;
        Ok(Self {
            state_bit: bytes[0] != 0,
            turning_points,
            untrusted: bytes[2] & SLOT_FLAG_UNTRUSTED != 0,
            footprint_epoch: read_u16_at(bytes, 4, "footprint_epoch")?,
        })
    }
}

/// Identifies the installed model image (16 bytes on NVM).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: u16,
    pub num_slots: u8,
    pub recovery_mode: u8,
    pub nodes_len: u16,
    pub n_input: u16,
    pub n_samples: u16,
    pub slot_size: u32,
}

impl ImageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&IMAGE_MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6] = self.num_slots;
        out[7] = self.recovery_mode;
        out[8..10].copy_from_slice(&self.nodes_len.to_le_bytes());
        out[10..12].copy_from_slice(&self.n_input.to_le_bytes());
        out[12..14].copy_from_slice(&self.n_samples.to_le_bytes());
        out[14..16].copy_from_slice(&((self.slot_size / 2) as u16).to_le_bytes());
        out
    }

    /// `None` when no image was ever installed.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        expect_len(bytes, HEADER_SIZE, "image header")?;
        if bytes[0..4] != IMAGE_MAGIC {
            return Ok(None);
        }
        Ok(Some(Self {
            version: read_u16_at(bytes, 4, "version")?,
            num_slots: bytes[6],
            recovery_mode: bytes[7],
            nodes_len: read_u16_at(bytes, 8, "nodes_len")?,
            n_input: read_u16_at(bytes, 10, "n_input")?,
            n_samples: read_u16_at(bytes, 12, "n_samples")?,
            slot_size: read_u16_at(bytes, 14, "slot_size")? as u32 * 2,
        }))
    }
}

/// Diagnostic counters; never part of the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub power_cycles: u32,
    pub samples_completed: u32,
    pub elements_computed: u32,
    pub elements_skipped: u32,
    pub fallbacks: u32,
}

impl Counters {
    pub fn encode(&self) -> [u8; COUNTERS_SIZE] {
        let mut out = [0u8; COUNTERS_SIZE];
        let fields = [
            self.power_cycles,
            self.samples_completed,
            self.elements_computed,
            self.elements_skipped,
            self.fallbacks,
        ];
        for (i, value) in fields.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        expect_len(bytes, COUNTERS_SIZE, "counters")?;
        Ok(Self {
            power_cycles: read_u32_at(bytes, 0, "power_cycles")?,
            samples_completed: read_u32_at(bytes, 4, "samples_completed")?,
            elements_computed: read_u32_at(bytes, 8, "elements_computed")?,
            elements_skipped: read_u32_at(bytes, 12, "elements_skipped")?,
            fallbacks: read_u32_at(bytes, 16, "fallbacks")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activation(dims: [u16; 4], tile_c: u16) -> TensorDescriptor {
        TensorDescriptor {
            params_offset: 0,
            params_len: 0,
            bitwidth: 16,
            slot: SlotId::Intermediate(0),
            tile_c,
            dims,
            flags: 0,
        }
    }

    #[test]
    fn test_record_sizes() {
        let node = OperationNode {
            name: "conv1".to_string(),
            inputs_len: 3,
            inputs_offset: 0,
            max_output_id: 1,
            op_type: 1,
            flags: OpFlags::default(),
        };
        assert_eq!(node.encode().len(), 64);
        assert_eq!(activation([1, 4, 2, 2], 4).encode().len(), 24);
        assert_eq!(RunState::new(3, 4, 2).encode().len(), 14 + 2 * 2);
        assert_eq!(RunState::new(3, 4, 5).encode().len(), 14 + 2 * 5);
        assert_eq!(SlotInfo::default().encode().len(), 24);
    }

    #[test]
    fn test_node_field_offsets() {
        let node = OperationNode {
            name: "pool".to_string(),
            inputs_len: 1,
            inputs_offset: 0x0203,
            max_output_id: 7,
            op_type: 3,
            flags: OpFlags::new(2, 2).unwrap(),
        };
        let bytes = node.encode();
        assert_eq!(&bytes[..5], b"pool\0");
        assert_eq!(&bytes[54..56], &[1, 0]);
        assert_eq!(&bytes[56..58], &[3, 2]);
        assert_eq!(&bytes[62..64], &[0x22, 0]);
        assert_eq!(OperationNode::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn test_long_node_name_truncated() {
        let node = OperationNode {
            name: "x".repeat(80),
            inputs_len: 0,
            inputs_offset: 0,
            max_output_id: 0,
            op_type: 0,
            flags: OpFlags::default(),
        };
        let decoded = OperationNode::decode(&node.encode()).unwrap();
        assert_eq!(decoded.name.len(), NODE_NAME_LEN - 1);
    }

    #[test]
    fn test_descriptor_field_offsets() {
        let desc = TensorDescriptor {
            params_offset: 0x0102_0304,
            params_len: 72,
            bitwidth: 32,
            slot: SlotId::Parameters,
            tile_c: 4,
            dims: [8, 4, 3, 3],
            flags: DESC_TRANSPOSED,
        };
        let bytes = desc.encode();
        assert_eq!(&bytes[0..4], &[4, 3, 2, 1]);
        assert_eq!(bytes[8], 32);
        assert_eq!(bytes[9], SLOT_PARAMETERS);
        assert_eq!(&bytes[12..14], &[8, 0]);
        assert_eq!(bytes[20], DESC_TRANSPOSED);
        assert_eq!(TensorDescriptor::decode(&bytes).unwrap(), desc);
    }

    #[test]
    fn test_footprint_geometry() {
        let mut desc = activation([1, 8, 1, 1], 4);
        assert_eq!(desc.physical_count(), 8);

        desc.set_footprints(1);
        assert_eq!(desc.footprints(), 1);
        assert_eq!(desc.group_count(), 2);
        assert_eq!(desc.physical_count(), 10);
        assert_eq!(desc.physical_index(3), 3);
        assert_eq!(desc.physical_index(4), 5);
        assert_eq!(desc.physical_index(7), 8);

        desc.set_footprints(0);
        assert_eq!(desc.flags & DESC_FOOTPRINTS, 0);
    }

    #[test]
    fn test_shape_ignores_unused_dims() {
        let desc = activation([1, 36, 0, 0], 4);
        assert_eq!(desc.rank(), 2);
        assert_eq!(desc.element_count(), 36);
        assert_eq!(checked_element_count(desc.shape()), Some(36));
        assert_eq!(checked_element_count(&[4096, 4096, 4096, 1]), None);
        assert_eq!(checked_element_count(&[u16::MAX, u16::MAX]), None);
    }

    #[test]
    fn test_run_state_layout() {
        let state = RunState {
            nodes_len: 6,
            n_input: 7,
            running: true,
            recovery: false,
            run_counter: 0x1234,
            state_bits: vec![true, false, true],
            layer_idx: 2,
            sample_idx: 9,
        };
        let bytes = state.encode();
        assert_eq!(&bytes[8..10], &[0x34, 0x12]);
        assert_eq!(&bytes[10..16], &[1, 0, 0, 0, 1, 0]);
        assert_eq!(&bytes[16..18], &[2, 0]);
        assert_eq!(RunState::decode(&bytes, 3).unwrap(), state);
        assert_eq!(state.last_committed_layer(), Some(1));
    }

    #[test]
    fn test_slot_info_rejects_unsorted_points() {
        let mut bytes = SlotInfo::default().encode();
        bytes[1] = 2;
        bytes[8..10].copy_from_slice(&9u16.to_le_bytes());
        bytes[10..12].copy_from_slice(&4u16.to_le_bytes());
        let err = SlotInfo::decode(&bytes).unwrap_err();
        assert!(err.is_fatal());

        bytes[1] = 9;
        assert!(SlotInfo::decode(&bytes).is_err());
    }

    #[test]
    fn test_slot_info_roundtrip_with_flags() {
        let info = SlotInfo {
            state_bit: true,
            turning_points: TurningPoints::from_sorted(&[3, 40]).unwrap(),
            untrusted: true,
            footprint_epoch: 77,
        };
        assert_eq!(SlotInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn test_header_absent_without_magic() {
        assert_eq!(ImageHeader::decode(&[0u8; 16]).unwrap(), None);
        let header = ImageHeader {
            version: IMAGE_VERSION,
            num_slots: 3,
            recovery_mode: 1,
            nodes_len: 6,
            n_input: 7,
            n_samples: 4,
            slot_size: 288,
        };
        assert_eq!(ImageHeader::decode(&header.encode()).unwrap(), Some(header));
    }

    #[test]
    fn test_counters_roundtrip() {
        let counters = Counters {
            power_cycles: 3,
            samples_completed: 10,
            elements_computed: 12345,
            elements_skipped: 17,
            fallbacks: 2,
        };
        assert_eq!(Counters::decode(&counters.encode()).unwrap(), counters);
    }
}
