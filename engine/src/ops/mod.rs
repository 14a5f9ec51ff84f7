//! Operation registry
//!
//! Each operator has a fixed arity, an in-place flag, a handler that computes
//! its output elements in increasing order from the resume point, and an
//! allocator that derives the output descriptor at model load. The controller
//! drives them without knowing their arithmetic.
//!
//! Arithmetic is Q15: products are shifted right by 15 and results saturate
//! into the legal value range on write.

mod context;
mod conv;
mod elementwise;
mod matmul;
mod pool;
mod view;

pub use context::{ExecEnv, OpContext, OpSummary};

use crate::errors::{EngineError, Result};
use crate::layout::{checked_element_count, OpFlags, SlotId, TensorDescriptor, MAX_ELEMENTS};
use crate::tensor::fit_tile;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Conv,
    MatMul,
    MaxPool,
    Relu,
    Reshape,
    Squeeze,
}

impl OpKind {
    pub const ALL: [OpKind; 7] = [
        OpKind::Add,
        OpKind::Conv,
        OpKind::MatMul,
        OpKind::MaxPool,
        OpKind::Relu,
        OpKind::Reshape,
        OpKind::Squeeze,
    ];

    /// Tag stored in the node record.
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn name(self) -> &'static str {
        spec(self).name
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::Validation(format!("unsupported operator '{}'", s)))
    }
}

/// What an allocator knows besides the input descriptors.
#[derive(Debug, Clone, Default)]
pub struct AllocContext {
    /// Target channel tile for outputs
    pub tile_c: u16,
    /// Footprints per output group, 0 when the scheme uses none
    pub footprints: u16,
    /// Integer values of constant inputs, aligned with the inputs
    pub constants: Vec<Option<Vec<i64>>>,
}

pub type Handler =
    fn(&mut OpContext<'_>, &[TensorDescriptor], &TensorDescriptor, OpFlags) -> Result<()>;

pub type Allocator = fn(&AllocContext, &[TensorDescriptor], OpFlags) -> Result<TensorDescriptor>;

pub struct OpSpec {
    pub kind: OpKind,
    pub name: &'static str,
    pub expected_inputs_len: usize,
    /// Output aliases input 0; nothing is computed or written
    pub inplace_update: bool,
    pub handler: Handler,
    pub allocator: Allocator,
}

impl fmt::Debug for OpSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpSpec")
            .field("name", &self.name)
            .field("expected_inputs_len", &self.expected_inputs_len)
            .field("inplace_update", &self.inplace_update)
            .finish()
    }
}

static REGISTRY: [OpSpec; 7] = [
    OpSpec {
        kind: OpKind::Add,
        name: "Add",
        expected_inputs_len: 2,
        inplace_update: false,
        handler: elementwise::add,
        allocator: elementwise::alloc_add,
    },
    OpSpec {
        kind: OpKind::Conv,
        name: "Conv",
        expected_inputs_len: 3,
        inplace_update: false,
        handler: conv::conv,
        allocator: conv::alloc_conv,
    },
    OpSpec {
        kind: OpKind::MatMul,
        name: "MatMul",
        expected_inputs_len: 2,
        inplace_update: false,
        handler: matmul::matmul,
        allocator: matmul::alloc_matmul,
    },
    OpSpec {
        kind: OpKind::MaxPool,
        name: "MaxPool",
        expected_inputs_len: 1,
        inplace_update: false,
        handler: pool::max_pool,
        allocator: pool::alloc_max_pool,
    },
    OpSpec {
        kind: OpKind::Relu,
        name: "Relu",
        expected_inputs_len: 1,
        inplace_update: false,
        handler: elementwise::relu,
        allocator: elementwise::alloc_relu,
    },
    OpSpec {
        kind: OpKind::Reshape,
        name: "Reshape",
        expected_inputs_len: 2,
        inplace_update: true,
        handler: view::alias,
        allocator: view::alloc_reshape,
    },
    OpSpec {
        kind: OpKind::Squeeze,
        name: "Squeeze",
        expected_inputs_len: 1,
        inplace_update: true,
        handler: view::alias,
        allocator: view::alloc_squeeze,
    },
];

pub fn registry() -> &'static [OpSpec] {
    &REGISTRY
}

pub fn spec(kind: OpKind) -> &'static OpSpec {
    &REGISTRY[kind as usize]
}

/// Fresh 16-bit activation descriptor for an operator output.
///
/// The slot is assigned later by the Slot Manager.
pub(crate) fn activation_output(ctx: &AllocContext, dims: [u16; 4]) -> Result<TensorDescriptor> {
    let rank = dims.iter().take_while(|&&d| d != 0).count();
    if checked_element_count(&dims[..rank]).is_none() {
        return Err(EngineError::Validation(format!(
            "output shape {:?} exceeds {} elements",
            &dims[..rank],
            MAX_ELEMENTS
        )));
    }
    let channels = if rank >= 2 { dims[1] } else { dims[0] };
    let mut desc = TensorDescriptor {
        params_offset: 0,
        params_len: 0,
        bitwidth: 16,
        slot: SlotId::Intermediate(0),
        tile_c: fit_tile(channels, ctx.tile_c),
        dims,
        flags: 0,
    };
    desc.set_footprints(ctx.footprints);
    desc.params_len = desc.physical_count() * 2;
    Ok(desc)
}

pub(crate) fn expect_rank(desc: &TensorDescriptor, rank: usize, what: &str) -> Result<()> {
    if desc.rank() != rank {
        return Err(EngineError::Validation(format!(
            "{} must have rank {}, got shape {:?}",
            what,
            rank,
            desc.shape()
        )));
    }
    Ok(())
}

/// 4-D activation with a batch of one.
pub(crate) fn expect_activation(desc: &TensorDescriptor, what: &str) -> Result<()> {
    expect_rank(desc, 4, what)?;
    if desc.dims[0] != 1 {
        return Err(EngineError::Validation(format!(
            "{} must have batch size 1, got {}",
            what, desc.dims[0]
        )));
    }
    if desc.dims[1] % desc.tile_c.max(1) != 0 {
        return Err(EngineError::Validation(format!(
            "{} has {} channels, not a multiple of tile_c {}",
            what,
            desc.dims[1],
            desc.tile_c
        )));
    }
    Ok(())
}

/// Drop the Q15 scale of an accumulator.
pub(crate) fn narrow(acc: i64) -> i32 {
    (acc >> 15).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::checkpoint::{CommitLog, DurableState};
    use crate::config::RecoveryMode;
    use crate::layout::{LayoutInputs, NvmLayout, RunState, SlotInfo};
    use crate::recovery::{strategy_for, RecoveryStrategy};
    use crate::storage::{DurableStorage, MemStorage};
    use crate::tensor::{read_tensor, Tensor};

    /// One operator run against an in-memory arena.
    pub struct Bench {
        pub storage: MemStorage,
        pub layout: NvmLayout,
        pub strategy: Box<dyn RecoveryStrategy>,
        pub log: CommitLog,
        pub state: DurableState,
        param_cursor: u32,
    }

    impl Bench {
        pub fn new(mode: RecoveryMode) -> Self {
            let layout = NvmLayout::compute(&LayoutInputs {
                nvm_size: 16 * 1024,
                num_slots: 2,
                max_intermediate_bytes: 1024,
                params_len: 4096,
                sample_len: 512,
                n_samples: 1,
                nodes_len: 1,
                n_input: 4,
                n_input_refs: 4,
            })
            .unwrap();
            let mut storage = MemStorage::new(16 * 1024, 256);
            let strategy = strategy_for(mode);
            let mut state = DurableState {
                run_state: RunState::new(1, 4, 2),
                slots: vec![SlotInfo::untrusted(), SlotInfo::untrusted()],
            };
            for s in 0..2u8 {
                strategy
                    .normalize(&mut storage, layout.slot(s), &mut state.slots[s as usize])
                    .unwrap();
            }
            Self {
                storage,
                log: CommitLog::new(&layout),
                layout,
                strategy,
                state,
                param_cursor: 0,
            }
        }

        /// Store 16-bit parameter values and describe them.
        pub fn param(&mut self, dims: [u16; 4], values: &[i16]) -> TensorDescriptor {
            self.param_wide(dims, values.iter().map(|&v| v as i64).collect(), 16)
        }

        pub fn param_wide(&mut self, dims: [u16; 4], values: Vec<i64>, bitwidth: u8) -> TensorDescriptor {
            let size = bitwidth as u32 / 8;
            let mut bytes = Vec::new();
            for v in values {
                match bitwidth {
                    16 => bytes.extend_from_slice(&(v as i16).to_le_bytes()),
                    32 => bytes.extend_from_slice(&(v as i32).to_le_bytes()),
                    _ => bytes.extend_from_slice(&v.to_le_bytes()),
                }
            }
            let desc = TensorDescriptor {
                params_offset: self.param_cursor,
                params_len: bytes.len() as u32,
                bitwidth,
                slot: SlotId::Parameters,
                tile_c: 1,
                dims,
                flags: 0,
            };
            self.storage
                .write_segmented(self.layout.params_base + self.param_cursor, &bytes)
                .unwrap();
            self.param_cursor += (bytes.len() as u32 + size).next_multiple_of(8);
            desc
        }

        /// Store a planar test sample and describe it.
        pub fn sample(&mut self, dims: [u16; 4], values: &[i16]) -> TensorDescriptor {
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            self.storage
                .write_segmented(self.layout.sample_offset(0), &bytes)
                .unwrap();
            TensorDescriptor {
                params_offset: 0,
                params_len: bytes.len() as u32,
                bitwidth: 16,
                slot: SlotId::TestSet,
                tile_c: 1,
                dims,
                flags: 0,
            }
        }

        pub fn alloc_ctx(&self) -> AllocContext {
            AllocContext {
                tile_c: 4,
                footprints: match self.strategy.mode() {
                    RecoveryMode::TurningPoints => 0,
                    RecoveryMode::Footprints => 1,
                },
                constants: Vec::new(),
            }
        }

        /// Allocate and run `kind` into slot `slot`, committing like the controller.
        pub fn run(
            &mut self,
            kind: OpKind,
            inputs: &[TensorDescriptor],
            flags: OpFlags,
            slot: u8,
        ) -> TensorDescriptor {
            let spec = spec(kind);
            let mut output = (spec.allocator)(&self.alloc_ctx(), inputs, flags).unwrap();
            output.slot = SlotId::Intermediate(slot);
            let region = self.layout.slot(slot);
            let resume = self
                .strategy
                .progress(&mut self.storage, region, &output, &self.state.slots[slot as usize])
                .unwrap();
            let env = ExecEnv {
                storage: &mut self.storage,
                layout: &self.layout,
                strategy: self.strategy.as_ref(),
                log: &mut self.log,
                state: &mut self.state,
            };
            let mut ctx = OpContext::new(env, 0, output, resume).unwrap();
            (spec.handler)(&mut ctx, inputs, &output, flags).unwrap();
            let summary = ctx.finish().unwrap();
            self.strategy.complete(
                &mut self.state.slots[slot as usize],
                summary.written,
                region,
            );
            output
        }

        pub fn read(&mut self, desc: &TensorDescriptor) -> Tensor {
            read_tensor(&mut self.storage, &self.layout, desc, 0).unwrap()
        }
    }
}
