//! Model loading and validation.
//!
//! Turns a [`ModelSpec`] into the static graph the controller executes:
//! quantized parameter and sample blobs, one descriptor per parameter and per
//! node output, liveness (`max_output_id`) and slot assignments. Everything
//! that can be wrong with a model is reported here, before anything touches
//! NVM.

use super::spec::{quantize, quantize_sample, ModelSpec, INPUT_NAME};
use crate::errors::{EngineError, Result};
use crate::layout::{
    checked_element_count, LayoutInputs, NvmLayout, OpFlags, OperationNode, SlotId,
    TensorDescriptor, DESC_TRANSPOSED, MAX_ELEMENTS,
};
use crate::ops::{self, AllocContext, OpKind};
use crate::slots::{last_uses, PlanNode, SlotManager, TensorRef};
use std::collections::HashMap;
use tracing::{debug, info};

/// Label byte stored for samples without one.
pub const NO_LABEL: u8 = 0xFF;

/// Load-time choices that shape descriptors and slot planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphOptions {
    pub num_slots: u8,
    /// Target channel tile for node outputs
    pub tile_c: u16,
    /// Footprint elements after each output tile, 0 without footprints
    pub footprints_per_tile: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub name: String,
    pub kind: OpKind,
    /// Input references: `< n_input` names a parameter, above that a node
    pub inputs: Vec<u16>,
    pub flags: OpFlags,
    /// Last node reading this output; `nodes_len` for the graph output
    pub max_output_id: u16,
}

#[derive(Debug, Clone)]
pub struct ModelGraph {
    pub name: String,
    pub options: GraphOptions,
    pub nodes: Vec<GraphNode>,
    /// Descriptor 0 is the test input, the rest are parameters
    pub params: Vec<TensorDescriptor>,
    /// One descriptor per node output
    pub outputs: Vec<TensorDescriptor>,
    pub param_blob: Vec<u8>,
    /// All samples back to back, `sample_len` bytes each
    pub sample_blob: Vec<u8>,
    pub sample_len: u32,
    pub labels: Vec<u8>,
    pub max_intermediate_bytes: u32,
}

fn pad_dims(dims: &[u16], what: &str) -> Result<[u16; 4]> {
    if dims.is_empty() || dims.len() > 4 || dims.contains(&0) {
        return Err(EngineError::Validation(format!(
            "{} has unsupported shape {:?}",
            what, dims
        )));
    }
    if checked_element_count(dims).is_none() {
        return Err(EngineError::Validation(format!(
            "{} shape {:?} exceeds {} elements",
            what, dims, MAX_ELEMENTS
        )));
    }
    let mut out = [0u16; 4];
    out[..dims.len()].copy_from_slice(dims);
    Ok(out)
}

fn encode_values(values: &[i64], bitwidth: u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * bitwidth as usize / 8);
    for &v in values {
        match bitwidth {
            16 => bytes.extend_from_slice(&(v as i16).to_le_bytes()),
            32 => bytes.extend_from_slice(&(v as i32).to_le_bytes()),
            _ => bytes.extend_from_slice(&v.to_le_bytes()),
        }
    }
    bytes
}

impl ModelGraph {
    pub fn load(spec: &ModelSpec, options: &GraphOptions) -> Result<Self> {
        if spec.nodes.is_empty() {
            return Err(EngineError::Validation("model has no nodes".to_string()));
        }
        if spec.samples.is_empty() {
            return Err(EngineError::Validation("model has no test samples".to_string()));
        }
        if spec.samples.len() > u16::MAX as usize {
            return Err(EngineError::Validation(format!(
                "model has {} test samples, at most {} are supported",
                spec.samples.len(),
                u16::MAX
            )));
        }
        if !spec.labels.is_empty() && spec.labels.len() != spec.samples.len() {
            return Err(EngineError::Validation(format!(
                "{} labels for {} samples",
                spec.labels.len(),
                spec.samples.len()
            )));
        }
        let n_input = 1 + spec.parameters.len();
        if n_input + spec.nodes.len() > u16::MAX as usize {
            return Err(EngineError::Validation("model has too many tensors".to_string()));
        }

        let mut names: HashMap<&str, u16> = HashMap::new();
        names.insert(INPUT_NAME, 0);

        // Test input and samples.
        let input = TensorDescriptor {
            params_offset: 0,
            params_len: 0,
            bitwidth: 16,
            slot: SlotId::TestSet,
            tile_c: 1,
            dims: pad_dims(&spec.input, "model input")?,
            flags: 0,
        };
        let input_len = input.element_count();
        let input = TensorDescriptor {
            params_len: input_len * 2,
            ..input
        };
        let mut sample_blob = Vec::with_capacity(spec.samples.len() * input_len as usize * 2);
        for (i, sample) in spec.samples.iter().enumerate() {
            if sample.len() != input_len as usize {
                return Err(EngineError::Validation(format!(
                    "sample {} has {} values, input needs {}",
                    i,
                    sample.len(),
                    input_len
                )));
            }
            for &v in sample {
                sample_blob.extend_from_slice(&quantize_sample(v).to_le_bytes());
            }
        }

        // Parameters, each 8-byte aligned in the blob.
        let mut params = vec![input];
        let mut constants: Vec<Option<Vec<i64>>> = vec![None];
        let mut param_blob = Vec::new();
        for (i, p) in spec.parameters.iter().enumerate() {
            let what = format!("parameter '{}'", p.name);
            let dims = pad_dims(&p.dims, &what)?;
            let count: usize = p.dims.iter().map(|&d| d as usize).product();
            if p.values.len() != count {
                return Err(EngineError::Validation(format!(
                    "{} has {} values for shape {:?}",
                    what,
                    p.values.len(),
                    p.dims
                )));
            }
            let values = quantize(&p.values, p.bitwidth)?;
            let bytes = encode_values(&values, p.bitwidth);
            params.push(TensorDescriptor {
                params_offset: param_blob.len() as u32,
                params_len: bytes.len() as u32,
                bitwidth: p.bitwidth,
                slot: SlotId::Parameters,
                tile_c: 1,
                dims,
                flags: if p.transposed { DESC_TRANSPOSED } else { 0 },
            });
            constants.push((p.bitwidth == 64).then_some(values));
            param_blob.extend_from_slice(&bytes);
            param_blob.resize(param_blob.len().next_multiple_of(8), 0);

            if names.insert(p.name.as_str(), (i + 1) as u16).is_some() {
                return Err(EngineError::Validation(format!("duplicate tensor name '{}'", p.name)));
            }
        }

        // Nodes, in execution order.
        let alloc_base = AllocContext {
            tile_c: options.tile_c,
            footprints: options.footprints_per_tile,
            constants: Vec::new(),
        };
        let mut nodes = Vec::with_capacity(spec.nodes.len());
        let mut outputs: Vec<TensorDescriptor> = Vec::with_capacity(spec.nodes.len());
        let mut plan = Vec::with_capacity(spec.nodes.len());
        for (k, node) in spec.nodes.iter().enumerate() {
            let kind: OpKind = node.op.parse()?;
            let op = ops::spec(kind);
            if node.inputs.len() != op.expected_inputs_len {
                return Err(EngineError::Validation(format!(
                    "node '{}' ({}) takes {} inputs, got {}",
                    node.name,
                    kind,
                    op.expected_inputs_len,
                    node.inputs.len()
                )));
            }
            let refs = node
                .inputs
                .iter()
                .map(|name| {
                    names.get(name.as_str()).copied().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "node '{}' reads unknown or later tensor '{}'",
                            node.name, name
                        ))
                    })
                })
                .collect::<Result<Vec<u16>>>()?;

            let descriptor = |r: u16| -> TensorDescriptor {
                match (r as usize).checked_sub(n_input) {
                    Some(j) => outputs[j],
                    None => params[r as usize],
                }
            };
            let inputs: Vec<TensorDescriptor> = refs.iter().map(|&r| descriptor(r)).collect();
            let ctx = AllocContext {
                constants: refs
                    .iter()
                    .map(|&r| constants.get(r as usize).cloned().flatten())
                    .collect(),
                ..alloc_base.clone()
            };
            let flags = OpFlags::new(node.kernel_size.unwrap_or(0), node.stride.unwrap_or(0))?;
            let output = (op.allocator)(&ctx, &inputs, flags).map_err(|e| match e {
                EngineError::Validation(msg) => {
                    EngineError::Validation(format!("node '{}': {}", node.name, msg))
                }
                other => other,
            })?;
            debug!(node = %node.name, op = %kind, shape = ?output.shape(), tile_c = output.tile_c, "Node allocated");

            plan.push(PlanNode {
                inputs: refs
                    .iter()
                    .map(|&r| match (r as usize).checked_sub(n_input) {
                        Some(j) => TensorRef::Node(j),
                        None => TensorRef::External,
                    })
                    .collect(),
                inplace: op.inplace_update,
            });
            outputs.push(output);
            nodes.push(GraphNode {
                name: node.name.clone(),
                kind,
                inputs: refs,
                flags,
                max_output_id: 0,
            });
            if names.insert(node.name.as_str(), (n_input + k) as u16).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate tensor name '{}'",
                    node.name
                )));
            }
        }

        // Liveness and slots.
        let last = last_uses(&plan);
        let slots = SlotManager::plan(&plan, options.num_slots)?;
        let mut max_intermediate_bytes = 0u32;
        for k in 0..nodes.len() {
            nodes[k].max_output_id = last[k] as u16;
            if plan[k].inplace {
                // views keep the bytes of what they alias
                if let TensorRef::Node(src) = plan[k].inputs[0] {
                    outputs[k].slot = outputs[src].slot;
                    outputs[k].params_offset = outputs[src].params_offset;
                }
                continue;
            }
            let slot = slots[k].ok_or_else(|| {
                EngineError::Invariant(format!("node {} computed without a slot", k))
            })?;
            outputs[k].slot = SlotId::Intermediate(slot);
            max_intermediate_bytes = max_intermediate_bytes.max(outputs[k].params_len);
        }

        let labels = if spec.labels.is_empty() {
            vec![NO_LABEL; spec.samples.len()]
        } else {
            spec.labels.clone()
        };

        let graph = Self {
            name: spec.name.clone(),
            options: *options,
            nodes,
            params,
            outputs,
            param_blob,
            sample_blob,
            sample_len: input_len * 2,
            labels,
            max_intermediate_bytes,
        };
        info!(
            model = %graph.name,
            nodes = graph.nodes.len(),
            parameters = graph.params.len() - 1,
            samples = graph.n_samples(),
            slot_bytes = graph.max_intermediate_bytes,
            "Model graph loaded"
        );
        Ok(graph)
    }

    pub fn nodes_len(&self) -> u16 {
        self.nodes.len() as u16
    }

    /// Parameter descriptors including the test input.
    pub fn n_input(&self) -> u16 {
        self.params.len() as u16
    }

    pub fn n_samples(&self) -> u16 {
        self.labels.len() as u16
    }

    /// Descriptor behind an input reference.
    pub fn descriptor(&self, r: u16) -> TensorDescriptor {
        match (r as usize).checked_sub(self.params.len()) {
            Some(j) => self.outputs[j],
            None => self.params[r as usize],
        }
    }

    pub fn inputs_of(&self, k: usize) -> Vec<TensorDescriptor> {
        self.nodes[k]
            .inputs
            .iter()
            .map(|&r| self.descriptor(r))
            .collect()
    }

    /// Descriptor of the graph output read at the end of a sample.
    pub fn final_output(&self) -> TensorDescriptor {
        self.outputs[self.outputs.len() - 1]
    }

    /// Node records as stored in the node table.
    pub fn operation_nodes(&self) -> Vec<OperationNode> {
        let mut offset = 0u16;
        self.nodes
            .iter()
            .map(|node| {
                let record = OperationNode {
                    name: node.name.clone(),
                    inputs_len: node.inputs.len() as u16,
                    inputs_offset: offset,
                    max_output_id: node.max_output_id,
                    op_type: node.kind.tag(),
                    flags: node.flags,
                };
                offset += node.inputs.len() as u16;
                record
            })
            .collect()
    }

    /// Flattened input-reference table.
    pub fn input_refs(&self) -> Vec<u16> {
        self.nodes.iter().flat_map(|n| n.inputs.iter().copied()).collect()
    }

    /// NVM layout for this model in an arena of `nvm_size` bytes.
    pub fn layout(&self, nvm_size: u32) -> Result<NvmLayout> {
        NvmLayout::compute(&LayoutInputs {
            nvm_size,
            num_slots: self.options.num_slots,
            max_intermediate_bytes: self.max_intermediate_bytes,
            params_len: self.param_blob.len() as u32,
            sample_len: self.sample_len,
            n_samples: self.n_samples(),
            nodes_len: self.nodes_len(),
            n_input: self.n_input(),
            n_input_refs: self.input_refs().len() as u16,
        })
    }
}
