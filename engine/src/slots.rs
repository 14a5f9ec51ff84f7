//! Slot Manager
//!
//! Assigns every intermediate tensor to one of `num_slots` reusable buffers.
//! Planning happens once, at model load: a slot is handed to a node's output
//! only when every tensor it held has no pending reader, and never when it
//! holds one of the node's own inputs. In-place views share their input's slot
//! and extend its liveness.

use crate::errors::{EngineError, Result};
use tracing::debug;

/// Where a node input comes from, for planning purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRef {
    /// Parameters or the test input; never occupies a slot
    External,
    Node(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub inputs: Vec<TensorRef>,
    /// Output aliases input 0 instead of being written
    pub inplace: bool,
}

#[derive(Debug, Clone, Copy)]
struct Occupant {
    producer: usize,
    last_use: usize,
}

pub struct SlotManager {
    occupants: Vec<Option<Occupant>>,
}

/// Index of the last node reading each node's output.
///
/// The final node's output is read by the sample-completion step, which counts
/// as node `nodes.len()`. Outputs nobody reads die at their producer.
pub fn last_uses(nodes: &[PlanNode]) -> Vec<usize> {
    let mut last: Vec<usize> = (0..nodes.len()).collect();
    for (j, node) in nodes.iter().enumerate() {
        for input in &node.inputs {
            if let TensorRef::Node(k) = *input {
                last[k] = last[k].max(j);
            }
        }
    }
    if let Some(output) = last.last_mut() {
        *output = nodes.len();
    }
    last
}

impl SlotManager {
    pub fn new(num_slots: u8) -> Self {
        Self {
            occupants: vec![None; num_slots as usize],
        }
    }

    /// Pick the lowest slot that holds neither an input of `node_idx` nor a
    /// tensor some later node still reads.
    pub fn acquire_output_slot(
        &mut self,
        node_idx: usize,
        last_use: usize,
        input_slots: &[u8],
    ) -> Result<u8> {
        let chosen = self.occupants.iter().enumerate().position(|(s, occupant)| {
            let busy = occupant.is_some_and(|o| o.last_use >= node_idx);
            !busy && !input_slots.contains(&(s as u8))
        });
        let slot = chosen.ok_or_else(|| {
            EngineError::Validation(format!(
                "node {} needs a free slot but all {} are live",
                node_idx,
                self.occupants.len()
            ))
        })?;
        if let Some(previous) = self.occupants[slot] {
            debug!(
                slot,
                node = node_idx,
                previous = previous.producer,
                "Slot reused"
            );
        }
        self.occupants[slot] = Some(Occupant {
            producer: node_idx,
            last_use,
        });
        Ok(slot as u8)
    }

    /// Keep `slot` alive until `last_use` because a view now reads through it.
    pub fn extend(&mut self, slot: u8, last_use: usize) {
        if let Some(Some(occupant)) = self.occupants.get_mut(slot as usize) {
            occupant.last_use = occupant.last_use.max(last_use);
        }
    }

    /// Assign a slot to every node output; `None` for views of external data.
    pub fn plan(nodes: &[PlanNode], num_slots: u8) -> Result<Vec<Option<u8>>> {
        let last = last_uses(nodes);
        let mut manager = Self::new(num_slots);
        let mut assigned: Vec<Option<u8>> = Vec::with_capacity(nodes.len());

        for (k, node) in nodes.iter().enumerate() {
            let slot_of = |r: &TensorRef| match *r {
                TensorRef::Node(i) => assigned.get(i).copied().flatten(),
                TensorRef::External => None,
            };

            if node.inplace {
                let source = node.inputs.first().and_then(slot_of);
                if let Some(slot) = source {
                    manager.extend(slot, last[k]);
                }
                assigned.push(source);
                continue;
            }

            let input_slots: Vec<u8> = node.inputs.iter().filter_map(slot_of).collect();
            let slot = manager.acquire_output_slot(k, last[k], &input_slots)?;
            assigned.push(Some(slot));
        }
        Ok(assigned)
    }
}
