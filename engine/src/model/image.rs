//! The model image on NVM.
//!
//! `install` is the reference platform's flashing step: it lays the model out
//! exactly as [`NvmLayout`] says and arms the first-run word. `verify` runs at
//! every boot and refuses to resume on an image built from a different model
//! or configuration.

use super::graph::{ModelGraph, NO_LABEL};
use crate::config::RecoveryMode;
use crate::errors::{EngineError, Result};
use crate::layout::{
    Counters, ImageHeader, NvmLayout, OperationNode, TensorDescriptor, COUNTERS_SIZE,
    DESCRIPTOR_SIZE, HEADER_SIZE, NODE_SIZE,
};
use crate::storage::DurableStorage;
use tracing::{debug, info, warn};

const FIRST_RUN_ARMED: u16 = 1;

/// Header the graph and recovery mode are expected to produce.
pub fn expected_header(graph: &ModelGraph, layout: &NvmLayout, mode: RecoveryMode) -> ImageHeader {
    ImageHeader {
        version: crate::layout::records::IMAGE_VERSION,
        num_slots: layout.num_slots,
        recovery_mode: mode.tag(),
        nodes_len: graph.nodes_len(),
        n_input: graph.n_input(),
        n_samples: graph.n_samples(),
        slot_size: layout.slot_size,
    }
}

fn descriptor_table(descs: &[TensorDescriptor]) -> Vec<u8> {
    descs.iter().flat_map(|d| d.encode()).collect()
}

fn node_table(nodes: &[OperationNode]) -> Vec<u8> {
    nodes.iter().flat_map(|n| n.encode()).collect()
}

fn refs_table(refs: &[u16]) -> Vec<u8> {
    refs.iter().flat_map(|r| r.to_le_bytes()).collect()
}

/// Erase the arena and write the model image.
pub fn install(
    storage: &mut dyn DurableStorage,
    graph: &ModelGraph,
    layout: &NvmLayout,
    mode: RecoveryMode,
) -> Result<()> {
    storage.erase()?;

    storage.write_segmented(layout.params_base, &graph.param_blob)?;
    for (i, sample) in graph
        .sample_blob
        .chunks(graph.sample_len.max(1) as usize)
        .enumerate()
    {
        storage.write_segmented(layout.sample_offset(i as u16), sample)?;
    }
    storage.write_segmented(layout.labels_base, &graph.labels)?;

    storage.write_segmented(
        layout.intermediate_table_offset,
        &descriptor_table(&graph.outputs),
    )?;
    storage.write_segmented(layout.param_table_offset, &descriptor_table(&graph.params))?;
    storage.write_segmented(layout.node_table_offset, &node_table(&graph.operation_nodes()))?;
    storage.write_segmented(layout.input_refs_offset, &refs_table(&graph.input_refs()))?;

    write_counters(storage, layout, &Counters::default())?;
    storage.write_segmented(
        layout.header_offset,
        &expected_header(graph, layout, mode).encode(),
    )?;
    request_first_run(storage, layout)?;

    info!(
        model = %graph.name,
        mode = %mode,
        slots = layout.num_slots,
        slot_size = layout.slot_size,
        bulk_end = layout.bulk_end,
        control_start = layout.control_start,
        "Model image installed"
    );
    Ok(())
}

pub fn read_header(storage: &mut dyn DurableStorage, layout: &NvmLayout) -> Result<Option<ImageHeader>> {
    let bytes = storage.read_vec(layout.header_offset, HEADER_SIZE)?;
    ImageHeader::decode(&bytes)
}

fn compare_table(
    storage: &mut dyn DurableStorage,
    offset: u32,
    expected: &[u8],
    what: &str,
) -> Result<()> {
    let stored = storage.read_vec(offset, expected.len())?;
    if stored != expected {
        return Err(EngineError::ImageMismatch(format!(
            "{} differs from the loaded model",
            what
        )));
    }
    Ok(())
}

/// Check that NVM holds the image of `graph` under `mode`.
pub fn verify(
    storage: &mut dyn DurableStorage,
    graph: &ModelGraph,
    layout: &NvmLayout,
    mode: RecoveryMode,
) -> Result<()> {
    let header = read_header(storage, layout)?.ok_or_else(|| {
        EngineError::ImageMismatch("no model image installed; run `init` first".to_string())
    })?;
    let expected = expected_header(graph, layout, mode);
    if header != expected {
        warn!(stored = ?header, expected = ?expected, "Image header mismatch");
        let reason = if header.recovery_mode != expected.recovery_mode {
            format!(
                "image was installed for recovery mode {:?}, running with {}",
                RecoveryMode::from_tag(header.recovery_mode),
                mode
            )
        } else {
            "image header does not match the loaded model".to_string()
        };
        return Err(EngineError::ImageMismatch(reason));
    }

    compare_table(
        storage,
        layout.node_table_offset,
        &node_table(&graph.operation_nodes()),
        "node table",
    )?;
    compare_table(
        storage,
        layout.param_table_offset,
        &descriptor_table(&graph.params),
        "parameter descriptors",
    )?;
    compare_table(
        storage,
        layout.intermediate_table_offset,
        &descriptor_table(&graph.outputs),
        "intermediate descriptors",
    )?;
    compare_table(
        storage,
        layout.input_refs_offset,
        &refs_table(&graph.input_refs()),
        "input references",
    )?;
    debug!(model = %graph.name, "Model image verified");
    Ok(())
}

/// Read the node table back from NVM.
pub fn read_nodes(storage: &mut dyn DurableStorage, layout: &NvmLayout, nodes_len: u16) -> Result<Vec<OperationNode>> {
    let bytes = storage.read_vec(layout.node_table_offset, nodes_len as usize * NODE_SIZE)?;
    bytes.chunks_exact(NODE_SIZE).map(OperationNode::decode).collect()
}

/// Read one descriptor table back from NVM.
pub fn read_descriptors(storage: &mut dyn DurableStorage, offset: u32, count: u16) -> Result<Vec<TensorDescriptor>> {
    let bytes = storage.read_vec(offset, count as usize * DESCRIPTOR_SIZE)?;
    bytes
        .chunks_exact(DESCRIPTOR_SIZE)
        .map(TensorDescriptor::decode)
        .collect()
}

pub fn read_label(storage: &mut dyn DurableStorage, layout: &NvmLayout, sample_idx: u16) -> Result<Option<u8>> {
    let mut label = [0u8; 1];
    storage.read(layout.label_offset(sample_idx), &mut label)?;
    Ok((label[0] != NO_LABEL).then_some(label[0]))
}

pub fn first_run_pending(storage: &mut dyn DurableStorage, layout: &NvmLayout) -> Result<bool> {
    Ok(storage.read_u16(layout.first_run_offset)? == FIRST_RUN_ARMED)
}

/// Make the next boot start from scratch.
pub fn request_first_run(storage: &mut dyn DurableStorage, layout: &NvmLayout) -> Result<()> {
    storage.write_u16(layout.first_run_offset, FIRST_RUN_ARMED)
}

pub fn clear_first_run(storage: &mut dyn DurableStorage, layout: &NvmLayout) -> Result<()> {
    storage.write_u16(layout.first_run_offset, 0)
}

pub fn read_counters(storage: &mut dyn DurableStorage, layout: &NvmLayout) -> Result<Counters> {
    let bytes = storage.read_vec(layout.counters_offset, COUNTERS_SIZE)?;
    Counters::decode(&bytes)
}

pub fn write_counters(storage: &mut dyn DurableStorage, layout: &NvmLayout, counters: &Counters) -> Result<()> {
    storage.write_segmented(layout.counters_offset, &counters.encode())
}
