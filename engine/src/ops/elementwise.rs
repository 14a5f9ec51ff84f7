use super::{AllocContext, OpContext};
use crate::errors::{EngineError, Result};
use crate::layout::{OpFlags, SlotId, TensorDescriptor};

/// Output laid out exactly like `like`, so element `i` lines up with input `i`.
fn same_layout(ctx: &AllocContext, like: &TensorDescriptor) -> TensorDescriptor {
    let mut desc = TensorDescriptor {
        params_offset: 0,
        params_len: 0,
        bitwidth: 16,
        slot: SlotId::Intermediate(0),
        tile_c: like.tile_c.max(1),
        dims: like.dims,
        flags: 0,
    };
    desc.set_footprints(ctx.footprints);
    if desc.element_count() % desc.tile_c as u32 != 0 {
        desc.tile_c = 1;
    }
    desc.params_len = desc.physical_count() * 2;
    desc
}

pub(super) fn alloc_relu(
    ctx: &AllocContext,
    inputs: &[TensorDescriptor],
    _flags: OpFlags,
) -> Result<TensorDescriptor> {
    Ok(same_layout(ctx, &inputs[0]))
}

pub(super) fn alloc_add(
    ctx: &AllocContext,
    inputs: &[TensorDescriptor],
    _flags: OpFlags,
) -> Result<TensorDescriptor> {
    let (a, b) = (&inputs[0], &inputs[1]);
    if a.element_count() != b.element_count() {
        return Err(EngineError::Validation(format!(
            "Add operands differ in size: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    // channel tiling reorders 4-D tensors; both sides must agree on it
    let tiled = |d: &TensorDescriptor| d.rank() == 4 && d.tile_c > 1;
    if (tiled(a) || tiled(b)) && (a.dims != b.dims || a.tile_c != b.tile_c) {
        return Err(EngineError::Validation(
            "Add operands use different channel tiling".to_string(),
        ));
    }
    Ok(same_layout(ctx, a))
}

pub(super) fn relu(
    ctx: &mut OpContext<'_>,
    inputs: &[TensorDescriptor],
    output: &TensorDescriptor,
    _flags: OpFlags,
) -> Result<()> {
    let x = ctx.load(&inputs[0])?;
    for i in ctx.resume()..output.element_count() {
        ctx.write(i, x.get(i as usize).max(0))?;
    }
    Ok(())
}

pub(super) fn add(
    ctx: &mut OpContext<'_>,
    inputs: &[TensorDescriptor],
    output: &TensorDescriptor,
    _flags: OpFlags,
) -> Result<()> {
    let a = ctx.load(&inputs[0])?;
    let b = ctx.load(&inputs[1])?;
    for i in ctx.resume()..output.element_count() {
        let i_us = i as usize;
        ctx.write(i, a.get(i_us).saturating_add(b.get(i_us)))?;
    }
    Ok(())
}
