use super::{activation_output, expect_activation, AllocContext, OpContext};
use crate::errors::{EngineError, Result};
use crate::layout::{OpFlags, TensorDescriptor};
use crate::tensor::activation_coords;

const DEFAULT_KERNEL: u16 = 2;

fn window(flags: OpFlags) -> (u32, u32) {
    let kernel = flags.kernel_or(DEFAULT_KERNEL);
    (kernel as u32, flags.stride_or(kernel) as u32)
}

pub(super) fn alloc_max_pool(
    ctx: &AllocContext,
    inputs: &[TensorDescriptor],
    flags: OpFlags,
) -> Result<TensorDescriptor> {
    let x = &inputs[0];
    expect_activation(x, "MaxPool input")?;
    let (kernel, stride) = window(flags);
    let (h, w) = (x.dims[2] as u32, x.dims[3] as u32);
    if h < kernel || w < kernel {
        return Err(EngineError::Validation(format!(
            "MaxPool kernel {} larger than input {}x{}",
            kernel, h, w
        )));
    }
    let out_h = (h - kernel) / stride + 1;
    let out_w = (w - kernel) / stride + 1;
    activation_output(
        ctx,
        [1, x.dims[1], out_h as u16, out_w as u16],
    )
}

pub(super) fn max_pool(
    ctx: &mut OpContext<'_>,
    inputs: &[TensorDescriptor],
    output: &TensorDescriptor,
    flags: OpFlags,
) -> Result<()> {
    let (kernel, stride) = window(flags);
    let x = ctx.load(&inputs[0])?;
    let (out_h, out_w) = (output.dims[2] as u32, output.dims[3] as u32);
    let tile = output.tile_c.max(1) as u32;

    for i in ctx.resume()..output.element_count() {
        let (c, oh, ow) = activation_coords(i, out_h, out_w, tile);
        let mut best = i32::MIN;
        for ky in 0..kernel {
            for kx in 0..kernel {
                best = best.max(x.at(c, oh * stride + ky, ow * stride + kx));
            }
        }
        ctx.write(i, best)?;
    }
    Ok(())
}
