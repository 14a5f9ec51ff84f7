use super::{activation_output, expect_activation, expect_rank, narrow, AllocContext, OpContext};
use crate::errors::{EngineError, Result};
use crate::layout::{OpFlags, TensorDescriptor};
use crate::tensor::activation_coords;

/// Output geometry shared by the allocator and the handler.
struct ConvShape {
    cin: u32,
    cout: u32,
    kh: u32,
    kw: u32,
    stride: u32,
}

fn conv_shape(inputs: &[TensorDescriptor], flags: OpFlags) -> Result<ConvShape> {
    let (x, w, b) = (&inputs[0], &inputs[1], &inputs[2]);
    expect_activation(x, "Conv input")?;
    expect_rank(w, 4, "Conv weights")?;
    let shape = ConvShape {
        cin: w.dims[1] as u32,
        cout: w.dims[0] as u32,
        kh: w.dims[2] as u32,
        kw: w.dims[3] as u32,
        stride: flags.stride_or(1) as u32,
    };
    if shape.cin != x.dims[1] as u32 {
        return Err(EngineError::Validation(format!(
            "Conv weights expect {} input channels, input has {}",
            shape.cin, x.dims[1]
        )));
    }
    if flags.kernel_size != 0 && (flags.kernel_size as u32 != shape.kh || shape.kh != shape.kw) {
        return Err(EngineError::Validation(format!(
            "Conv kernel size {} does not match weights {}x{}",
            flags.kernel_size, shape.kh, shape.kw
        )));
    }
    if b.element_count() != shape.cout || !matches!(b.bitwidth, 16 | 32) {
        return Err(EngineError::Validation(format!(
            "Conv bias must hold {} 16- or 32-bit values",
            shape.cout
        )));
    }
    if w.bitwidth != 16 {
        return Err(EngineError::Validation("Conv weights must be 16-bit".into()));
    }
    if (x.dims[2] as u32) < shape.kh || (x.dims[3] as u32) < shape.kw {
        return Err(EngineError::Validation(format!(
            "Conv kernel {}x{} larger than input {}x{}",
            shape.kh, shape.kw, x.dims[2], x.dims[3]
        )));
    }
    Ok(shape)
}

pub(super) fn alloc_conv(
    ctx: &AllocContext,
    inputs: &[TensorDescriptor],
    flags: OpFlags,
) -> Result<TensorDescriptor> {
    let shape = conv_shape(inputs, flags)?;
    let x = &inputs[0];
    let out_h = (x.dims[2] as u32 - shape.kh) / shape.stride + 1;
    let out_w = (x.dims[3] as u32 - shape.kw) / shape.stride + 1;
    activation_output(
        ctx,
        [1, shape.cout as u16, out_h as u16, out_w as u16],
    )
}

/// Valid (unpadded) 2-D convolution.
///
/// A 16-bit bias is Q15 and added after scaling; a 32-bit bias is already in
/// accumulator scale.
pub(super) fn conv(
    ctx: &mut OpContext<'_>,
    inputs: &[TensorDescriptor],
    output: &TensorDescriptor,
    flags: OpFlags,
) -> Result<()> {
    let shape = conv_shape(inputs, flags)?;
    let x = ctx.load(&inputs[0])?;
    let w = ctx.load(&inputs[1])?;
    let bias = ctx.load(&inputs[2])?;
    let wide_bias = inputs[2].bitwidth == 32;

    let (out_h, out_w) = (output.dims[2] as u32, output.dims[3] as u32);
    let tile = output.tile_c.max(1) as u32;
    for i in ctx.resume()..output.element_count() {
        let (co, oh, ow) = activation_coords(i, out_h, out_w, tile);
        let b = bias.get(co as usize) as i64;
        let mut acc: i64 = if wide_bias { b } else { b << 15 };
        for ci in 0..shape.cin {
            for ky in 0..shape.kh {
                for kx in 0..shape.kw {
                    let wi = ((co * shape.cin + ci) * shape.kh + ky) * shape.kw + kx;
                    let xv = x.at(ci, oh * shape.stride + ky, ow * shape.stride + kx);
                    acc += xv as i64 * w.get(wi as usize) as i64;
                }
            }
        }
        ctx.write(i, narrow(acc))?;
    }
    Ok(())
}
