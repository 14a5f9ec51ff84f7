use super::{activation_output, expect_rank, narrow, AllocContext, OpContext};
use crate::errors::{EngineError, Result};
use crate::layout::{OpFlags, TensorDescriptor, DESC_TRANSPOSED};

/// `(K, N)` of the weight matrix, honoring the transposed flag.
fn weight_shape(w: &TensorDescriptor) -> (u32, u32) {
    let (rows, cols) = (w.dims[0] as u32, w.dims[1] as u32);
    if w.flags & DESC_TRANSPOSED != 0 {
        (cols, rows)
    } else {
        (rows, cols)
    }
}

pub(super) fn alloc_matmul(
    ctx: &AllocContext,
    inputs: &[TensorDescriptor],
    _flags: OpFlags,
) -> Result<TensorDescriptor> {
    let (a, w) = (&inputs[0], &inputs[1]);
    expect_rank(w, 2, "MatMul weights")?;
    if w.bitwidth != 16 {
        return Err(EngineError::Validation("MatMul weights must be 16-bit".into()));
    }
    let (k, n) = weight_shape(w);
    if a.element_count() != k {
        return Err(EngineError::Validation(format!(
            "MatMul input has {} values, weights expect {}",
            a.element_count(),
            k
        )));
    }
    activation_output(ctx, [1, n as u16, 0, 0])
}

/// Vector times matrix; the input is consumed in its stored element order.
pub(super) fn matmul(
    ctx: &mut OpContext<'_>,
    inputs: &[TensorDescriptor],
    output: &TensorDescriptor,
    _flags: OpFlags,
) -> Result<()> {
    let a = ctx.load(&inputs[0])?;
    let w = ctx.load(&inputs[1])?;
    let (k, n) = weight_shape(&inputs[1]);
    let transposed = inputs[1].flags & DESC_TRANSPOSED != 0;

    for j in ctx.resume()..output.element_count() {
        let mut acc = 0i64;
        for i in 0..k {
            let wi = if transposed { j * k + i } else { i * n + j };
            acc += a.get(i as usize) as i64 * w.get(wi as usize) as i64;
        }
        ctx.write(j, narrow(acc))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::RecoveryMode;
    use crate::layout::{OpFlags, DESC_TRANSPOSED};
    use crate::ops::test_support::Bench;
    use crate::ops::OpKind;

    const HALF: i16 = 0x4000;

    #[test]
    fn test_vector_matrix_product() {
        let mut bench = Bench::new(RecoveryMode::TurningPoints);
        let a = bench.sample([1, 3, 0, 0], &[100, 200, 300]);
        // [K=3, N=2]
        let w = bench.param([3, 2, 0, 0], &[HALF, 0, HALF, HALF, 0, HALF]);
        let out = bench.run(OpKind::MatMul, &[a, w], OpFlags::default(), 0);
        assert_eq!(out.dims, [1, 2, 0, 0]);
        assert_eq!(bench.read(&out).values, vec![150, 250]);
    }

    #[test]
    fn test_transposed_weights() {
        let mut bench = Bench::new(RecoveryMode::Footprints);
        let a = bench.sample([1, 3, 0, 0], &[100, 200, 300]);
        // same matrix stored as [N=2, K=3]
        let mut w = bench.param([2, 3, 0, 0], &[HALF, HALF, 0, 0, HALF, HALF]);
        w.flags |= DESC_TRANSPOSED;
        let out = bench.run(OpKind::MatMul, &[a, w], OpFlags::default(), 1);
        assert_eq!(bench.read(&out).values, vec![150, 250]);
    }
}
