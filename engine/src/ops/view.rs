use super::{AllocContext, OpContext};
use crate::errors::{EngineError, Result};
use crate::layout::{checked_element_count, OpFlags, TensorDescriptor};

/// Views share their input's bytes; there is nothing to compute.
pub(super) fn alias(
    _ctx: &mut OpContext<'_>,
    _inputs: &[TensorDescriptor],
    _output: &TensorDescriptor,
    _flags: OpFlags,
) -> Result<()> {
    Ok(())
}

fn with_dims(input: &TensorDescriptor, dims: &[u16]) -> Result<TensorDescriptor> {
    if dims.is_empty() || dims.len() > 4 {
        return Err(EngineError::Validation(format!(
            "view rank {} not supported",
            dims.len()
        )));
    }
    let mut out = *input;
    out.dims = [0; 4];
    out.dims[..dims.len()].copy_from_slice(dims);
    if checked_element_count(dims) != Some(input.element_count()) {
        return Err(EngineError::Validation(format!(
            "cannot view {:?} as {:?}",
            input.shape(),
            dims
        )));
    }
    Ok(out)
}

pub(super) fn alloc_reshape(
    ctx: &AllocContext,
    inputs: &[TensorDescriptor],
    _flags: OpFlags,
) -> Result<TensorDescriptor> {
    let input = &inputs[0];
    let shape = ctx
        .constants
        .get(1)
        .and_then(|c| c.as_ref())
        .ok_or_else(|| {
            EngineError::Validation("Reshape needs a constant 64-bit shape input".into())
        })?;

    let known = shape
        .iter()
        .filter(|&&d| d > 0)
        .try_fold(1i64, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| EngineError::Validation(format!("Reshape shape {:?} overflows", shape)))?;
    let mut dims = Vec::with_capacity(shape.len());
    for (axis, &d) in shape.iter().enumerate() {
        let dim = match d {
            -1 if known > 0 => input.element_count() as i64 / known,
            0 => input.dims.get(axis).copied().unwrap_or(0) as i64,
            d if d > 0 => d,
            _ => {
                return Err(EngineError::Validation(format!(
                    "invalid Reshape dimension {} in {:?}",
                    d, shape
                )))
            }
        };
        if dim <= 0 || dim > u16::MAX as i64 {
            return Err(EngineError::Validation(format!(
                "Reshape dimension {} out of range",
                dim
            )));
        }
        dims.push(dim as u16);
    }
    with_dims(input, &dims)
}

pub(super) fn alloc_squeeze(
    _ctx: &AllocContext,
    inputs: &[TensorDescriptor],
    _flags: OpFlags,
) -> Result<TensorDescriptor> {
    let input = &inputs[0];
    let mut dims: Vec<u16> = input.shape().iter().copied().filter(|&d| d != 1).collect();
    if dims.is_empty() {
        dims.push(1);
    }
    with_dims(input, &dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SlotId;

    fn activation() -> TensorDescriptor {
        TensorDescriptor {
            params_offset: 0,
            params_len: 72,
            bitwidth: 16,
            slot: SlotId::Intermediate(1),
            tile_c: 4,
            dims: [1, 4, 3, 3],
            flags: 0,
        }
    }

    fn ctx_with_shape(shape: Vec<i64>) -> AllocContext {
        AllocContext {
            tile_c: 4,
            footprints: 0,
            constants: vec![None, Some(shape)],
        }
    }

    #[test]
    fn test_reshape_keeps_storage() {
        let input = activation();
        let out = alloc_reshape(&ctx_with_shape(vec![1, -1]), &[input, input], OpFlags::default())
            .unwrap();
        assert_eq!(out.shape(), &[1, 36]);
        assert_eq!(out.slot, input.slot);
        assert_eq!(out.params_len, input.params_len);
        assert_eq!(out.tile_c, input.tile_c);
    }

    #[test]
    fn test_reshape_rejects_bad_shapes() {
        let input = activation();
        for shape in [vec![5, 7], vec![-2, 18], vec![1, 2, 3, 3, 2]] {
            assert!(
                alloc_reshape(&ctx_with_shape(shape.clone()), &[input, input], OpFlags::default())
                    .is_err(),
                "{:?}",
                shape
            );
        }
        let no_shape = AllocContext::default();
        assert!(alloc_reshape(&no_shape, &[input, input], OpFlags::default()).is_err());
    }

    #[test]
    fn test_squeeze_drops_unit_dims() {
        let mut input = activation();
        input.dims = [1, 10, 1, 0];
        let out = alloc_squeeze(&AllocContext::default(), &[input], OpFlags::default()).unwrap();
        assert_eq!(out.shape(), &[10]);

        input.dims = [1, 1, 0, 0];
        let out = alloc_squeeze(&AllocContext::default(), &[input], OpFlags::default()).unwrap();
        assert_eq!(out.shape(), &[1]);
    }
}
