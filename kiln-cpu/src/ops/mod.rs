//! Host kernels, one module per operation family.
//!
//! All kernels work on f32 host buffers unless a signature says otherwise.
//! Kernels that feed or read sequentially-extended caches (split, cat,
//! matmul) honor reserved strides; the elementwise and normalization
//! kernels require compact layouts.

pub mod activation;
pub mod arith;
pub mod embed;
pub mod linear;
pub mod mask;
pub mod matmul;
pub mod norm;
pub mod penalty;
pub mod rope;
pub mod shape;
pub mod topk;

use kiln::{Error, Result, Tensor};

/// Wrap a possibly negative axis onto `0..ndim`.
pub(crate) fn resolve_axis(axis: i32, ndim: usize) -> Result<usize> {
    if ndim == 0 {
        return Err(Error::InvalidShape(
            "axis resolution on a shapeless tensor".into(),
        ));
    }
    let n = ndim as i64;
    Ok((((i64::from(axis) % n) + n) % n) as usize)
}

pub(crate) fn require_compact(t: &Tensor, what: &str) -> Result<()> {
    if t.reserved_shape().is_some() {
        return Err(Error::InvalidShape(format!(
            "{what} must have a compact layout"
        )));
    }
    Ok(())
}

/// Resize `output` and materialize its buffer before a kernel writes it.
pub(crate) fn prepare_output(output: &mut Tensor, shape: &[usize]) -> Result<()> {
    output.resize(shape)?;
    output.allocate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_axis_wraps_negatives() {
        assert_eq!(resolve_axis(0, 3).unwrap(), 0);
        assert_eq!(resolve_axis(2, 3).unwrap(), 2);
        assert_eq!(resolve_axis(-1, 3).unwrap(), 2);
        assert_eq!(resolve_axis(-3, 3).unwrap(), 0);
        assert!(resolve_axis(0, 0).is_err());
    }
}
