//! Scalar and elementwise arithmetic.

use kiln::{Error, Result, Tensor};

use super::{prepare_output, require_compact};

pub fn mul(input: &Tensor, output: &mut Tensor, value: f32) -> Result<()> {
    require_compact(input, "mul input")?;
    prepare_output(output, input.shape())?;
    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    for (d, &x) in dst.iter_mut().zip(src) {
        *d = x * value;
    }
    Ok(())
}

/// In-place elementwise product, `input0 *= input1`.
pub fn mul_to(input0: &mut Tensor, input1: &Tensor) -> Result<()> {
    require_compact(input0, "mul_to operand")?;
    require_compact(input1, "mul_to operand")?;
    if input0.numel() != input1.numel() {
        return Err(Error::ShapeMismatch {
            expected: input0.shape().to_vec(),
            got: input1.shape().to_vec(),
        });
    }
    let rhs = input1.as_f32()?;
    let lhs = input0.as_f32_mut()?;
    for (l, &r) in lhs.iter_mut().zip(rhs) {
        *l *= r;
    }
    Ok(())
}

/// In-place scaled accumulate, `input0 += alpha * input1`.
pub fn add_to(input0: &mut Tensor, input1: &Tensor, alpha: f32) -> Result<()> {
    require_compact(input0, "add_to operand")?;
    require_compact(input1, "add_to operand")?;
    if input0.numel() != input1.numel() {
        return Err(Error::ShapeMismatch {
            expected: input0.shape().to_vec(),
            got: input1.shape().to_vec(),
        });
    }
    let rhs = input1.as_f32()?;
    let lhs = input0.as_f32_mut()?;
    for (l, &r) in lhs.iter_mut().zip(rhs) {
        *l += alpha * r;
    }
    Ok(())
}
