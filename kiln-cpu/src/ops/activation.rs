//! Elementwise activations and softmax.

use kiln::{Result, Tensor};

use super::{prepare_output, require_compact, resolve_axis};

pub fn silu(input: &Tensor, output: &mut Tensor) -> Result<()> {
    require_compact(input, "silu input")?;
    prepare_output(output, input.shape())?;
    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    for (d, &x) in dst.iter_mut().zip(src) {
        *d = x / (1.0 + (-x).exp());
    }
    Ok(())
}

pub fn gelu_new(input: &Tensor, output: &mut Tensor) -> Result<()> {
    require_compact(input, "gelu input")?;
    prepare_output(output, input.shape())?;
    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    for (d, &x) in dst.iter_mut().zip(src) {
        let inner = 0.79788456 * (x + 0.044715 * x * x * x);
        *d = 0.5 * x * (1.0 + inner.tanh());
    }
    Ok(())
}

/// Numerically stable softmax along `axis`.
pub fn softmax(input: &Tensor, output: &mut Tensor, axis: i32) -> Result<()> {
    require_compact(input, "softmax input")?;
    let a = resolve_axis(axis, input.ndim())?;
    prepare_output(output, input.shape())?;

    let channels = input.shape()[a];
    let pitch = input.count(a);
    let stride = input.strides()[a];
    let outer = if pitch == 0 { 0 } else { input.count(0) / pitch };

    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    for o in 0..outer {
        for i in 0..stride {
            let base = o * pitch + i;
            let mut max = f32::NEG_INFINITY;
            for c in 0..channels {
                max = max.max(src[base + c * stride]);
            }
            let mut sum = 0.0f32;
            for c in 0..channels {
                let e = (src[base + c * stride] - max).exp();
                dst[base + c * stride] = e;
                sum += e;
            }
            for c in 0..channels {
                dst[base + c * stride] /= sum;
            }
        }
    }
    Ok(())
}
