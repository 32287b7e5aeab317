//! Normalization kernels.

use kiln::{Error, Result, Tensor};

use super::{prepare_output, require_compact, resolve_axis};

/// Root-mean-square normalization over the last axis.
pub fn rms_norm(input: &Tensor, weight: &Tensor, eps: f32, output: &mut Tensor) -> Result<()> {
    require_compact(input, "rmsnorm input")?;
    let w = weight.as_f32()?;
    let dim = w.len();
    if weight.ndim() != 1 || input.shape().last() != Some(&dim) {
        return Err(Error::ShapeMismatch {
            expected: vec![dim],
            got: input.shape().to_vec(),
        });
    }
    prepare_output(output, input.shape())?;

    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    let rows = src.len() / dim;
    for row in 0..rows {
        let x = &src[row * dim..(row + 1) * dim];
        let o = &mut dst[row * dim..(row + 1) * dim];
        let mut ss = 0.0f32;
        for &v in x {
            ss += v * v;
        }
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (ss / dim as f32 + eps).sqrt();
        for ((slot, &v), &g) in o.iter_mut().zip(x).zip(w) {
            *slot = v * scale * g;
        }
    }
    Ok(())
}

/// Mean/variance normalization along `axis` with affine gamma and beta.
pub fn layer_norm(
    input: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    axis: i32,
    output: &mut Tensor,
) -> Result<()> {
    require_compact(input, "layernorm input")?;
    let a = resolve_axis(axis, input.ndim())?;
    let channels = input.shape()[a];
    let g = gamma.as_f32()?;
    let b = beta.as_f32()?;
    if g.len() != channels || b.len() != channels {
        return Err(Error::InvalidShape(format!(
            "layernorm affine parameters have {} and {} values for {channels} channels",
            g.len(),
            b.len()
        )));
    }
    prepare_output(output, input.shape())?;

    let pitch = input.count(a);
    let stride = input.strides()[a];
    let outer = if pitch == 0 { 0 } else { input.count(0) / pitch };

    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    #[allow(clippy::cast_precision_loss)]
    let inv_channels = 1.0 / channels as f32;
    for o in 0..outer {
        for i in 0..stride {
            let base = o * pitch + i;
            let mut mean = 0.0f32;
            for c in 0..channels {
                mean += src[base + c * stride];
            }
            mean *= inv_channels;
            let mut s2 = 0.0f32;
            for c in 0..channels {
                let d = src[base + c * stride] - mean;
                s2 += d * d;
            }
            let inv = 1.0 / (s2 * inv_channels + 1e-10).sqrt();
            for c in 0..channels {
                let e = base + c * stride;
                dst[e] = g[c] * (src[e] - mean) * inv + b[c];
            }
        }
    }
    Ok(())
}
