//! Linear transform: `output = input * weight^T + bias`.
//!
//! The weight is `[out_features, in_features]` row-major, so every output
//! feature is one contiguous dot product against a weight row. Output rows
//! are parallelized with Rayon. Int8 and int4 weights take the integer
//! path: the activation row is quantized to 8-bit codes on the fly, the
//! product accumulates in i64, and the zero points are folded out at the
//! end using the cached per-row weight code sums.

use kiln::{DType, Error, QuantConfig, Result, Tensor};
use rayon::prelude::*;

use super::{prepare_output, require_compact};

/// Run `f` once per output row, in parallel when there is more than one.
fn for_each_row<F>(out: &mut [f32], n: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if out.len() == n {
        // Single row (decode phase): skip thread-pool overhead.
        f(0, out);
    } else {
        out.par_chunks_mut(n)
            .enumerate()
            .for_each(|(row, o)| f(row, o));
    }
}

#[allow(clippy::many_single_char_names)]
pub fn linear(
    input: &Tensor,
    weight: &mut Tensor,
    bias: &Tensor,
    output: &mut Tensor,
) -> Result<()> {
    require_compact(input, "linear input")?;
    require_compact(weight, "linear weight")?;
    if weight.ndim() != 2 {
        return Err(Error::InvalidShape(format!(
            "linear weight must be rank 2, got {:?}",
            weight.shape()
        )));
    }
    let n = weight.shape()[0];
    let k = weight.shape()[1];
    if input.shape().last() != Some(&k) {
        return Err(Error::ShapeMismatch {
            expected: vec![n, k],
            got: input.shape().to_vec(),
        });
    }

    let bias_values = if bias.numel() == 0 {
        None
    } else {
        let b = bias.as_f32()?;
        if b.len() != n {
            return Err(Error::InvalidShape(format!(
                "linear bias has {} values for {n} output features",
                b.len()
            )));
        }
        Some(b)
    };

    let mut out_shape = input.shape().to_vec();
    *out_shape
        .last_mut()
        .ok_or_else(|| Error::InvalidShape("linear input is shapeless".into()))? = n;
    prepare_output(output, &out_shape)?;

    match weight.dtype() {
        DType::F32 => {
            let src = input.as_f32()?;
            let w = weight.as_f32()?;
            let dst = output.as_f32_mut()?;
            for_each_row(dst, n, |row, o| {
                let a = &src[row * k..(row + 1) * k];
                for (col, slot) in o.iter_mut().enumerate() {
                    let wr = &w[col * k..(col + 1) * k];
                    let mut sum = 0.0f32;
                    for (x, y) in a.iter().zip(wr) {
                        sum += x * y;
                    }
                    *slot = sum + bias_values.map_or(0.0, |b| b[col]);
                }
            });
        }
        DType::F16 => {
            let src = input.as_f32()?;
            let w = weight.as_f16()?;
            let dst = output.as_f32_mut()?;
            for_each_row(dst, n, |row, o| {
                let a = &src[row * k..(row + 1) * k];
                for (col, slot) in o.iter_mut().enumerate() {
                    let wr = &w[col * k..(col + 1) * k];
                    let mut sum = 0.0f32;
                    for (x, y) in a.iter().zip(wr) {
                        sum += x * y.to_f32();
                    }
                    *slot = sum + bias_values.map_or(0.0, |b| b[col]);
                }
            });
        }
        DType::I8 | DType::I4 => {
            weight.calc_code_sums()?;
            let axis = weight.quant_axis();
            if axis != -1 && axis != 0 {
                return Err(Error::InvalidShape(format!(
                    "linear weight quantized along axis {axis}"
                )));
            }
            let configs = weight.quant_configs();
            let expected = if axis == -1 { 1 } else { n };
            if configs.len() != expected {
                return Err(Error::InvalidShape(format!(
                    "linear weight carries {} quant configs for {n} rows",
                    configs.len()
                )));
            }
            let is_i4 = weight.dtype() == DType::I4;
            let weight_sums = weight.code_sums();
            let codes = weight.host_bytes()?;
            let src = input.as_f32()?;
            let dst = output.as_f32_mut()?;
            for_each_row(dst, n, |row, o| {
                let a = &src[row * k..(row + 1) * k];
                let mut min = f32::INFINITY;
                let mut max = f32::NEG_INFINITY;
                for &x in a {
                    min = min.min(x);
                    max = max.max(x);
                }
                let acfg = QuantConfig::new(min, max, 8);
                let mut qrow = vec![0u8; k];
                let mut act_sum = 0i64;
                for (q, &x) in qrow.iter_mut().zip(a) {
                    let c = acfg.quantize(x);
                    *q = c;
                    act_sum += i64::from(c);
                }
                let za = i64::from(acfg.zero_point);
                for (col, slot) in o.iter_mut().enumerate() {
                    let wcfg = if axis == -1 { &configs[0] } else { &configs[col] };
                    let mut dot = 0i64;
                    if is_i4 {
                        for (j, &c) in qrow.iter().enumerate() {
                            let e = col * k + j;
                            let b = codes[e / 2];
                            let wcode = if e % 2 == 0 { b >> 4 } else { b & 0xF };
                            dot += i64::from(wcode) * i64::from(c);
                        }
                    } else {
                        let wr = &codes[col * k..(col + 1) * k];
                        for (&wc, &c) in wr.iter().zip(&qrow) {
                            dot += i64::from(wc) * i64::from(c);
                        }
                    }
                    let zw = i64::from(wcfg.zero_point);
                    let corrected =
                        dot - za * weight_sums[col] - zw * act_sum + (k as i64) * zw * za;
                    let mut v = wcfg.scale * acfg.scale * corrected as f32;
                    if let Some(b) = bias_values {
                        v += b[col];
                    }
                    *slot = v;
                }
            });
        }
        other => {
            return Err(Error::UnsupportedDtype(format!(
                "linear weight stored as {other}"
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantized_weight(values: &[f32], n: usize, k: usize, bit: i32) -> Tensor {
        let dtype = if bit == 4 { DType::I4 } else { DType::I8 };
        let mut t = Tensor::with_shape(dtype, &[n, k]);
        t.allocate().unwrap();
        let mut configs = Vec::with_capacity(n);
        let mut packed = vec![0u8; dtype.bytes_for(n * k)];
        for row in 0..n {
            let r = &values[row * k..(row + 1) * k];
            let min = r.iter().copied().fold(f32::INFINITY, f32::min);
            let max = r.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let cfg = QuantConfig::new(min, max, bit);
            for (j, &v) in r.iter().enumerate() {
                let code = cfg.quantize(v);
                let e = row * k + j;
                if bit == 4 {
                    if e % 2 == 0 {
                        packed[e / 2] |= code << 4;
                    } else {
                        packed[e / 2] |= code;
                    }
                } else {
                    packed[e] = code;
                }
            }
            configs.push(cfg);
        }
        t.host_bytes_mut().unwrap().copy_from_slice(&packed);
        t.set_quantization(0, configs);
        t
    }

    /// Dot of an activation row against dequantized weight rows, in f64.
    fn dequantized_reference(
        input: &[f32],
        weight: &Tensor,
        rows: usize,
        n: usize,
        k: usize,
    ) -> Vec<f64> {
        let codes = weight.host_bytes().unwrap();
        let configs = weight.quant_configs();
        let mut out = vec![0.0f64; rows * n];
        for row in 0..rows {
            for col in 0..n {
                let cfg = &configs[col];
                let mut sum = 0.0f64;
                for j in 0..k {
                    let e = col * k + j;
                    let code = if weight.dtype() == DType::I4 {
                        let b = codes[e / 2];
                        if e % 2 == 0 {
                            b >> 4
                        } else {
                            b & 0xF
                        }
                    } else {
                        codes[e]
                    };
                    sum += f64::from(cfg.dequantize(code)) * f64::from(input[row * k + j]);
                }
                out[row * n + col] = sum;
            }
        }
        out
    }

    #[test]
    fn test_dense_with_bias() {
        #[rustfmt::skip]
        let input = Tensor::from_f32(&[2, 3], &[
            1.0, 2.0, 3.0,
            4.0, 5.0, 6.0,
        ]);
        #[rustfmt::skip]
        let mut weight = Tensor::from_f32(&[2, 3], &[
            1.0, 0.0, 0.0,
            1.0, 1.0, 1.0,
        ]);
        let bias = Tensor::from_f32(&[2], &[10.0, -10.0]);
        let mut output = Tensor::new(DType::F32);
        linear(&input, &mut weight, &bias, &mut output).unwrap();
        assert_eq!(output.shape(), &[2, 2]);
        assert_eq!(output.as_f32().unwrap(), &[11.0, -4.0, 14.0, 5.0]);
    }

    #[test]
    fn test_dense_without_bias() {
        let input = Tensor::from_f32(&[1, 2], &[3.0, -1.0]);
        let mut weight = Tensor::from_f32(&[3, 2], &[1.0, 1.0, 2.0, 0.0, 0.0, 2.0]);
        let bias = Tensor::new(DType::F32);
        let mut output = Tensor::new(DType::F32);
        linear(&input, &mut weight, &bias, &mut output).unwrap();
        assert_eq!(output.as_f32().unwrap(), &[2.0, 6.0, -2.0]);
    }

    #[test]
    fn test_f16_weight_widens() {
        let mut weight = Tensor::with_shape(DType::F16, &[2, 2]);
        weight.allocate().unwrap();
        {
            let w = weight.host_bytes_mut().unwrap();
            for (slot, v) in w.chunks_exact_mut(2).zip([1.0f32, 2.0, -0.5, 0.25]) {
                slot.copy_from_slice(&half::f16::from_f32(v).to_le_bytes());
            }
        }
        let input = Tensor::from_f32(&[1, 2], &[2.0, 4.0]);
        let bias = Tensor::new(DType::F32);
        let mut output = Tensor::new(DType::F32);
        linear(&input, &mut weight, &bias, &mut output).unwrap();
        assert_eq!(output.as_f32().unwrap(), &[10.0, 0.0]);
    }

    #[test]
    fn test_int8_matches_dequantized_reference() {
        let n = 3;
        let k = 8;
        let values: Vec<f32> = (0..n * k).map(|i| ((i * 7 % 13) as f32 - 6.0) / 7.0).collect();
        let mut weight = quantized_weight(&values, n, k, 8);
        let inputs: Vec<f32> = (0..2 * k).map(|i| ((i % 5) as f32 - 2.0) / 2.5).collect();
        let input = Tensor::from_f32(&[2, k], &inputs);
        let bias = Tensor::new(DType::F32);
        let mut output = Tensor::new(DType::F32);
        let expected = dequantized_reference(&inputs, &weight, 2, n, k);
        linear(&input, &mut weight, &bias, &mut output).unwrap();
        let got = output.as_f32().unwrap();
        for (i, (&g, &e)) in got.iter().zip(&expected).enumerate() {
            assert!(
                (f64::from(g) - e).abs() < 0.05,
                "mismatch at {i}: got={g}, expected={e}"
            );
        }
    }

    #[test]
    fn test_int4_matches_dequantized_reference() {
        let n = 2;
        let k = 5;
        let values: Vec<f32> = (0..n * k).map(|i| ((i * 3 % 7) as f32 - 3.0) / 3.0).collect();
        let mut weight = quantized_weight(&values, n, k, 4);
        let inputs = [0.5f32, -1.0, 0.25, 0.75, -0.5];
        let input = Tensor::from_f32(&[1, k], &inputs);
        let bias = Tensor::from_f32(&[2], &[1.0, -1.0]);
        let mut output = Tensor::new(DType::F32);
        let mut expected = dequantized_reference(&inputs, &weight, 1, n, k);
        expected[0] += 1.0;
        expected[1] -= 1.0;
        linear(&input, &mut weight, &bias, &mut output).unwrap();
        let got = output.as_f32().unwrap();
        for (i, (&g, &e)) in got.iter().zip(&expected).enumerate() {
            assert!(
                (f64::from(g) - e).abs() < 0.05,
                "mismatch at {i}: got={g}, expected={e}"
            );
        }
    }

    #[test]
    fn test_rejects_feature_mismatch() {
        let input = Tensor::from_f32(&[1, 3], &[1.0, 2.0, 3.0]);
        let mut weight = Tensor::from_f32(&[2, 4], &[0.0; 8]);
        let bias = Tensor::new(DType::F32);
        let mut output = Tensor::new(DType::F32);
        assert!(linear(&input, &mut weight, &bias, &mut output).is_err());
    }
}
