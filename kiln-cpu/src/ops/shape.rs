//! Copying and reordering kernels: split, concatenation, axis permutation.
//!
//! Split and CatDirect address their cache-side operand through its
//! strides, so reservation padding on the walked axis survives
//! untouched; padding on an outer axis is refused. Cat and the
//! permutes expect compact operands and produce compact outputs.

use kiln::{DType, Error, Result, Tensor};

use super::{prepare_output, require_compact, resolve_axis};

fn check_copy_kind(t: &Tensor, what: &str) -> Result<()> {
    match t.dtype() {
        DType::F32 | DType::F16 | DType::BF16 => Ok(()),
        other => Err(Error::UnsupportedDtype(format!("{what} on {other} data"))),
    }
}

fn check_same_kind(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dtype() == b.dtype() {
        Ok(())
    } else {
        Err(Error::DtypeMismatch {
            expected: a.dtype().to_string(),
            got: b.dtype().to_string(),
        })
    }
}

/// Copy the `[start, end)` range of `axis` into `output`.
pub fn split(input: &Tensor, axis: i32, start: i32, end: i32, output: &mut Tensor) -> Result<()> {
    let a = resolve_axis(axis, input.ndim())?;
    check_copy_kind(input, "split")?;
    check_same_kind(input, output)?;
    let extent = input.shape()[a];
    let (start, end) = (i64::from(start), i64::from(end));
    if start < 0 || start >= end || end > extent as i64 {
        return Err(Error::InvalidShape(format!(
            "split range [{start}, {end}) outside axis of {extent}"
        )));
    }
    let (start, end) = (start as usize, end as usize);

    let mut dims = input.shape().to_vec();
    dims[a] = end - start;
    prepare_output(output, &dims)?;

    let unit = input.dtype().unit_size();
    let sa = input.strides()[a];
    if sa != output.strides()[a] {
        return Err(Error::InvalidShape(
            "split source is padded below the split axis".into(),
        ));
    }
    let pitch_in = input.count(a);
    let pitch_out = output.count(a);
    let outer = if pitch_in == 0 {
        0
    } else {
        input.count(0) / pitch_in
    };
    // Padding on an outer axis makes the pitch walk count envelope
    // slices, not logical ones.
    if outer != 0 && outer != input.shape()[..a].iter().product::<usize>() {
        return Err(Error::InvalidShape(
            "split source is padded above the split axis".into(),
        ));
    }
    let width = (end - start) * sa * unit;
    let src = input.host_bytes()?;
    let dst = output.host_bytes_mut()?;
    for o in 0..outer {
        let s = (o * pitch_in + start * sa) * unit;
        let d = o * pitch_out * unit;
        dst[d..d + width].copy_from_slice(&src[s..s + width]);
    }
    Ok(())
}

/// Concatenate `input0` and `input1` along `axis` into `output`.
///
/// A shapeless `input0` makes this a plain copy of `input1`.
pub fn cat(input0: &Tensor, input1: &Tensor, output: &mut Tensor, axis: i32) -> Result<()> {
    if input0.ndim() == 0 {
        return output.copy_from(input1);
    }
    let a = resolve_axis(axis, input0.ndim())?;
    check_copy_kind(input0, "cat")?;
    check_same_kind(input0, input1)?;
    check_same_kind(input0, output)?;
    require_compact(input0, "cat operand")?;
    require_compact(input1, "cat operand")?;
    if input1.ndim() != input0.ndim() {
        return Err(Error::ShapeMismatch {
            expected: input0.shape().to_vec(),
            got: input1.shape().to_vec(),
        });
    }
    for j in 0..input0.ndim() {
        if j != a && input0.shape()[j] != input1.shape()[j] {
            return Err(Error::ShapeMismatch {
                expected: input0.shape().to_vec(),
                got: input1.shape().to_vec(),
            });
        }
    }

    let mut dims = input0.shape().to_vec();
    dims[a] += input1.shape()[a];
    prepare_output(output, &dims)?;

    let unit = input0.dtype().unit_size();
    let w0 = input0.count(a) * unit;
    let w1 = input1.count(a) * unit;
    let src0 = input0.host_bytes()?;
    let src1 = input1.host_bytes()?;
    let dst = output.host_bytes_mut()?;
    let outer: usize = dims[..a].iter().product();
    for o in 0..outer {
        let d = o * (w0 + w1);
        dst[d..d + w0].copy_from_slice(&src0[o * w0..(o + 1) * w0]);
        dst[d + w0..d + w0 + w1].copy_from_slice(&src1[o * w1..(o + 1) * w1]);
    }
    Ok(())
}

/// Append `input1` to `input0` in place along `axis`.
///
/// `input0` must carry an active reservation with room for the grown
/// extent; its strides never change during the append, so earlier
/// content keeps its offsets. An empty `input0` (zero extent along
/// `axis`) simply fills from the front of its envelope.
pub fn cat_direct(input0: &mut Tensor, input1: &Tensor, axis: i32) -> Result<()> {
    let Some(env) = input0.reserved_shape() else {
        return Err(Error::InvalidShape(
            "CatDirect target needs an active reservation".into(),
        ));
    };
    let env = env.to_vec();
    let a = resolve_axis(axis, input0.ndim())?;
    check_copy_kind(input0, "cat")?;
    check_same_kind(input0, input1)?;
    if input1.ndim() != input0.ndim() {
        return Err(Error::ShapeMismatch {
            expected: input0.shape().to_vec(),
            got: input1.shape().to_vec(),
        });
    }
    for j in 0..input0.ndim() {
        if j != a && input0.shape()[j] != input1.shape()[j] {
            return Err(Error::ShapeMismatch {
                expected: input0.shape().to_vec(),
                got: input1.shape().to_vec(),
            });
        }
    }
    if input0.strides()[a] != input1.strides()[a] {
        return Err(Error::InvalidShape(
            "append operands have different sub-axis layouts".into(),
        ));
    }

    let old = input0.shape()[a];
    let add = input1.shape()[a];
    if old + add > env[a] {
        return Err(Error::InvalidShape(format!(
            "append of {add} rows at {old} outgrows the reserved {}",
            env[a]
        )));
    }
    // Padding on an outer axis makes the pitch walk count envelope
    // slices, not logical ones. Checked before the resize so a rejected
    // append leaves the shape alone.
    {
        let pitch = input0.count(a);
        let outer = if pitch == 0 { 0 } else { input0.count(0) / pitch };
        if outer != 0 && outer != input0.shape()[..a].iter().product::<usize>() {
            return Err(Error::InvalidShape(
                "append target is padded above the append axis".into(),
            ));
        }
    }
    let mut grown = input0.shape().to_vec();
    grown[a] = old + add;
    input0.resize(&grown)?;

    let unit = input0.dtype().unit_size();
    let sa = input0.strides()[a];
    let pitch0 = input0.count(a);
    let pitch1 = input1.count(a);
    let outer = if pitch0 == 0 {
        0
    } else {
        input0.count(0) / pitch0
    };
    let width = add * input1.strides()[a] * unit;
    let src = input1.host_bytes()?;
    let dst = input0.host_bytes_mut()?;
    for o in 0..outer {
        let d = (o * pitch0 + old * sa) * unit;
        let s = o * pitch1 * unit;
        dst[d..d + width].copy_from_slice(&src[s..s + width]);
    }
    Ok(())
}

/// Reorder axes per `axis` (an int32-parameter tensor) into `output`.
pub fn permute(input: &Tensor, axis: &Tensor, output: &mut Tensor) -> Result<()> {
    let perm = axis.as_i32()?;
    let nd = input.ndim();
    let bad = || {
        Error::InvalidShape(format!(
            "axis order {perm:?} is not a permutation of 0..{nd}"
        ))
    };
    if perm.len() != nd {
        return Err(bad());
    }
    let mut seen = vec![false; nd];
    let mut order = Vec::with_capacity(nd);
    for &p in perm {
        let p = usize::try_from(p).ok().filter(|&p| p < nd).ok_or_else(bad)?;
        if seen[p] {
            return Err(bad());
        }
        seen[p] = true;
        order.push(p);
    }
    require_compact(input, "permute input")?;

    let dims: Vec<usize> = order.iter().map(|&p| input.shape()[p]).collect();
    prepare_output(output, &dims)?;

    // Destination stride contributed by each source axis.
    let mut dst_stride = vec![0usize; nd];
    for (j, &p) in order.iter().enumerate() {
        dst_stride[p] = output.strides()[j];
    }
    let shape = input.shape().to_vec();
    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    let mut idx = vec![0usize; nd];
    let mut off = 0usize;
    for &v in src {
        dst[off] = v;
        for d in (0..nd).rev() {
            idx[d] += 1;
            if idx[d] < shape[d] {
                off += dst_stride[d];
                break;
            }
            idx[d] = 0;
            off -= (shape[d] - 1) * dst_stride[d];
        }
    }
    Ok(())
}

/// Reorder axes in place, keeping the existing buffer.
pub fn permute_self(input: &mut Tensor, axis: &Tensor) -> Result<()> {
    let mut tmp = Tensor::new(input.dtype());
    permute(input, axis, &mut tmp)?;
    let dims = tmp.shape().to_vec();
    input.host_bytes_mut()?.copy_from_slice(tmp.host_bytes()?);
    input.resize(&dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_middle_axis() {
        #[rustfmt::skip]
        let input = Tensor::from_f32(&[2, 3, 2], &[
            0.0, 1.0,   2.0, 3.0,   4.0, 5.0,
            6.0, 7.0,   8.0, 9.0,  10.0, 11.0,
        ]);
        let mut output = Tensor::new(DType::F32);
        split(&input, 1, 1, 3, &mut output).unwrap();
        assert_eq!(output.shape(), &[2, 2, 2]);
        assert_eq!(
            output.as_f32().unwrap(),
            &[2.0, 3.0, 4.0, 5.0, 8.0, 9.0, 10.0, 11.0]
        );
    }

    #[test]
    fn test_split_rejects_bad_range() {
        let input = Tensor::from_f32(&[4], &[0.0; 4]);
        let mut output = Tensor::new(DType::F32);
        assert!(split(&input, 0, 2, 2, &mut output).is_err());
        assert!(split(&input, 0, -1, 2, &mut output).is_err());
        assert!(split(&input, 0, 2, 5, &mut output).is_err());
    }

    #[test]
    fn test_split_rejects_padding_above_the_axis() {
        // Reserved along axis 1, split along axis 2: the outer walk
        // would cover envelope rows the output has no room for.
        let mut input = Tensor::from_f32(&[2, 3, 4], &[0.0; 24]);
        input.reserve(&[2, 8, 4]).unwrap();
        let mut output = Tensor::new(DType::F32);
        assert!(matches!(
            split(&input, 2, 0, 2, &mut output),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn test_cat_first_and_last_axis() {
        let a = Tensor::from_f32(&[1, 2], &[1.0, 2.0]);
        let b = Tensor::from_f32(&[2, 2], &[3.0, 4.0, 5.0, 6.0]);
        let mut rows = Tensor::new(DType::F32);
        cat(&a, &b, &mut rows, 0).unwrap();
        assert_eq!(rows.shape(), &[3, 2]);
        assert_eq!(rows.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let c = Tensor::from_f32(&[2, 1], &[9.0, 10.0]);
        let mut cols = Tensor::new(DType::F32);
        cat(&b, &c, &mut cols, -1).unwrap();
        assert_eq!(cols.shape(), &[2, 3]);
        assert_eq!(cols.as_f32().unwrap(), &[3.0, 4.0, 9.0, 5.0, 6.0, 10.0]);
    }

    #[test]
    fn test_cat_with_shapeless_first_operand() {
        let empty = Tensor::new(DType::F32);
        let b = Tensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let mut output = Tensor::new(DType::F32);
        cat(&empty, &b, &mut output, 0).unwrap();
        assert_eq!(output.shape(), &[2, 2]);
        assert_eq!(output.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_cat_direct_grows_inside_reservation() {
        let mut cache = Tensor::new(DType::F32);
        cache.reserve(&[2, 4, 2]).unwrap();
        cache.resize(&[2, 0, 2]).unwrap();

        let first = Tensor::from_f32(&[2, 2, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        cat_direct(&mut cache, &first, 1).unwrap();
        assert_eq!(cache.shape(), &[2, 2, 2]);
        assert_eq!(cache.strides(), &[8, 2, 1]);

        let second = Tensor::from_f32(&[2, 1, 2], &[9.0, 10.0, 11.0, 12.0]);
        cat_direct(&mut cache, &second, 1).unwrap();
        assert_eq!(cache.shape(), &[2, 3, 2]);

        let data: &[f32] = bytemuck::cast_slice(cache.host_bytes().unwrap());
        assert_eq!(&data[0..6], &[1.0, 2.0, 3.0, 4.0, 9.0, 10.0]);
        assert_eq!(&data[8..14], &[5.0, 6.0, 7.0, 8.0, 11.0, 12.0]);

        // A strided split sees the logical rows, not the padding.
        let mut tail = Tensor::new(DType::F32);
        split(&cache, 1, 1, 3, &mut tail).unwrap();
        assert_eq!(tail.shape(), &[2, 2, 2]);
        assert_eq!(
            tail.as_f32().unwrap(),
            &[3.0, 4.0, 9.0, 10.0, 7.0, 8.0, 11.0, 12.0]
        );

        // Growing past the envelope is refused.
        let third = Tensor::from_f32(&[2, 3, 2], &[0.0; 12]);
        assert!(cat_direct(&mut cache, &third, 1).is_err());
    }

    #[test]
    fn test_cat_direct_requires_reservation() {
        let mut plain = Tensor::from_f32(&[2, 1, 2], &[0.0; 4]);
        let add = Tensor::from_f32(&[2, 1, 2], &[1.0; 4]);
        assert!(cat_direct(&mut plain, &add, 1).is_err());
    }

    #[test]
    fn test_cat_direct_rejects_padding_above_the_axis() {
        // Room on the append axis, but a second reservation pads axis 1
        // above it; the source walk would overrun the compact operand.
        let mut cache = Tensor::from_f32(&[2, 3, 4], &[0.0; 24]);
        cache.reserve(&[2, 3, 8]).unwrap();
        cache.reserve(&[2, 8, 8]).unwrap();
        let add = Tensor::from_f32(&[2, 3, 1], &[1.0; 6]);
        assert!(matches!(
            cat_direct(&mut cache, &add, 2),
            Err(Error::InvalidShape(_))
        ));
        // The rejected append leaves the logical shape alone.
        assert_eq!(cache.shape(), &[2, 3, 4]);
    }

    #[test]
    fn test_permute_transposes() {
        #[rustfmt::skip]
        let input = Tensor::from_f32(&[2, 3], &[
            1.0, 2.0, 3.0,
            4.0, 5.0, 6.0,
        ]);
        let axis = Tensor::int32_params(&[1, 0]);
        let mut output = Tensor::new(DType::F32);
        permute(&input, &axis, &mut output).unwrap();
        assert_eq!(output.shape(), &[3, 2]);
        assert_eq!(output.as_f32().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_permute_three_axes() {
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let input = Tensor::from_f32(&[2, 3, 4], &data);
        let axis = Tensor::int32_params(&[1, 2, 0]);
        let mut output = Tensor::new(DType::F32);
        permute(&input, &axis, &mut output).unwrap();
        assert_eq!(output.shape(), &[3, 4, 2]);
        let out = output.as_f32().unwrap();
        for i in 0..2 {
            for j in 0..3 {
                for k in 0..4 {
                    let v = data[i * 12 + j * 4 + k];
                    assert_eq!(out[j * 8 + k * 2 + i], v, "({i},{j},{k})");
                }
            }
        }
    }

    #[test]
    fn test_permute_self_matches_permute() {
        let data: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let mut t = Tensor::from_f32(&[2, 3], &data);
        let axis = Tensor::int32_params(&[1, 0]);
        permute_self(&mut t, &axis).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.as_f32().unwrap(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_permute_rejects_non_permutation() {
        let input = Tensor::from_f32(&[2, 3], &[0.0; 6]);
        let mut output = Tensor::new(DType::F32);
        for bad in [&[0, 0][..], &[0, 2], &[0], &[-1, 0]] {
            let axis = Tensor::int32_params(bad);
            assert!(permute(&input, &axis, &mut output).is_err(), "{bad:?}");
        }
    }
}
