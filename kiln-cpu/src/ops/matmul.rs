//! Batched matrix products over strided operands.
//!
//! Operands are addressed through `count` pitches and per-row strides, so
//! a reservation-padded KV cache works as an operand without compaction.
//! The innermost axis is always unit stride. Batches are parallelized
//! with Rayon; the output is freshly allocated and compact.

use kiln::{Error, Result, Tensor};
use rayon::prelude::*;

use super::prepare_output;

struct MatView<'a> {
    data: &'a [f32],
    batch_pitch: usize,
    row_stride: usize,
}

fn view(t: &Tensor) -> Result<MatView<'_>> {
    let nd = t.ndim();
    Ok(MatView {
        data: t.as_f32()?,
        batch_pitch: t.count(nd - 2),
        row_stride: t.strides()[nd - 2],
    })
}

/// Check rank and leading-dim agreement; the logical batch count.
fn batch_of(input0: &Tensor, input1: &Tensor) -> Result<usize> {
    let nd = input0.ndim();
    if nd < 2 || input1.ndim() != nd {
        return Err(Error::InvalidShape(format!(
            "matmul needs equal ranks of at least 2, got {:?} and {:?}",
            input0.shape(),
            input1.shape()
        )));
    }
    if input0.shape()[..nd - 2] != input1.shape()[..nd - 2] {
        return Err(Error::ShapeMismatch {
            expected: input0.shape().to_vec(),
            got: input1.shape().to_vec(),
        });
    }
    Ok(input0.shape()[..nd - 2].iter().product())
}

/// Batched `output = alpha * (input0 @ input1)`.
#[allow(clippy::many_single_char_names)]
pub fn matmul(input0: &Tensor, input1: &Tensor, output: &mut Tensor, alpha: f32) -> Result<()> {
    let batch = batch_of(input0, input1)?;
    let nd = input0.ndim();
    let n = input0.shape()[nd - 2];
    let k = input0.shape()[nd - 1];
    let m = input1.shape()[nd - 1];
    if input1.shape()[nd - 2] != k {
        return Err(Error::ShapeMismatch {
            expected: input0.shape().to_vec(),
            got: input1.shape().to_vec(),
        });
    }

    let mut out_shape = input0.shape().to_vec();
    out_shape[nd - 1] = m;
    prepare_output(output, &out_shape)?;
    if n * m == 0 {
        return Ok(());
    }

    let a = view(input0)?;
    let b = view(input1)?;
    let dst = output.as_f32_mut()?;
    let run = |bi: usize, c: &mut [f32]| {
        let abase = bi * a.batch_pitch;
        let bbase = bi * b.batch_pitch;
        for i in 0..n {
            let arow = abase + i * a.row_stride;
            for j in 0..m {
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += a.data[arow + p] * b.data[bbase + p * b.row_stride + j];
                }
                c[i * m + j] = alpha * sum;
            }
        }
    };
    if batch == 1 {
        // Single matrix: skip thread-pool overhead.
        run(0, dst);
    } else {
        dst.par_chunks_mut(n * m)
            .enumerate()
            .for_each(|(bi, c)| run(bi, c));
    }
    Ok(())
}

/// Batched `output = alpha * (input0 @ input1^T)`.
///
/// `input1` holds its matrices as `[m, k]`, so both dot operands are
/// contiguous rows.
#[allow(clippy::many_single_char_names)]
pub fn matmul_trans_b(
    input0: &Tensor,
    input1: &Tensor,
    output: &mut Tensor,
    alpha: f32,
) -> Result<()> {
    let batch = batch_of(input0, input1)?;
    let nd = input0.ndim();
    let n = input0.shape()[nd - 2];
    let k = input0.shape()[nd - 1];
    let m = input1.shape()[nd - 2];
    if input1.shape()[nd - 1] != k {
        return Err(Error::ShapeMismatch {
            expected: input0.shape().to_vec(),
            got: input1.shape().to_vec(),
        });
    }

    let mut out_shape = input0.shape().to_vec();
    out_shape[nd - 1] = m;
    prepare_output(output, &out_shape)?;
    if n * m == 0 {
        return Ok(());
    }

    let a = view(input0)?;
    let b = view(input1)?;
    let dst = output.as_f32_mut()?;
    let run = |bi: usize, c: &mut [f32]| {
        let abase = bi * a.batch_pitch;
        let bbase = bi * b.batch_pitch;
        for i in 0..n {
            let arow = abase + i * a.row_stride;
            for j in 0..m {
                let brow = bbase + j * b.row_stride;
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += a.data[arow + p] * b.data[brow + p];
                }
                c[i * m + j] = alpha * sum;
            }
        }
    };
    if batch == 1 {
        run(0, dst);
    } else {
        dst.par_chunks_mut(n * m)
            .enumerate()
            .for_each(|(bi, c)| run(bi, c));
    }
    Ok(())
}
