//! Token embedding lookup.
//!
//! The table may be f32, f16 or bf16; rows widen to f32 on the way out.
//! A deferred table is never materialized here: each requested row is
//! read straight from its source file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use kiln::{DType, Error, Result, Tensor};

use super::{prepare_output, require_compact};

pub fn embedding(input: &Tensor, weight: &Tensor, output: &mut Tensor) -> Result<()> {
    require_compact(input, "embedding input")?;
    if weight.ndim() != 2 {
        return Err(Error::InvalidShape(format!(
            "embedding table must be rank 2, got {:?}",
            weight.shape()
        )));
    }
    match weight.dtype() {
        DType::F32 | DType::BF16 | DType::F16 => {}
        other => {
            return Err(Error::UnsupportedDtype(format!(
                "embedding table stored as {other}"
            )))
        }
    }
    let vocab = weight.shape()[0];
    let dim = weight.shape()[1];

    let ids = input.as_f32()?;
    let mut rows = Vec::with_capacity(ids.len());
    for &v in ids {
        let id = v as usize;
        if v < 0.0 || id >= vocab {
            return Err(Error::InvalidShape(format!(
                "token id {v} outside table of {vocab} rows"
            )));
        }
        rows.push(id);
    }

    let mut out_shape = input.shape().to_vec();
    out_shape.push(dim);
    prepare_output(output, &out_shape)?;

    let row_bytes = weight.dtype().bytes_for(dim);
    if let Some(source) = weight.deferred() {
        let mut file = File::open(&source.path)?;
        let mut raw = vec![0u8; row_bytes];
        let dst = output.as_f32_mut()?;
        for (i, &id) in rows.iter().enumerate() {
            file.seek(SeekFrom::Start(source.offset + (id * row_bytes) as u64))?;
            file.read_exact(&mut raw)?;
            widen_row(weight.dtype(), &raw, &mut dst[i * dim..(i + 1) * dim])?;
        }
    } else {
        let bytes = weight.host_bytes()?;
        let dst = output.as_f32_mut()?;
        for (i, &id) in rows.iter().enumerate() {
            let raw = &bytes[id * row_bytes..(id + 1) * row_bytes];
            widen_row(weight.dtype(), raw, &mut dst[i * dim..(i + 1) * dim])?;
        }
    }
    Ok(())
}

/// Decode one little-endian table row into f32.
fn widen_row(dtype: DType, raw: &[u8], out: &mut [f32]) -> Result<()> {
    match dtype {
        DType::F32 => {
            for (o, c) in out.iter_mut().zip(raw.chunks_exact(4)) {
                *o = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            }
        }
        DType::BF16 => {
            for (o, c) in out.iter_mut().zip(raw.chunks_exact(2)) {
                *o = half::bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32();
            }
        }
        DType::F16 => {
            for (o, c) in out.iter_mut().zip(raw.chunks_exact(2)) {
                *o = half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32();
            }
        }
        other => {
            return Err(Error::UnsupportedDtype(format!(
                "embedding table stored as {other}"
            )))
        }
    }
    Ok(())
}
