//! Rotary position encoding.

use kiln::{Error, Result, Tensor};

use super::require_compact;

/// Rotate the first `rotary_dim` lane pairs of every head in place.
///
/// `input` is `[batch, len, heads, head_dim]`. For each position the
/// id comes from `position_ids`, selecting one row of the `sin` and
/// `cos` tables; lane `j` pairs with lane `j + head_dim/2`.
#[allow(clippy::many_single_char_names)]
pub fn rotate_position_2d(
    input: &mut Tensor,
    position_ids: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    rotary_dim: i32,
) -> Result<()> {
    require_compact(input, "rotation target")?;
    if input.ndim() != 4 {
        return Err(Error::InvalidShape(format!(
            "rotation target must be [batch, len, heads, dim], got {:?}",
            input.shape()
        )));
    }
    if sin.ndim() != 2 || cos.ndim() != 2 {
        return Err(Error::InvalidShape(format!(
            "rotation tables must be rank 2, got {:?} and {:?}",
            sin.shape(),
            cos.shape()
        )));
    }
    let bs = input.shape()[0];
    let len = input.shape()[1];
    let heads = input.shape()[2];
    let m = input.shape()[3];
    let half = m / 2;
    let positions = sin.shape()[0].min(cos.shape()[0]);
    let table_width = sin.shape()[1].min(cos.shape()[1]);
    let lanes = (rotary_dim.max(0) as usize).min(half).min(table_width);

    let id_pitch = position_ids
        .shape()
        .last()
        .copied()
        .unwrap_or(0);
    if id_pitch < len {
        return Err(Error::InvalidShape(format!(
            "position ids cover {id_pitch} steps for a length of {len}"
        )));
    }

    let ids = position_ids.as_f32()?;
    if ids.len() < bs * id_pitch {
        return Err(Error::InvalidShape(format!(
            "position ids hold {} values for {bs} batch rows of {id_pitch}",
            ids.len()
        )));
    }
    let sin_rows = sin.as_f32()?;
    let cos_rows = cos.as_f32()?;
    let data = input.as_f32_mut()?;
    for b in 0..bs {
        for l in 0..len {
            let pos = ids[b * id_pitch + l];
            let index = pos as usize;
            if pos < 0.0 || index >= positions {
                return Err(Error::InvalidShape(format!(
                    "position {pos} outside the rotation tables of {positions} rows"
                )));
            }
            let srow = &sin_rows[index * sin.shape()[1]..][..table_width];
            let crow = &cos_rows[index * cos.shape()[1]..][..table_width];
            let base = (b * len + l) * heads * m;
            for h in 0..heads {
                let d = &mut data[base + h * m..base + (h + 1) * m];
                for j in 0..lanes {
                    let a = d[j];
                    let b2 = d[j + half];
                    d[j] = a * crow[j] - b2 * srow[j];
                    d[j + half] = a * srow[j] + b2 * crow[j];
                }
            }
        }
    }
    Ok(())
}
