//! Candidate selection over the last axis.

use kiln::{Error, Result, Tensor};

use super::{prepare_output, require_compact};

/// Emit the best candidate of every row as an (index, value) pair.
///
/// Only `topk == 1` is supported; sampling happens on the host, so the
/// dispatch never needs more than the argmax. Ties keep the lowest
/// index.
pub fn top_k(input: &Tensor, output: &mut Tensor, topk: i32) -> Result<()> {
    require_compact(input, "topk input")?;
    if topk != 1 {
        return Err(Error::Backend(format!(
            "top-k keeps a single candidate here, got k = {topk}"
        )));
    }
    let Some(&channels) = input.shape().last() else {
        return Err(Error::InvalidShape("topk input is shapeless".into()));
    };
    if channels == 0 {
        return Err(Error::InvalidShape("topk input has no candidates".into()));
    }

    let mut dims = input.shape().to_vec();
    if let Some(last) = dims.last_mut() {
        *last = 2;
    }
    prepare_output(output, &dims)?;

    let src = input.as_f32()?;
    let dst = output.as_f32_mut()?;
    for (row, pair) in src.chunks_exact(channels).zip(dst.chunks_exact_mut(2)) {
        let mut best = 0usize;
        for (i, &v) in row.iter().enumerate() {
            if v > row[best] {
                best = i;
            }
        }
        #[allow(clippy::cast_precision_loss)]
        {
            pair[0] = best as f32;
        }
        pair[1] = row[best];
    }
    Ok(())
}
