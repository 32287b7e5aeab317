//! Repetition penalty over logits.

use kiln::{Error, Result, Tensor};

use super::require_compact;

/// Apply a per-token penalty to logits in place.
///
/// Positive logits divide by their penalty, negative ones multiply, so
/// a penalty above 1.0 always pushes the logit toward rejection. The
/// penalty row covers the vocab axis and repeats over leading rows.
pub fn repeat_penalty(input: &mut Tensor, penalty: &Tensor) -> Result<()> {
    require_compact(input, "penalty target")?;
    require_compact(penalty, "penalty")?;
    let Some(&vocab) = input.shape().last() else {
        return Err(Error::InvalidShape("penalty target is shapeless".into()));
    };
    if penalty.numel() != vocab {
        return Err(Error::ShapeMismatch {
            expected: vec![vocab],
            got: penalty.shape().to_vec(),
        });
    }
    let p = penalty.as_f32()?;
    let logits = input.as_f32_mut()?;
    for row in logits.chunks_exact_mut(vocab) {
        for (x, &f) in row.iter_mut().zip(p) {
            if *x < 0.0 {
                *x *= f;
            } else {
                *x /= f;
            }
        }
    }
    Ok(())
}
