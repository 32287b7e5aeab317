//! Attention masking.

use kiln::{Error, Result, Tensor};

use super::require_compact;

/// Write `mask_value` into `input` wherever `mask` is nonzero.
///
/// The mask broadcasts over `input`'s leading batch axes.
pub fn attention_mask(input: &mut Tensor, mask: &Tensor, mask_value: f32) -> Result<()> {
    require_compact(input, "mask target")?;
    require_compact(mask, "mask")?;
    let spatial = mask.numel();
    if spatial == 0 || input.numel() % spatial != 0 {
        return Err(Error::ShapeMismatch {
            expected: input.shape().to_vec(),
            got: mask.shape().to_vec(),
        });
    }
    let m = mask.as_f32()?;
    let data = input.as_f32_mut()?;
    for block in data.chunks_exact_mut(spatial) {
        for (slot, &flag) in block.iter_mut().zip(m) {
            if flag != 0.0 {
                *slot = mask_value;
            }
        }
    }
    Ok(())
}
