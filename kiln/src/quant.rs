//! Affine quantization codec
//!
//! Maps an observed value range onto unsigned integer codes of a configurable
//! bit width. The range is first widened to include zero so that 0.0 always
//! has an exact code; the codec is lossy, with round-trip error bounded by
//! half a quantization step.

/// Per-channel quantization parameters.
///
/// `scale` and `zero_point` are derived from the observed `[min, max]` range
/// at construction and never drift from it; re-deriving from the same bounds
/// yields the same codes, which is what the weight format relies on when it
/// stores only the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuantConfig {
    pub bit: i32,
    pub min: f32,
    pub max: f32,
    pub zero_point: u8,
    pub scale: f32,
}

impl QuantConfig {
    /// Build a config from an observed range and bit width.
    ///
    /// The range is clamped so that `min <= 0 <= max`. The zero point is the
    /// code assigned to 0.0, clamped to the code range and rounded to the
    /// nearest integer with ties away from zero.
    #[must_use]
    pub fn new(min: f32, max: f32, bit: i32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let qmax = ((1i32 << bit) - 1) as f32;
        let scale = (max - min) / qmax;
        let initial_zero_point = -min / scale;
        let zero_point = if initial_zero_point < 0.0 {
            0
        } else if initial_zero_point > qmax {
            qmax as u8
        } else {
            initial_zero_point.round() as u8
        };
        Self {
            bit,
            min,
            max,
            zero_point,
            scale,
        }
    }

    /// Quantize a real value to its code, clamped to the code range.
    ///
    /// The bias-and-truncate is done in double precision so the result is
    /// identical across platforms.
    #[must_use]
    pub fn quantize(&self, x: f32) -> u8 {
        let qmax = ((1i32 << self.bit) - 1) as f64;
        let v = f64::from(x / self.scale + self.zero_point as f32) + 0.5;
        v.max(0.0).min(qmax) as u8
    }

    /// Recover the real value a code stands for
    #[must_use]
    pub fn dequantize(&self, code: u8) -> f32 {
        self.scale * (f32::from(code) - f32::from(self.zero_point))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_range_bit8() {
        let cfg = QuantConfig::new(-1.0, 1.0, 8);
        assert!((cfg.scale - 2.0 / 255.0).abs() < 1e-7);
        assert_eq!(cfg.zero_point, 127);
        assert_eq!(cfg.quantize(0.0), 127);
        assert_eq!(cfg.dequantize(127), 0.0);
    }

    #[test]
    fn test_round_trip_error_within_half_step() {
        let cfg = QuantConfig::new(-1.0, 1.0, 8);
        let bound = cfg.scale / 2.0 + 1e-6;
        let mut x = -1.0f32;
        while x <= 1.0 {
            let back = cfg.dequantize(cfg.quantize(x));
            assert!(
                (back - x).abs() <= bound,
                "x = {x}, back = {back}, bound = {bound}"
            );
            x += 0.0137;
        }
    }

    #[test]
    fn test_range_widens_to_include_zero() {
        // All-positive range: min clamps to 0, so 0.0 gets code 0
        let cfg = QuantConfig::new(0.5, 2.0, 8);
        assert_eq!(cfg.min, 0.0);
        assert_eq!(cfg.zero_point, 0);
        assert_eq!(cfg.quantize(0.0), 0);

        // All-negative range: max clamps to 0, so 0.0 gets the top code
        let cfg = QuantConfig::new(-2.0, -0.5, 8);
        assert_eq!(cfg.max, 0.0);
        assert_eq!(cfg.zero_point, 255);
        assert_eq!(cfg.quantize(0.0), 255);
    }

    #[test]
    fn test_bit4_codes_stay_in_range() {
        let cfg = QuantConfig::new(-0.3, 0.9, 4);
        for x in [-5.0f32, -0.3, 0.0, 0.45, 0.9, 5.0] {
            assert!(cfg.quantize(x) <= 15);
        }
        assert!((cfg.dequantize(cfg.quantize(0.45)) - 0.45).abs() <= cfg.scale / 2.0 + 1e-6);
    }

    #[test]
    fn test_degenerate_zero_range() {
        let cfg = QuantConfig::new(0.0, 0.0, 8);
        assert_eq!(cfg.scale, 0.0);
        assert_eq!(cfg.quantize(0.0), 0);
        assert_eq!(cfg.dequantize(0), 0.0);
    }

    #[test]
    fn test_extreme_bit_widths() {
        let one = QuantConfig::new(-1.0, 1.0, 1);
        assert!(one.quantize(1.0) <= 1);
        let two = QuantConfig::new(-1.0, 1.0, 2);
        assert!(two.quantize(1.0) <= 3);
    }
}
