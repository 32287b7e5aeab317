//! Element kinds for tensors, including packed sub-byte widths

use std::fmt;

use crate::error::{Error, Result};

/// Supported element kinds for tensors.
///
/// Byte layout is described by the `unit_size` / `unit_size_div` pair: a
/// dtype occupies `unit_size` bytes per `unit_size_div` elements, so the
/// sub-byte kinds pack several elements into one byte (`I4` packs two,
/// `Bit` packs eight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// Brain floating point (16-bit)
    BF16,
    /// 16-bit signed integer
    I16,
    /// 8-bit quantized code
    I8,
    /// 4-bit quantized code, two per byte
    I4,
    /// 2-bit quantized code, four per byte
    I2,
    /// 1-bit code, eight per byte
    Bit,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// 32-bit integer parameter payload, always host-resident
    I32Param,
}

impl DType {
    /// Bytes occupied by `unit_size_div` consecutive elements
    #[must_use]
    pub const fn unit_size(self) -> usize {
        match self {
            Self::F32 | Self::I32Param => 4,
            Self::BF16 | Self::I16 | Self::F16 => 2,
            Self::I8 | Self::I4 | Self::I2 | Self::Bit => 1,
        }
    }

    /// Number of elements sharing one `unit_size` span
    #[must_use]
    pub const fn unit_size_div(self) -> usize {
        match self {
            Self::I4 => 2,
            Self::I2 => 4,
            Self::Bit => 8,
            _ => 1,
        }
    }

    /// On-disk tag in the weight format
    #[must_use]
    pub const fn tag(self) -> i32 {
        match self {
            Self::F32 => 0,
            Self::BF16 => 1,
            Self::I16 => 2,
            Self::I8 => 3,
            Self::I4 => 4,
            Self::I2 => 5,
            Self::Bit => 6,
            Self::F16 => 7,
            Self::I32Param => 100,
        }
    }

    /// Decode an on-disk tag.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedDtype`] for a tag outside the format.
    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(Self::F32),
            1 => Ok(Self::BF16),
            2 => Ok(Self::I16),
            3 => Ok(Self::I8),
            4 => Ok(Self::I4),
            5 => Ok(Self::I2),
            6 => Ok(Self::Bit),
            7 => Ok(Self::F16),
            100 => Ok(Self::I32Param),
            _ => Err(Error::UnsupportedDtype(format!("tag {tag}"))),
        }
    }

    /// Bytes needed to hold `elems` elements of this dtype.
    ///
    /// Rounds up so that a trailing partially-filled byte is counted.
    #[must_use]
    pub const fn bytes_for(self, elems: usize) -> usize {
        if elems == 0 {
            0
        } else {
            (elems * self.unit_size() - 1) / self.unit_size_div() + 1
        }
    }

    /// True for the quantized integer kinds that carry codec configs
    #[must_use]
    pub const fn is_quantized(self) -> bool {
        matches!(self, Self::I8 | Self::I4 | Self::I2 | Self::Bit)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::BF16 => write!(f, "bf16"),
            Self::I16 => write!(f, "i16"),
            Self::I8 => write!(f, "i8"),
            Self::I4 => write!(f, "i4"),
            Self::I2 => write!(f, "i2"),
            Self::Bit => write!(f, "bit"),
            Self::F16 => write!(f, "f16"),
            Self::I32Param => write!(f, "i32param"),
        }
    }
}
