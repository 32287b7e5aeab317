//! Little-endian binary reader over a borrowed byte slice.
//!
//! Weight files are memory-mapped and parsed in place; the reader tracks its
//! offset so truncation errors can say exactly where the file ran out.

use crate::{Error, Result};

/// Sequential reader over a byte slice.
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current byte offset from the start of the slice.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Consume `n` bytes and return them as a subslice.
    ///
    /// # Errors
    /// Returns `Error::Truncated` if fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(Error::Truncated {
                offset: self.offset,
                needed: n,
                remaining,
            });
        }
        let out = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    /// Skip `n` bytes without reading them.
    ///
    /// # Errors
    /// Returns `Error::Truncated` if fewer than `n` bytes remain.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// # Errors
    /// Returns `Error::Truncated` if fewer than 4 bytes remain.
    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// # Errors
    /// Returns `Error::Truncated` if fewer than 4 bytes remain.
    pub fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read an `i32` count and validate it as a non-negative length.
    ///
    /// # Errors
    /// Returns `Error::UnsupportedFormat` for negative counts, or
    /// `Error::Truncated` if the count itself cannot be read.
    pub fn read_len(&mut self) -> Result<usize> {
        let at = self.offset;
        let n = self.read_i32()?;
        usize::try_from(n).map_err(|_| {
            Error::UnsupportedFormat(format!("negative length {n} at offset {at}"))
        })
    }

    /// Read a length-prefixed string (i32 byte count, then raw bytes).
    ///
    /// Invalid UTF-8 is replaced rather than rejected; tensor names in the
    /// wild are ASCII but nothing in the format enforces it.
    ///
    /// # Errors
    /// Returns `Error::Truncated` if the slice ends inside the string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read `n` raw bytes into an owned vector.
    ///
    /// # Errors
    /// Returns `Error::Truncated` if fewer than `n` bytes remain.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_scalars() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7i32.to_le_bytes());
        buf.extend_from_slice(&(-1i32).to_le_bytes());
        buf.extend_from_slice(&1.5f32.to_le_bytes());

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_i32().unwrap(), 7);
        assert_eq!(r.read_i32().unwrap(), -1);
        assert!((r.read_f32().unwrap() - 1.5).abs() < f32::EPSILON);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_read_string() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&5i32.to_le_bytes());
        buf.extend_from_slice(b"model");

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string().unwrap(), "model");
        assert_eq!(r.offset(), 9);
    }

    #[test]
    fn test_truncated_read_reports_position() {
        let buf = [1u8, 2];
        let mut r = Reader::new(&buf);
        match r.read_i32() {
            Err(Error::Truncated {
                offset,
                needed,
                remaining,
            }) => {
                assert_eq!(offset, 0);
                assert_eq!(needed, 4);
                assert_eq!(remaining, 2);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_length_rejected() {
        let buf = (-3i32).to_le_bytes();
        let mut r = Reader::new(&buf);
        assert!(matches!(
            r.read_len(),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_skip_advances_offset() {
        let buf = [0u8; 10];
        let mut r = Reader::new(&buf);
        r.skip(6).unwrap();
        assert_eq!(r.offset(), 6);
        assert_eq!(r.remaining(), 4);
        assert!(r.skip(5).is_err());
    }
}
