//! Little-endian binary writer, the mirror of [`super::reader::Reader`].

use std::io::Write;

use crate::{Error, Result};

/// Sequential writer that emits the weight-file primitives.
pub struct Writer<W: Write> {
    inner: W,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// # Errors
    /// Propagates IO errors from the underlying writer.
    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    /// # Errors
    /// Propagates IO errors from the underlying writer.
    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    /// Emit a length-prefixed string (i32 byte count, then raw bytes).
    ///
    /// # Errors
    /// Fails when the string does not fit the format's `i32` length
    /// prefix, or on an IO error from the underlying writer.
    pub fn write_string(&mut self, s: &str) -> Result<()> {
        let len = i32::try_from(s.len()).map_err(|_| {
            Error::UnsupportedFormat(format!(
                "string of {} bytes exceeds the format's length prefix",
                s.len()
            ))
        })?;
        self.write_i32(len)?;
        self.inner.write_all(s.as_bytes())?;
        Ok(())
    }

    /// # Errors
    /// Propagates IO errors from the underlying writer.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    /// Flush buffered output and return the inner writer.
    ///
    /// # Errors
    /// Propagates IO errors from the flush.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}
