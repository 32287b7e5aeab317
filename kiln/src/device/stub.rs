//! Host-memory accelerator stand-in
//!
//! Stores "device" bytes in ordinary `Vec<u8>` allocations so placement,
//! transfer, and fallback behavior can be exercised without accelerator
//! hardware. It executes nothing: its supported set is empty, which forces
//! the executor down the host-fallback path.

use std::any::Any;

use crate::device::{DeviceBackend, DeviceBuffer};
use crate::error::{Error, Result};
use crate::ops::{Op, OpKind};

struct StubBuffer {
    data: Vec<u8>,
}

impl DeviceBuffer for StubBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn upload(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::Backend(format!(
                    "stub upload of {} bytes at offset {offset} overruns {}-byte buffer",
                    src.len(),
                    self.data.len()
                ))
            })?;
        self.data[offset..end].copy_from_slice(src);
        Ok(())
    }

    fn download(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(dst.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::Backend(format!(
                    "stub download of {} bytes at offset {offset} overruns {}-byte buffer",
                    dst.len(),
                    self.data.len()
                ))
            })?;
        dst.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn alloc_like(&self, len: usize) -> Result<Box<dyn DeviceBuffer>> {
        Ok(Box::new(StubBuffer { data: vec![0; len] }))
    }

    fn copy_strided_from(
        &mut self,
        src: &dyn DeviceBuffer,
        dst_pitch: usize,
        src_pitch: usize,
        width: usize,
        rows: usize,
    ) -> Result<()> {
        let src = src
            .as_any()
            .downcast_ref::<StubBuffer>()
            .ok_or_else(|| Error::Backend("stub strided copy from a foreign buffer".into()))?;
        for row in 0..rows {
            let s = row * src_pitch;
            let d = row * dst_pitch;
            if s + width > src.data.len() || d + width > self.data.len() {
                return Err(Error::Backend(format!(
                    "stub strided copy overruns at row {row}: src {s}+{width}/{}, dst {d}+{width}/{}",
                    src.data.len(),
                    self.data.len()
                )));
            }
            self.data[d..d + width].copy_from_slice(&src.data[s..s + width]);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Backend whose "device memory" is host memory. Supports no operations.
#[derive(Debug, Default)]
pub struct StubAccelerator;

impl StubAccelerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for StubAccelerator {
    fn name(&self) -> &str {
        "stub"
    }

    fn supported_ops(&self) -> &[OpKind] {
        &[]
    }

    fn upload(&self, src: &[u8]) -> Result<Box<dyn DeviceBuffer>> {
        Ok(Box::new(StubBuffer { data: src.to_vec() }))
    }

    fn execute(&self, op: Op<'_>) -> Result<()> {
        Err(Error::NoBackend(op.kind().name().to_string()))
    }
}
