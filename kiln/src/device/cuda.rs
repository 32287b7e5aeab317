//! CUDA memory backend
//!
//! Provides accelerator-resident storage through cudarc so tensors can be
//! placed on and moved between a real GPU and the host. No kernels ship
//! with it: the supported operation set is empty, so execution falls back
//! to the host after operands are staged there.

use std::any::Any;
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaSlice};

use crate::device::{DeviceBackend, DeviceBuffer};
use crate::error::{Error, Result};
use crate::ops::{Op, OpKind};

struct CudaBuffer {
    device: Arc<CudaDevice>,
    slice: CudaSlice<u8>,
}

impl CudaBuffer {
    fn check(&self, offset: usize, len: usize, what: &str) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.slice.len() => Ok(()),
            _ => Err(Error::Backend(format!(
                "cuda {what} of {len} bytes at offset {offset} overruns {}-byte buffer",
                self.slice.len()
            ))),
        }
    }
}

impl DeviceBuffer for CudaBuffer {
    fn len(&self) -> usize {
        self.slice.len()
    }

    fn upload(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len(), "upload")?;
        let mut view = self.slice.slice_mut(offset..offset + src.len());
        self.device.htod_sync_copy_into(src, &mut view)?;
        Ok(())
    }

    fn download(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len(), "download")?;
        let view = self.slice.slice(offset..offset + dst.len());
        self.device.dtoh_sync_copy_into(&view, dst)?;
        Ok(())
    }

    fn alloc_like(&self, len: usize) -> Result<Box<dyn DeviceBuffer>> {
        let slice = self
            .device
            .alloc_zeros::<u8>(len)
            .map_err(|e| Error::Alloc(format!("cuda alloc of {len} bytes failed: {e}")))?;
        Ok(Box::new(CudaBuffer {
            device: Arc::clone(&self.device),
            slice,
        }))
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
            .downcast_ref::<CudaBuffer>()
            .ok_or_else(|| Error::Backend("cuda strided copy from a foreign buffer".into()))?;
        for row in 0..rows {
            let s = row * src_pitch;
            let d = row * dst_pitch;
            src.check(s, width, "strided read")?;
            self.check(d, width, "strided write")?;
            let sv = src.slice.slice(s..s + width);
            let mut dv = self.slice.slice_mut(d..d + width);
            self.device.dtod_copy(&sv, &mut dv)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Backend backed by one CUDA device. Storage and transfer only.
pub struct CudaAccelerator {
    device: Arc<CudaDevice>,
}

impl CudaAccelerator {
    /// Bind to the CUDA device with the given ordinal.
    ///
    /// # Errors
    /// Returns [`Error::Backend`] when the device cannot be initialized.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal)?;
        Ok(Self { device })
    }
}

impl DeviceBackend for CudaAccelerator {
    fn name(&self) -> &str {
        "cuda"
    }

    fn supported_ops(&self) -> &[OpKind] {
        &[]
    }

    fn upload(&self, src: &[u8]) -> Result<Box<dyn DeviceBuffer>> {
        let slice = self
            .device
            .htod_sync_copy(src)
            .map_err(|e| Error::Alloc(format!("cuda upload of {} bytes failed: {e}", src.len())))?;
        Ok(Box::new(CudaBuffer {
            device: Arc::clone(&self.device),
            slice,
        }))
    }

    fn execute(&self, op: Op<'_>) -> Result<()> {
        Err(Error::NoBackend(op.kind().name().to_string()))
    }
}
