//! Device abstraction
//!
//! Tensors live either in host memory or behind a [`DeviceBuffer`] owned by
//! an accelerator backend. A [`DeviceBackend`] advertises the operation
//! kinds it can execute; the executor consults that set when placing work.

use std::any::Any;

use crate::error::Result;
use crate::ops::{Op, OpKind};

#[cfg(feature = "cuda")]
mod cuda;
mod stub;

#[cfg(feature = "cuda")]
pub use cuda::CudaAccelerator;
pub use stub::StubAccelerator;

/// Where a tensor's bytes currently reside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Ordinary host memory
    #[default]
    Host,
    /// Memory owned by an accelerator backend
    Accel,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Accel => write!(f, "accel"),
        }
    }
}

/// An opaque allocation owned by an accelerator.
///
/// A buffer is created by uploading host bytes through
/// [`DeviceBackend::upload`] and is released by its `Drop` impl. Ownership
/// is exclusive: transferring a tensor between devices moves the bytes and
/// destroys the source allocation, there is no aliasing.
pub trait DeviceBuffer: Any + Send + Sync {
    /// Size of the allocation in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` into the allocation starting at byte `offset`.
    ///
    /// # Errors
    /// Out-of-bounds writes are backend errors, never truncation.
    fn upload(&mut self, offset: usize, src: &[u8]) -> Result<()>;

    /// Copy the allocation's bytes starting at `offset` into `dst`.
    ///
    /// # Errors
    /// Out-of-bounds reads are backend errors.
    fn download(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Allocate an uninitialized buffer of `len` bytes on the same device.
    ///
    /// # Errors
    /// Returns [`crate::Error::Alloc`] when the device is out of memory.
    fn alloc_like(&self, len: usize) -> Result<Box<dyn DeviceBuffer>>;

    /// Strided device-to-device copy: `rows` runs of `width` bytes, read at
    /// `src_pitch` intervals from `src` and written at `dst_pitch` intervals
    /// into `self`.
    ///
    /// # Errors
    /// Fails when either side would run past its allocation or when `src`
    /// belongs to a different backend.
    fn copy_strided_from(
        &mut self,
        src: &dyn DeviceBuffer,
        dst_pitch: usize,
        src_pitch: usize,
        width: usize,
        rows: usize,
    ) -> Result<()>;

    /// Downcast support for backend-internal buffer access.
    fn as_any(&self) -> &dyn Any;
}

/// An execution target with its own memory.
///
/// The executor treats backends uniformly: it asks for the supported
/// operation set, stages operands, and calls [`execute`](Self::execute).
/// A backend never sees tensors placed on another device.
pub trait DeviceBackend: Send + Sync {
    /// Short name used in error messages.
    fn name(&self) -> &str;

    /// The operation kinds this backend can execute.
    fn supported_ops(&self) -> &[OpKind];

    fn supports(&self, kind: OpKind) -> bool {
        self.supported_ops().contains(&kind)
    }

    /// Allocate a device buffer holding a copy of `src`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Alloc`] when the allocation fails.
    fn upload(&self, src: &[u8]) -> Result<Box<dyn DeviceBuffer>>;

    /// Run one staged operation. All operands are already resident on this
    /// backend's device.
    ///
    /// # Errors
    /// Returns [`crate::Error::Backend`] for kernel failures and
    /// [`crate::Error::NoBackend`] when handed a kind outside
    /// [`supported_ops`](Self::supported_ops).
    fn execute(&self, op: Op<'_>) -> Result<()>;
}
