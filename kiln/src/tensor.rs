//! Strided, type-erased tensors with reserved-capacity growth.
//!
//! A [`Tensor`] is a shape plus a byte buffer that lives either in host
//! memory or behind a [`DeviceBuffer`]. Strides are element counts, not
//! bytes, so sub-byte kinds pack correctly. A reservation pre-grows the
//! buffer along one axis; the logical shape can then grow inside that
//! envelope without reallocating, which is what sequentially extended
//! caches rely on.

use std::fmt;
use std::path::PathBuf;

use crate::device::{DeviceBackend, DeviceBuffer, DeviceKind};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::quant::QuantConfig;

/// Hint for how a persisted tensor is compressed on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightKind {
    /// Plain data, stored as raw f32.
    #[default]
    None,
    /// Matmul weight, quantized per output row on save.
    Linear,
    /// Lookup table, truncated to bf16 on save.
    Embedding,
}

/// On-disk location of a payload skipped by a low-memory load.
///
/// The tensor keeps its shape and kind but no buffer until
/// materialized through the weight store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredSource {
    pub path: PathBuf,
    pub offset: u64,
}

enum Storage {
    Empty,
    Host(Vec<u8>),
    Accel(Box<dyn DeviceBuffer>),
}

fn compact_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = shape[i + 1] * strides[i + 1];
    }
    strides
}

/// A strided tensor owning exactly one buffer at a time.
///
/// Tensors are move-only: duplicating bytes goes through
/// [`copy_from`](Self::copy_from), and a device transfer moves the
/// allocation rather than sharing it.
pub struct Tensor {
    dtype: DType,
    /// Compression hint consulted by the save path.
    pub weight_kind: WeightKind,
    shape: Vec<usize>,
    strides: Vec<usize>,
    reserved: Option<Vec<usize>>,
    reserved_elems: usize,
    storage: Storage,
    quant_axis: i32,
    quant: Vec<QuantConfig>,
    code_sums: Vec<i64>,
    deferred: Option<DeferredSource>,
}

impl Tensor {
    /// A shapeless tensor: metadata only, no buffer.
    #[must_use]
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype,
            weight_kind: WeightKind::None,
            shape: Vec::new(),
            strides: Vec::new(),
            reserved: None,
            reserved_elems: 0,
            storage: Storage::Empty,
            quant_axis: -1,
            quant: Vec::new(),
            code_sums: Vec::new(),
            deferred: None,
        }
    }

    /// A shaped but unallocated tensor.
    #[must_use]
    pub fn with_shape(dtype: DType, shape: &[usize]) -> Self {
        let mut t = Self::new(dtype);
        t.shape = shape.to_vec();
        t.strides = compact_strides(shape);
        t
    }

    /// An allocated f32 tensor holding a copy of `data`.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    #[must_use]
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        let mut t = Self::with_shape(DType::F32, shape);
        t.storage = Storage::Host(bytemuck::cast_slice(data).to_vec());
        t.reserved_elems = numel;
        t
    }

    /// A 1-D int32-parameter tensor carrying control values for dispatch.
    ///
    /// Parameter tensors stay host-resident through any device transfer.
    #[must_use]
    pub fn int32_params(values: &[i32]) -> Self {
        let mut t = Self::with_shape(DType::I32Param, &[values.len()]);
        t.storage = Storage::Host(bytemuck::cast_slice(values).to_vec());
        t.reserved_elems = values.len();
        t
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Logical element count; zero for a shapeless tensor.
    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    /// Strided element count from axis `i` outward.
    ///
    /// `count(0)` covers the whole strided extent including any envelope
    /// padding; `count(i)` for `i >= 1` is the pitch between consecutive
    /// indices along axis `i - 1`.
    #[must_use]
    pub fn count(&self, i: usize) -> usize {
        if i >= self.shape.len() {
            return 1;
        }
        if i >= 1 {
            return self.strides[i - 1];
        }
        self.shape[0] * self.strides[0]
    }

    /// Bytes spanned by the logical strided extent.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.dtype.bytes_for(self.count(0))
        }
    }

    /// Element capacity of the current buffer, envelope included.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.reserved_elems
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.dtype.bytes_for(self.reserved_elems)
    }

    /// The reservation envelope, if one is active.
    #[must_use]
    pub fn reserved_shape(&self) -> Option<&[usize]> {
        self.reserved.as_deref()
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        !matches!(self.storage, Storage::Empty)
    }

    #[must_use]
    pub fn device(&self) -> DeviceKind {
        match self.storage {
            Storage::Accel(_) => DeviceKind::Accel,
            Storage::Empty | Storage::Host(_) => DeviceKind::Host,
        }
    }

    /// Replace the logical shape.
    ///
    /// Without a reservation, strides become row-major suffix products.
    /// With one, strides come from the larger of logical and reserved
    /// extents per axis, so content inside the envelope keeps its offsets.
    ///
    /// # Errors
    /// Fails when a reservation is active and the new rank differs.
    pub fn resize(&mut self, dims: &[usize]) -> Result<()> {
        match &self.reserved {
            None => {
                self.shape = dims.to_vec();
                self.strides = compact_strides(dims);
            }
            Some(env) => {
                if env.len() != dims.len() {
                    return Err(Error::ShapeMismatch {
                        expected: env.clone(),
                        got: dims.to_vec(),
                    });
                }
                self.shape = dims.to_vec();
                let mut strides = vec![1; dims.len()];
                for i in (0..dims.len().saturating_sub(1)).rev() {
                    strides[i] = dims[i + 1].max(env[i + 1]) * strides[i + 1];
                }
                self.strides = strides;
            }
        }
        Ok(())
    }

    /// Replace the shape, inferring at most one `-1` extent from the
    /// element count.
    ///
    /// # Errors
    /// Fails on more than one `-1`, a non-divisible element count, or a
    /// shape whose product differs from the current one.
    pub fn reshape(&mut self, dims: &[i64]) -> Result<()> {
        let old: usize = self.shape.iter().product();
        let mut infer = None;
        let mut mul: usize = 1;
        for (i, &d) in dims.iter().enumerate() {
            if d < 0 {
                if infer.is_some() {
                    return Err(Error::InvalidShape(format!(
                        "reshape allows one inferred extent, got {dims:?}"
                    )));
                }
                infer = Some(i);
            } else {
                mul = mul.saturating_mul(d as usize);
            }
        }
        let mut out: Vec<usize> = dims
            .iter()
            .map(|&d| if d < 0 { 0 } else { d as usize })
            .collect();
        if let Some(i) = infer {
            if mul == 0 || old % mul != 0 {
                return Err(Error::InvalidShape(format!(
                    "cannot infer extent {i} of {dims:?}: {old} elements not divisible by {mul}"
                )));
            }
            out[i] = old / mul;
        } else if mul != old {
            return Err(Error::InvalidShape(format!(
                "reshape {:?} -> {out:?} changes the element count",
                self.shape
            )));
        }
        self.resize(&out)
    }

    /// Materialize a buffer for the current shape, reusing the existing
    /// allocation when its capacity already suffices.
    ///
    /// Growing past the reserved capacity discards existing content.
    ///
    /// # Errors
    /// Fails when an accelerator allocation fails.
    pub fn allocate(&mut self) -> Result<()> {
        if self.count(0) <= self.reserved_elems && self.is_allocated() {
            return Ok(());
        }
        if let Some(env) = &mut self.reserved {
            for (e, &d) in env.iter_mut().zip(&self.shape) {
                *e = (*e).max(d);
            }
            let env = env.clone();
            let shape = self.shape.clone();
            self.resize(&shape)?;
            self.reserved_elems = env[0] * self.strides[0];
        } else {
            self.reserved_elems = self.count(0);
        }
        let bytes = self.capacity_bytes();
        self.storage = match &self.storage {
            Storage::Accel(buf) => Storage::Accel(buf.alloc_like(bytes)?),
            Storage::Empty | Storage::Host(_) => Storage::Host(vec![0; bytes]),
        };
        Ok(())
    }

    /// Allocate and fill every logical element with `value`.
    ///
    /// # Errors
    /// Fails unless the tensor is an f32 or f16 kind resident on the host.
    pub fn allocate_filled(&mut self, value: f32) -> Result<()> {
        if self.dtype != DType::F32 && self.dtype != DType::F16 {
            return Err(Error::DtypeMismatch {
                expected: "f32 or f16".into(),
                got: self.dtype.to_string(),
            });
        }
        self.allocate()?;
        let len = self.byte_size();
        match &mut self.storage {
            Storage::Host(bytes) => {
                if self.dtype == DType::F32 {
                    let floats: &mut [f32] = bytemuck::cast_slice_mut(&mut bytes[..len]);
                    floats.fill(value);
                } else {
                    let halves: &mut [half::f16] = bytemuck::cast_slice_mut(&mut bytes[..len]);
                    halves.fill(half::f16::from_f32(value));
                }
                Ok(())
            }
            Storage::Accel(_) | Storage::Empty => {
                Err(Error::Backend("fill requires host residency".into()))
            }
        }
    }

    /// Establish or grow the reservation envelope.
    ///
    /// On a shapeless tensor this sets the logical shape to `dims` and
    /// allocates immediately. Otherwise `dims` must match the rank, each
    /// extent being `-1` (unchanged) or at least the logical extent;
    /// content is copied slice by slice into the re-strided buffer. The
    /// envelope only grows, and only one axis may grow per call.
    ///
    /// # Errors
    /// Fails on rank mismatch, an extent below the logical shape, growth
    /// along more than one axis, a sub-byte element kind, or a shape that
    /// has outgrown its buffer.
    pub fn reserve(&mut self, dims: &[i64]) -> Result<()> {
        if self.dtype.unit_size_div() > 1 {
            return Err(Error::UnsupportedDtype(format!(
                "cannot reserve {} data",
                self.dtype
            )));
        }
        if self.shape.is_empty() {
            let shape: Vec<usize> = dims
                .iter()
                .map(|&d| {
                    usize::try_from(d).map_err(|_| {
                        Error::InvalidShape(format!(
                            "reservation on a shapeless tensor needs explicit extents, got {dims:?}"
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            self.shape = shape;
            self.strides = compact_strides(&self.shape);
            self.reserved = Some(self.shape.clone());
            self.reserved_elems = self.count(0);
            self.storage = Storage::Host(vec![0; self.capacity_bytes()]);
            return Ok(());
        }

        if dims.len() != self.shape.len() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: dims.iter().map(|&d| d.max(0) as usize).collect(),
            });
        }
        let old_env: Vec<usize> = self
            .reserved
            .clone()
            .unwrap_or_else(|| self.shape.clone());
        let mut env = Vec::with_capacity(dims.len());
        for (i, &d) in dims.iter().enumerate() {
            let target = if d == -1 {
                old_env[i]
            } else if d < 0 {
                return Err(Error::InvalidShape(format!(
                    "reserved extent {d} on axis {i} is not -1 or a size"
                )));
            } else {
                let d = d as usize;
                if d < self.shape[i] {
                    return Err(Error::InvalidShape(format!(
                        "reserved extent {d} on axis {i} is below the logical extent {}",
                        self.shape[i]
                    )));
                }
                d
            };
            env.push(target.max(old_env[i]));
        }

        let growth: Vec<usize> = (0..env.len()).filter(|&i| env[i] > old_env[i]).collect();
        let axis = match growth.as_slice() {
            [] => {
                self.reserved = Some(env);
                if !self.is_allocated() {
                    self.reserved_elems = self.count(0);
                    self.storage = Storage::Host(vec![0; self.capacity_bytes()]);
                }
                return Ok(());
            }
            [axis] => *axis,
            _ => {
                return Err(Error::InvalidShape(format!(
                    "reservation may grow along one axis, got {old_env:?} -> {env:?}"
                )))
            }
        };

        let old_bytes = self.byte_size();
        let old_pitch = self.count(axis);
        let unit = self.dtype.unit_size();

        let mut strides = vec![1; env.len()];
        for i in (0..env.len().saturating_sub(1)).rev() {
            strides[i] = self.shape[i + 1].max(env[i + 1]) * strides[i + 1];
        }
        self.strides = strides;
        self.reserved_elems = self.shape[0].max(env[0]) * self.strides[0];
        self.reserved = Some(env);

        let new_bytes = self.capacity_bytes();
        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Empty => {
                self.storage = Storage::Host(vec![0; new_bytes]);
            }
            Storage::Host(old) => {
                if old.len() < old_bytes {
                    return Err(Error::InvalidShape(format!(
                        "shape {:?} outgrew its {}-byte buffer",
                        self.shape,
                        old.len()
                    )));
                }
                let mut fresh = vec![0u8; new_bytes];
                let outer = self.count(0) / self.count(axis);
                let dst_pitch = self.count(axis) * unit;
                let src_pitch = old_pitch * unit;
                let width = self.shape[axis] * self.strides[axis] * unit;
                for o in 0..outer {
                    let s = o * src_pitch;
                    let d = o * dst_pitch;
                    fresh[d..d + width].copy_from_slice(&old[s..s + width]);
                }
                self.storage = Storage::Host(fresh);
            }
            Storage::Accel(old) => {
                if old.len() < old_bytes {
                    return Err(Error::InvalidShape(format!(
                        "shape {:?} outgrew its {}-byte buffer",
                        self.shape,
                        old.len()
                    )));
                }
                let mut fresh = old.alloc_like(new_bytes)?;
                let outer = self.count(0) / self.count(axis);
                fresh.copy_strided_from(
                    old.as_ref(),
                    self.count(axis) * unit,
                    old_pitch * unit,
                    self.shape[axis] * self.strides[axis] * unit,
                    outer,
                )?;
                self.storage = Storage::Accel(fresh);
            }
        }
        Ok(())
    }

    /// Adopt `other`'s kind, shape, and bytes.
    ///
    /// # Errors
    /// Fails unless both tensors are host-resident and the source layout
    /// is compact.
    pub fn copy_from(&mut self, other: &Tensor) -> Result<()> {
        if other.shape.is_empty() {
            self.dtype = other.dtype;
            self.shape.clear();
            self.strides.clear();
            self.reserved = None;
            self.reserved_elems = 0;
            self.storage = Storage::Empty;
            return Ok(());
        }
        if other.strides != compact_strides(&other.shape) {
            return Err(Error::InvalidShape(
                "copy source must have a compact layout".into(),
            ));
        }
        let src = other.host_bytes()?;
        if self.dtype != other.dtype || self.shape != other.shape || !self.is_allocated() {
            self.dtype = other.dtype;
            self.reserved = None;
            self.reserved_elems = 0;
            self.storage = Storage::Empty;
            self.resize(&other.shape)?;
            self.allocate()?;
        }
        let len = src.len();
        self.host_bytes_mut()?[..len].copy_from_slice(src);
        Ok(())
    }

    /// Move the buffer to `target`, freeing the source allocation.
    ///
    /// Int32-parameter tensors never move.
    ///
    /// # Errors
    /// Fails when the transfer or target allocation fails.
    pub fn to_device(&mut self, target: DeviceKind, backend: &dyn DeviceBackend) -> Result<()> {
        match target {
            DeviceKind::Host => self.to_host(),
            DeviceKind::Accel => self.to_accel(backend),
        }
    }

    /// Move accelerator-resident bytes back to host memory.
    ///
    /// # Errors
    /// Fails when the download fails.
    pub fn to_host(&mut self) -> Result<()> {
        if self.dtype == DType::I32Param {
            return Ok(());
        }
        if let Storage::Accel(buf) = &self.storage {
            let mut bytes = vec![0u8; buf.len()];
            buf.download(0, &mut bytes)?;
            self.storage = Storage::Host(bytes);
        }
        Ok(())
    }

    /// Move host-resident bytes onto `backend`'s device.
    ///
    /// # Errors
    /// Fails when the upload fails.
    pub fn to_accel(&mut self, backend: &dyn DeviceBackend) -> Result<()> {
        if self.dtype == DType::I32Param {
            return Ok(());
        }
        if let Storage::Host(bytes) = &self.storage {
            let buf = backend.upload(bytes)?;
            self.storage = Storage::Accel(buf);
        }
        Ok(())
    }

    /// The logical bytes of a host-resident buffer.
    ///
    /// # Errors
    /// Fails when the tensor is unallocated, deferred, or resident on an
    /// accelerator.
    pub fn host_bytes(&self) -> Result<&[u8]> {
        match &self.storage {
            Storage::Host(bytes) => {
                let len = self.byte_size();
                if bytes.len() < len {
                    return Err(Error::InvalidShape(format!(
                        "shape {:?} outgrew its {}-byte buffer",
                        self.shape,
                        bytes.len()
                    )));
                }
                Ok(&bytes[..len])
            }
            Storage::Accel(_) => Err(Error::Backend(
                "tensor is resident on an accelerator; move it to host first".into(),
            )),
            Storage::Empty => Err(self.unallocated_error()),
        }
    }

    /// Mutable access to the logical bytes of a host-resident buffer.
    ///
    /// # Errors
    /// Same conditions as [`host_bytes`](Self::host_bytes).
    pub fn host_bytes_mut(&mut self) -> Result<&mut [u8]> {
        // Rejected before the match: the Host arm returns a borrow of
        // `self.storage`, which stays live across the other arms.
        if matches!(self.storage, Storage::Empty) {
            return Err(self.unallocated_error());
        }
        let len = self.byte_size();
        match &mut self.storage {
            Storage::Host(bytes) => {
                if bytes.len() < len {
                    return Err(Error::InvalidShape(format!(
                        "shape {:?} outgrew its {}-byte buffer",
                        self.shape,
                        bytes.len()
                    )));
                }
                Ok(&mut bytes[..len])
            }
            Storage::Accel(_) | Storage::Empty => Err(Error::Backend(
                "tensor is resident on an accelerator; move it to host first".into(),
            )),
        }
    }

    fn unallocated_error(&self) -> Error {
        if self.deferred.is_some() {
            Error::Other("deferred tensor must be materialized before use".into())
        } else {
            Error::Other("tensor has no buffer; allocate it first".into())
        }
    }

    fn check_dtype(&self, expected: DType) -> Result<()> {
        if self.dtype == expected {
            Ok(())
        } else {
            Err(Error::DtypeMismatch {
                expected: expected.to_string(),
                got: self.dtype.to_string(),
            })
        }
    }

    /// View the buffer as f32 values.
    ///
    /// # Errors
    /// Fails on a kind other than f32 or a buffer that is not host-resident.
    pub fn as_f32(&self) -> Result<&[f32]> {
        self.check_dtype(DType::F32)?;
        Ok(bytemuck::cast_slice(self.host_bytes()?))
    }

    /// Mutable f32 view of the buffer.
    ///
    /// # Errors
    /// Same conditions as [`as_f32`](Self::as_f32).
    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        self.check_dtype(DType::F32)?;
        Ok(bytemuck::cast_slice_mut(self.host_bytes_mut()?))
    }

    /// View an int32-parameter buffer.
    ///
    /// # Errors
    /// Fails on non-parameter kinds.
    pub fn as_i32(&self) -> Result<&[i32]> {
        self.check_dtype(DType::I32Param)?;
        Ok(bytemuck::cast_slice(self.host_bytes()?))
    }

    /// View the buffer as IEEE half-precision values.
    ///
    /// # Errors
    /// Fails on a kind other than f16.
    pub fn as_f16(&self) -> Result<&[half::f16]> {
        self.check_dtype(DType::F16)?;
        Ok(bytemuck::cast_slice(self.host_bytes()?))
    }

    /// View the buffer as bfloat16 values.
    ///
    /// # Errors
    /// Fails on a kind other than bf16.
    pub fn as_bf16(&self) -> Result<&[half::bf16]> {
        self.check_dtype(DType::BF16)?;
        Ok(bytemuck::cast_slice(self.host_bytes()?))
    }

    /// Widening float read of buffer element `i` for f32, f16 and bf16
    /// tensors. Diagnostic only; the index is a raw buffer position, so
    /// under a reservation it can land in envelope padding.
    ///
    /// # Errors
    /// Fails off-host, out of bounds, or for non-float kinds.
    pub fn float_at(&self, i: usize) -> Result<f32> {
        let oob = || Error::InvalidShape(format!("element {i} is out of bounds"));
        match self.dtype {
            DType::F32 => {
                let values: &[f32] = bytemuck::cast_slice(self.host_bytes()?);
                values.get(i).copied().ok_or_else(oob)
            }
            DType::F16 => {
                let values: &[half::f16] = bytemuck::cast_slice(self.host_bytes()?);
                values.get(i).map(|v| v.to_f32()).ok_or_else(oob)
            }
            DType::BF16 => {
                let values: &[half::bf16] = bytemuck::cast_slice(self.host_bytes()?);
                values.get(i).map(|v| v.to_f32()).ok_or_else(oob)
            }
            other => Err(Error::UnsupportedDtype(format!(
                "float_at on {other} tensor"
            ))),
        }
    }

    /// Shape rendered as `[d0, d1, ...]`.
    #[must_use]
    pub fn shape_string(&self) -> String {
        format!("{:?}", self.shape)
    }

    /// Bounded value dump: each innermost row shows at most `limit`
    /// leading and `limit` trailing elements.
    ///
    /// # Errors
    /// Fails off-host or on a kind other than f32.
    pub fn preview(&self, limit: usize) -> Result<String> {
        use std::fmt::Write as _;

        let values = self.as_f32()?;
        let m = *self
            .shape
            .last()
            .ok_or_else(|| Error::InvalidShape("cannot preview a shapeless tensor".into()))?;
        let mut out = format!("shape {:?}\n", self.shape);
        if m == 0 {
            return Ok(out);
        }
        let rows = self.numel() / m;
        let mut index = vec![0usize; self.shape.len() - 1];
        for _ in 0..rows {
            let base: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            let row = &values[base..base + m];
            if m <= 2 * limit {
                for v in row {
                    let _ = write!(out, "{v} ");
                }
            } else {
                for v in &row[..limit] {
                    let _ = write!(out, "{v} ");
                }
                out.push_str("... ");
                for v in &row[m - limit..] {
                    let _ = write!(out, "{v} ");
                }
            }
            out.push('\n');
            for axis in (0..index.len()).rev() {
                index[axis] += 1;
                if index[axis] < self.shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Ok(out)
    }

    /// Attach per-channel quantization parameters.
    pub fn set_quantization(&mut self, axis: i32, configs: Vec<QuantConfig>) {
        self.quant_axis = axis;
        self.quant = configs;
        self.code_sums.clear();
    }

    /// Quantization axis; `-1` means whole-tensor parameters.
    #[must_use]
    pub fn quant_axis(&self) -> i32 {
        self.quant_axis
    }

    #[must_use]
    pub fn quant_configs(&self) -> &[QuantConfig] {
        &self.quant
    }

    /// Cache the per-row sums of quantized codes.
    ///
    /// Matmul kernels fold these into the zero-point correction term.
    /// Computed once; later calls return immediately.
    ///
    /// # Errors
    /// Fails unless the tensor is a host-resident rank-2 int8 or int4
    /// weight.
    pub fn calc_code_sums(&mut self) -> Result<()> {
        if !self.code_sums.is_empty() {
            return Ok(());
        }
        if self.shape.len() != 2 {
            return Err(Error::InvalidShape(format!(
                "code sums need a rank-2 weight, got {:?}",
                self.shape
            )));
        }
        let (n, m) = (self.shape[0], self.shape[1]);
        let mut sums = vec![0i64; n];
        match self.dtype {
            DType::I8 => {
                let bytes = self.host_bytes()?;
                for (i, sum) in sums.iter_mut().enumerate() {
                    *sum = bytes[i * m..(i + 1) * m].iter().map(|&b| i64::from(b)).sum();
                }
            }
            DType::I4 => {
                let bytes = self.host_bytes()?;
                for (i, sum) in sums.iter_mut().enumerate() {
                    for j in 0..m {
                        let e = i * m + j;
                        let b = bytes[e / 2];
                        let code = if e % 2 == 0 { b >> 4 } else { b & 0xF };
                        *sum += i64::from(code);
                    }
                }
            }
            other => {
                return Err(Error::UnsupportedDtype(format!(
                    "code sums apply to int8 and int4 weights, got {other}"
                )))
            }
        }
        self.code_sums = sums;
        Ok(())
    }

    /// Per-row code sums; empty until [`calc_code_sums`](Self::calc_code_sums) ran.
    #[must_use]
    pub fn code_sums(&self) -> &[i64] {
        &self.code_sums
    }

    #[must_use]
    pub fn deferred(&self) -> Option<&DeferredSource> {
        self.deferred.as_ref()
    }

    pub(crate) fn set_deferred(&mut self, source: Option<DeferredSource>) {
        self.deferred = source;
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device())
            .field("kind", &self.weight_kind)
            .finish_non_exhaustive()
    }
}
