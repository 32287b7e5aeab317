//! Named tensor store over the versioned little-endian weight format.
//!
//! File layout: an `i32` version, a string-to-string metadata table when the
//! version is 1, the tokenizer vocabulary (one `i32` per byte, then the token
//! id), and the tensor table. Each tensor record is name, rank, dims, a dtype
//! tag, then the payload: raw bytes for the float kinds, or a quantization
//! axis plus per-channel `(min, max)` pairs followed by packed codes for the
//! int8/int4 kinds.
//!
//! Loading memory-maps the file and parses in place. In low-memory mode the
//! payload of a registered embedding is skipped entirely; the tensor records
//! its file position instead and is filled in later by an explicit
//! [`WeightStore::materialize`] call.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::config::EngineConfig;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::quant::QuantConfig;
use crate::tensor::{DeferredSource, Tensor, WeightKind};

use super::reader::Reader;
use super::writer::Writer;

fn index_i32(n: usize) -> Result<i32> {
    i32::try_from(n)
        .map_err(|_| Error::UnsupportedFormat(format!("count {n} exceeds the format's i32 range")))
}

/// A named collection of tensors read from, or written to, one weight file.
///
/// Entries are name-keyed and never removed after load. The store also
/// carries the tokenizer vocabulary and the free-form metadata table so a
/// file round-trips through load and save without outside help.
pub struct WeightStore {
    version: i32,
    metadata: BTreeMap<String, String>,
    vocab: BTreeMap<i32, Vec<u8>>,
    tensors: BTreeMap<String, Tensor>,
    embedding_names: BTreeSet<String>,
    config: EngineConfig,
}

impl WeightStore {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            version: 1,
            metadata: BTreeMap::new(),
            vocab: BTreeMap::new(),
            tensors: BTreeMap::new(),
            embedding_names: BTreeSet::new(),
            config,
        }
    }

    /// Format version read at load time; new stores start at 1.
    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.metadata
    }

    /// Vocabulary table keyed by token id.
    #[must_use]
    pub fn vocab(&self) -> &BTreeMap<i32, Vec<u8>> {
        &self.vocab
    }

    pub fn insert_vocab_entry(&mut self, id: i32, token: Vec<u8>) {
        self.vocab.insert(id, token);
    }

    /// Mark a name as an embedding table.
    ///
    /// Registered names load with `weight_kind` set to embedding, and in
    /// low-memory mode their payloads stay on disk until materialized.
    /// Must be called before [`load_from_file`](Self::load_from_file) for
    /// the deferral to apply.
    pub fn register_embedding(&mut self, name: impl Into<String>) {
        self.embedding_names.insert(name.into());
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// # Errors
    /// Returns [`Error::WeightNotFound`] for an unknown name.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))
    }

    /// # Errors
    /// Returns [`Error::WeightNotFound`] for an unknown name.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Read a weight file into the store.
    ///
    /// # Errors
    /// Fails on IO problems, truncation, an unknown dtype tag, or a
    /// deferred-eligible tensor whose kind has no raw float payload.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let mut r = Reader::new(&mmap);

        self.version = r.read_i32()?;
        if self.version == 1 {
            let entries = r.read_len()?;
            for _ in 0..entries {
                let key = r.read_string()?;
                let value = r.read_string()?;
                self.metadata.insert(key, value);
            }
        }

        let vocab_len = r.read_len()?;
        for _ in 0..vocab_len {
            let char_count = r.read_len()?;
            let mut token = Vec::with_capacity(char_count);
            for _ in 0..char_count {
                // Stored one code point per byte; writers sign-extend, so
                // truncation recovers the raw byte.
                token.push((r.read_i32()? & 0xFF) as u8);
            }
            let id = r.read_i32()?;
            self.vocab.insert(id, token);
        }

        let tensor_count = r.read_len()?;
        for _ in 0..tensor_count {
            let name = r.read_string()?;
            let rank = r.read_len()?;
            let mut shape = Vec::with_capacity(rank);
            for _ in 0..rank {
                shape.push(r.read_len()?);
            }
            let dtype = DType::from_tag(r.read_i32()?)?;
            let mut tensor = Tensor::with_shape(dtype, &shape);
            if self.embedding_names.contains(&name) {
                tensor.weight_kind = WeightKind::Embedding;
            }

            if self.config.low_mem && self.embedding_names.contains(&name) {
                if !matches!(dtype, DType::F32 | DType::BF16 | DType::F16) {
                    return Err(Error::UnsupportedDtype(format!(
                        "deferred tensor {name} must be f32, bf16 or f16, got {dtype}"
                    )));
                }
                tensor.set_deferred(Some(DeferredSource {
                    path: path.to_path_buf(),
                    offset: r.offset() as u64,
                }));
                r.skip(tensor.byte_size())?;
            } else {
                Self::read_payload(&mut r, &name, &mut tensor)?;
            }
            self.tensors.insert(name, tensor);
        }
        Ok(())
    }

    fn read_payload(r: &mut Reader<'_>, name: &str, tensor: &mut Tensor) -> Result<()> {
        match tensor.dtype() {
            DType::F32 | DType::BF16 | DType::F16 => {}
            DType::I8 | DType::I4 => {
                let bit = if tensor.dtype() == DType::I4 { 4 } else { 8 };
                let axis = r.read_i32()?;
                let channels = if axis == -1 {
                    1
                } else {
                    let a = usize::try_from(axis).map_err(|_| {
                        Error::UnsupportedFormat(format!(
                            "tensor {name} has quantization axis {axis}"
                        ))
                    })?;
                    *tensor.shape().get(a).ok_or_else(|| {
                        Error::UnsupportedFormat(format!(
                            "tensor {name} has quantization axis {axis} beyond its rank"
                        ))
                    })?
                };
                let mut configs = Vec::with_capacity(channels);
                for _ in 0..channels {
                    let min = r.read_f32()?;
                    let max = r.read_f32()?;
                    configs.push(QuantConfig::new(min, max, bit));
                }
                tensor.set_quantization(axis, configs);
            }
            other => {
                return Err(Error::UnsupportedDtype(format!(
                    "tensor {name} has unreadable kind {other}"
                )));
            }
        }
        tensor.allocate()?;
        let len = tensor.byte_size();
        let payload = r.take(len)?;
        tensor.host_bytes_mut()?.copy_from_slice(payload);
        Ok(())
    }

    /// Fill in one deferred tensor from its recorded file position.
    ///
    /// A no-op when the tensor is already materialized.
    ///
    /// # Errors
    /// Fails for an unknown name or when the source file no longer covers
    /// the recorded span.
    pub fn materialize(&mut self, name: &str) -> Result<()> {
        let tensor = self
            .tensors
            .get_mut(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))?;
        materialize_tensor(tensor)
    }

    /// Materialize every deferred tensor in the store.
    ///
    /// # Errors
    /// Fails on the first tensor whose source cannot be read.
    pub fn materialize_all(&mut self) -> Result<()> {
        for tensor in self.tensors.values_mut() {
            materialize_tensor(tensor)?;
        }
        Ok(())
    }

    /// Write the store as one weight file at the given bit width.
    ///
    /// `bit` chooses how linear weights are compressed: 16 converts to
    /// fp16, 8 and 4 quantize per output row. Embedding tables narrow to
    /// bf16 by truncation, everything else is written verbatim. Deferred
    /// tensors are materialized and accelerator-resident ones pulled back
    /// to the host first.
    ///
    /// # Errors
    /// Fails for a bit width other than 4, 8 or 16, for tensors the format
    /// cannot represent at the requested width, and on IO problems.
    pub fn save(&mut self, path: impl AsRef<Path>, bit: i32) -> Result<()> {
        if bit != 4 && bit != 8 && bit != 16 {
            return Err(Error::UnsupportedFormat(format!(
                "bit width {bit} (supported: 4, 8, 16)"
            )));
        }
        self.materialize_all()?;

        let file = File::create(path.as_ref())?;
        let mut w = Writer::new(BufWriter::new(file));

        w.write_i32(self.version)?;
        if self.version == 1 {
            w.write_i32(index_i32(self.metadata.len())?)?;
            for (key, value) in &self.metadata {
                w.write_string(key)?;
                w.write_string(value)?;
            }
        }

        w.write_i32(index_i32(self.vocab.len())?)?;
        for (id, token) in &self.vocab {
            w.write_i32(index_i32(token.len())?)?;
            for &b in token {
                // One code point per byte, sign-extended.
                w.write_i32(i32::from(b as i8))?;
            }
            w.write_i32(*id)?;
        }

        let threads = self.config.threads.max(1);
        w.write_i32(index_i32(self.tensors.len())?)?;
        for (name, tensor) in &mut self.tensors {
            tensor.to_host()?;
            if tensor.reserved_shape().is_some() {
                // Reserved buffers carry stride padding the format has no
                // way to express.
                return Err(Error::UnsupportedFormat(format!(
                    "tensor {name} has reserved capacity; compact it before saving"
                )));
            }
            w.write_string(name)?;
            w.write_i32(index_i32(tensor.ndim())?)?;
            for &d in tensor.shape() {
                w.write_i32(index_i32(d)?)?;
            }
            match tensor.weight_kind {
                WeightKind::None => write_plain(&mut w, name, tensor)?,
                WeightKind::Embedding => write_embedding(&mut w, name, tensor)?,
                WeightKind::Linear => write_linear(&mut w, name, tensor, bit, threads)?,
            }
        }
        w.finish()?;
        Ok(())
    }
}

fn materialize_tensor(tensor: &mut Tensor) -> Result<()> {
    let Some(source) = tensor.deferred().cloned() else {
        return Ok(());
    };
    let file = File::open(&source.path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let start = usize::try_from(source.offset).map_err(|_| {
        Error::UnsupportedFormat(format!("deferred offset {} out of range", source.offset))
    })?;
    let len = tensor.byte_size();
    let end = start
        .checked_add(len)
        .filter(|&end| end <= mmap.len())
        .ok_or(Error::Truncated {
            offset: start,
            needed: len,
            remaining: mmap.len().saturating_sub(start),
        })?;
    tensor.allocate()?;
    tensor.host_bytes_mut()?.copy_from_slice(&mmap[start..end]);
    tensor.set_deferred(None);
    Ok(())
}

// ---------------------------------------------------------------------------
// Save payloads
// ---------------------------------------------------------------------------

fn write_plain<W: Write>(w: &mut Writer<W>, name: &str, tensor: &Tensor) -> Result<()> {
    match tensor.dtype() {
        DType::F32 | DType::BF16 | DType::F16 => {
            w.write_i32(tensor.dtype().tag())?;
            w.write_bytes(tensor.host_bytes()?)
        }
        DType::I8 | DType::I4 => write_quantized_verbatim(w, name, tensor),
        other => Err(Error::UnsupportedDtype(format!(
            "cannot persist {other} tensor {name}"
        ))),
    }
}

fn write_embedding<W: Write>(w: &mut Writer<W>, name: &str, tensor: &Tensor) -> Result<()> {
    match tensor.dtype() {
        DType::F32 => {
            // Narrow to bf16 by dropping the low mantissa bits, no rounding.
            w.write_i32(DType::BF16.tag())?;
            let values = tensor.as_f32()?;
            let mut out = Vec::with_capacity(values.len() * 2);
            for &v in values {
                out.extend_from_slice(&((v.to_bits() >> 16) as u16).to_le_bytes());
            }
            w.write_bytes(&out)
        }
        DType::BF16 | DType::F16 => {
            w.write_i32(tensor.dtype().tag())?;
            w.write_bytes(tensor.host_bytes()?)
        }
        other => Err(Error::UnsupportedDtype(format!(
            "embedding tensor {name} is {other}, expected a float kind"
        ))),
    }
}

fn write_linear<W: Write>(
    w: &mut Writer<W>,
    name: &str,
    tensor: &Tensor,
    bit: i32,
    threads: usize,
) -> Result<()> {
    match (tensor.dtype(), bit) {
        (DType::F32, 16) => {
            w.write_i32(DType::F16.tag())?;
            let values = tensor.as_f32()?;
            let mut out = Vec::with_capacity(values.len() * 2);
            for &v in values {
                out.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
            }
            w.write_bytes(&out)
        }
        (DType::F16, 16) => {
            w.write_i32(DType::F16.tag())?;
            w.write_bytes(tensor.host_bytes()?)
        }
        (DType::F32, _) => {
            if tensor.ndim() != 2 {
                return Err(Error::InvalidShape(format!(
                    "linear tensor {name} has rank {}, per-row quantization needs 2",
                    tensor.ndim()
                )));
            }
            let rows = tensor.shape()[0];
            let cols = tensor.shape()[1];
            let (configs, codes) = quantize_rows(tensor.as_f32()?, rows, cols, bit, threads);
            w.write_i32(if bit == 8 { DType::I8.tag() } else { DType::I4.tag() })?;
            w.write_i32(0)?;
            for cfg in &configs {
                w.write_f32(cfg.min)?;
                w.write_f32(cfg.max)?;
            }
            w.write_bytes(&codes)
        }
        (DType::I8, 8) | (DType::I4, 4) => write_quantized_verbatim(w, name, tensor),
        (dtype, _) => Err(Error::UnsupportedFormat(format!(
            "linear tensor {name} is {dtype}, cannot save it at bit width {bit}"
        ))),
    }
}

fn write_quantized_verbatim<W: Write>(
    w: &mut Writer<W>,
    name: &str,
    tensor: &Tensor,
) -> Result<()> {
    let axis = tensor.quant_axis();
    let channels = if axis == -1 {
        1
    } else {
        *tensor
            .shape()
            .get(axis as usize)
            .ok_or_else(|| {
                Error::UnsupportedFormat(format!(
                    "tensor {name} has quantization axis {axis} beyond its rank"
                ))
            })?
    };
    let configs = tensor.quant_configs();
    if configs.len() != channels {
        return Err(Error::UnsupportedFormat(format!(
            "quantized tensor {name} carries {} configs for {channels} channels",
            configs.len()
        )));
    }
    w.write_i32(tensor.dtype().tag())?;
    w.write_i32(axis)?;
    for cfg in configs {
        w.write_f32(cfg.min)?;
        w.write_f32(cfg.max)?;
    }
    w.write_bytes(tensor.host_bytes()?)
}

// ---------------------------------------------------------------------------
// Row quantization pool
// ---------------------------------------------------------------------------

fn packed_bytes_through(rows: usize, cols: usize, bit: i32) -> usize {
    if bit == 4 {
        (rows * cols + 1) / 2
    } else {
        rows * cols
    }
}

/// Quantize a `[rows, cols]` float matrix per row across a worker pool.
///
/// Row ranges are disjoint, so each worker owns its slice of the config
/// and code buffers outright. When int4 rows share bytes (odd `cols`),
/// chunk boundaries are forced onto even rows so no byte straddles two
/// chunks and chunk-local nibble parity equals the absolute parity.
/// Per-row results are independent of the pool size.
fn quantize_rows(
    values: &[f32],
    rows: usize,
    cols: usize,
    bit: i32,
    threads: usize,
) -> (Vec<QuantConfig>, Vec<u8>) {
    let mut configs = vec![QuantConfig::default(); rows];
    let mut codes = vec![0u8; packed_bytes_through(rows, cols, bit)];

    let mut bounds = Vec::with_capacity(threads + 1);
    bounds.push(0);
    let per = rows / threads;
    for i in 1..threads {
        let mut b = i * per;
        if bit == 4 && cols % 2 == 1 {
            b &= !1;
        }
        bounds.push(b);
    }
    bounds.push(rows);

    std::thread::scope(|scope| {
        let mut cfg_rest = configs.as_mut_slice();
        let mut code_rest = codes.as_mut_slice();
        let mut byte_cursor = 0;
        for pair in bounds.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            if end <= start {
                continue;
            }
            let chunk_bytes = packed_bytes_through(end, cols, bit) - byte_cursor;
            let (cfg_chunk, cfg_tail) = cfg_rest.split_at_mut(end - start);
            cfg_rest = cfg_tail;
            let (code_chunk, code_tail) = code_rest.split_at_mut(chunk_bytes);
            code_rest = code_tail;
            let chunk_values = &values[start * cols..end * cols];
            scope.spawn(move || quantize_chunk(chunk_values, cols, bit, cfg_chunk, code_chunk));
            byte_cursor += chunk_bytes;
        }
    });
    (configs, codes)
}

fn quantize_chunk(
    values: &[f32],
    cols: usize,
    bit: i32,
    configs: &mut [QuantConfig],
    codes: &mut [u8],
) {
    for (i, row) in values.chunks_exact(cols).enumerate() {
        let mut min_v = 1e9f32;
        let mut max_v = -1e9f32;
        for &v in row {
            min_v = min_v.min(v);
            max_v = max_v.max(v);
        }
        let cfg = QuantConfig::new(min_v, max_v, bit);
        configs[i] = cfg;
        if bit == 8 {
            for (j, &v) in row.iter().enumerate() {
                codes[i * cols + j] = cfg.quantize(v);
            }
        } else {
            for (j, &v) in row.iter().enumerate() {
                let e = i * cols + j;
                let code = cfg.quantize(v);
                let slot = &mut codes[e / 2];
                if e % 2 == 1 {
                    *slot = (*slot & 0xF0) | code;
                } else {
                    *slot = (*slot & 0x0F) | (code << 4);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_rows_pool_size_invariance() {
        let rows = 5;
        let cols = 3;
        let values: Vec<f32> = (0..rows * cols).map(|i| (i as f32) * 0.21 - 1.3).collect();
        for bit in [4, 8] {
            let (cfg1, codes1) = quantize_rows(&values, rows, cols, bit, 1);
            for threads in [2, 3, 8] {
                let (cfg, codes) = quantize_rows(&values, rows, cols, bit, threads);
                assert_eq!(cfg, cfg1, "bit {bit}, {threads} threads");
                assert_eq!(codes, codes1, "bit {bit}, {threads} threads");
            }
        }
    }

    #[test]
    fn test_quantize_rows_int4_packs_high_nibble_first() {
        // One row of four identical values: every code is the same, so
        // both nibbles of both bytes carry it.
        let (configs, codes) = quantize_rows(&[1.0, 1.0, 1.0, 1.0], 1, 4, 4, 1);
        assert_eq!(configs.len(), 1);
        assert_eq!(codes.len(), 2);
        let code = configs[0].quantize(1.0);
        assert_eq!(codes[0], (code << 4) | code);
        assert_eq!(codes[0], codes[1]);
    }

    #[test]
    fn test_quantize_rows_odd_cols_trailing_nibble() {
        let (_, codes) = quantize_rows(&[0.5, -0.5, 0.25], 1, 3, 4, 4);
        // Three elements pack into two bytes; the last low nibble stays 0.
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[1] & 0x0F, 0);
    }

    #[test]
    fn test_save_rejects_unsupported_bit_width() {
        let mut store = WeightStore::new(EngineConfig::default());
        assert!(matches!(
            store.save("/nonexistent/refused-before-io", 3),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_lookup_errors_name_the_weight() {
        let store = WeightStore::new(EngineConfig::default());
        match store.get("decoder.layers.0.weight") {
            Err(Error::WeightNotFound(name)) => assert_eq!(name, "decoder.layers.0.weight"),
            other => panic!("expected a missing-weight error, got {:?}", other.map(|_| ())),
        }
    }
}
