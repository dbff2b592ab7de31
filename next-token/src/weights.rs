//! Weight file container.
//!
//! Layout: magic `NTKW`, version, tensor count, then per tensor the name,
//! dtype, rank, dims, an optional q8 scale and the little-endian payload.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use bytemuck::cast_slice;
use memmap2::MmapOptions;
use ndarray::{Array1, Array2, ArrayD, ArrayViewD, IxDyn};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Transformer;
use crate::tokenizer::VocabTokenizer;

const MAGIC: &[u8; 4] = b"NTKW";
const VERSION: u32 = 1;

const DTYPE_F32: u8 = 0;
const DTYPE_Q8: u8 = 1;

/// Numeric precision of the stored weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    F32,
    Q8,
}

impl Precision {
    /// Weight file name inside a model directory.
    pub fn weight_file(self) -> &'static str {
        match self {
            Precision::F32 => "model.bin",
            Precision::Q8 => "model_q8.bin",
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "fp32" => Ok(Precision::F32),
            "q8" | "int8" => Ok(Precision::Q8),
            other => Err(format!("unknown precision '{other}', expected f32 or q8")),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Precision::F32 => "f32",
            Precision::Q8 => "q8",
        })
    }
}

/// Symmetric 8-bit quantization with a single dequantization scale.
pub fn quantize(values: &[f32]) -> (Vec<i8>, f32) {
    let max = values.iter().fold(0.0_f32, |m, &v| m.max(v.abs()));
    let scale = if max == 0.0 { 1.0 } else { 127.0 / max };
    let data = values.iter().map(|&v| (v * scale).round() as i8).collect();
    (data, 1.0 / scale)
}

/// Named tensors decoded from a weight file.
#[derive(Debug, Default)]
pub struct TensorStore {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl TensorStore {
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn remaining(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    fn take(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| Error::InvalidWeights(format!("missing tensor {name}")))?;
        if tensor.shape() != shape {
            return Err(Error::InvalidWeights(format!(
                "tensor {name} has shape {:?}, expected {:?}",
                tensor.shape(),
                shape
            )));
        }
        Ok(tensor)
    }

    pub fn take_matrix(&mut self, name: &str, shape: (usize, usize)) -> Result<Array2<f32>> {
        self.take(name, &[shape.0, shape.1])?
            .into_dimensionality()
            .map_err(|e| Error::InvalidWeights(format!("{name}: {e}")))
    }

    pub fn take_vector(&mut self, name: &str, len: usize) -> Result<Array1<f32>> {
        self.take(name, &[len])?
            .into_dimensionality()
            .map_err(|e| Error::InvalidWeights(format!("{name}: {e}")))
    }
}

/// Bounds-checked cursor over a weight file.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Checks that `count` items of at least `item_len` bytes can still follow.
    fn expect_items(&self, count: usize, item_len: usize, what: &str) -> Result<()> {
        match count.checked_mul(item_len) {
            Some(len) if len <= self.remaining() => Ok(()),
            _ => Err(Error::InvalidWeights(format!(
                "{what} count {count} does not fit in {} remaining bytes",
                self.remaining()
            ))),
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.buf.len()).ok_or_else(|| {
            Error::InvalidWeights(format!("truncated at byte {} (wanted {len} more)", self.pos))
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }
}

/// Decodes a weight container, reporting `(bytes_read, total)` after each tensor.
pub fn decode(buf: &[u8], mut on_tensor: impl FnMut(usize, usize)) -> Result<TensorStore> {
    let mut r = Reader { buf, pos: 0 };
    if r.bytes(4)? != MAGIC {
        return Err(Error::InvalidWeights("bad magic".into()));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(Error::InvalidWeights(format!("unsupported version {version}")));
    }

    let count = r.u32()? as usize;
    // name length, dtype and rank
    r.expect_items(count, 9, "tensor")?;
    let mut store = TensorStore::default();
    for _ in 0..count {
        let name_len = r.u32()? as usize;
        let name = std::str::from_utf8(r.bytes(name_len)?)
            .map_err(|e| Error::InvalidWeights(format!("tensor name: {e}")))?
            .to_string();
        let dtype = r.u8()?;
        let rank = r.u32()? as usize;
        r.expect_items(rank, 4, &format!("tensor {name}: dimension"))?;
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(r.u32()? as usize);
        }
        let numel = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|n| n.checked_mul(4).is_some())
            .ok_or_else(|| Error::InvalidWeights(format!("tensor {name}: dims {dims:?} overflow")))?;

        let data: Vec<f32> = match dtype {
            DTYPE_F32 => r
                .bytes(numel * 4)?
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DTYPE_Q8 => {
                let scale = r.f32()?;
                let raw: &[i8] = cast_slice(r.bytes(numel)?);
                raw.iter().map(|&q| q as f32 * scale).collect()
            }
            other => return Err(Error::InvalidWeights(format!("tensor {name}: unknown dtype {other}"))),
        };
        let tensor = ArrayD::from_shape_vec(IxDyn(&dims), data)
            .map_err(|e| Error::InvalidWeights(format!("tensor {name}: {e}")))?;
        debug!(tensor = %name, shape = ?dims, "decoded tensor");
        store.insert(name, tensor);
        on_tensor(r.pos, buf.len());
    }
    if r.pos != buf.len() {
        return Err(Error::InvalidWeights(format!("{} trailing bytes", buf.len() - r.pos)));
    }
    Ok(store)
}

/// Memory-maps a weight file and decodes it.
pub fn load_mmap(path: &Path, on_tensor: impl FnMut(usize, usize)) -> Result<TensorStore> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    // An empty file cannot be mapped on every platform.
    if file.metadata().map_err(|e| Error::io(path, e))?.len() == 0 {
        return Err(Error::InvalidWeights(format!("{} is empty", path.display())));
    }
    let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|e| Error::io(path, e))?;
    decode(&mmap[..], on_tensor)
}

fn write_tensor<W: Write>(w: &mut W, name: &str, tensor: &ArrayViewD<'_, f32>, precision: Precision) -> std::io::Result<()> {
    w.write_all(&(name.len() as u32).to_le_bytes())?;
    w.write_all(name.as_bytes())?;
    let values: Vec<f32> = tensor.iter().copied().collect();
    // norms stay in f32, only matrices are quantized
    let quantize_this = precision == Precision::Q8 && tensor.ndim() == 2;
    w.write_all(&[if quantize_this { DTYPE_Q8 } else { DTYPE_F32 }])?;
    w.write_all(&(tensor.ndim() as u32).to_le_bytes())?;
    for &d in tensor.shape() {
        w.write_all(&(d as u32).to_le_bytes())?;
    }
    if quantize_this {
        let (data, scale) = quantize(&values);
        w.write_all(&scale.to_le_bytes())?;
        w.write_all(cast_slice(&data))?;
    } else {
        for v in values {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Serializes named tensors into the container format.
pub fn encode<W: Write>(w: &mut W, tensors: &[(String, ArrayViewD<'_, f32>)], precision: Precision) -> std::io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for (name, tensor) in tensors {
        write_tensor(w, name, tensor, precision)?;
    }
    Ok(())
}

/// Writes the weights of `model` at the given precision.
pub fn save_weights(path: &Path, model: &Transformer, precision: Precision) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    encode(&mut w, &model.named_tensors(), precision)
        .and_then(|_| w.flush())
        .map_err(|e| Error::io(path, e))
}

/// Writes a complete model directory: config, vocabulary and both weight files.
pub fn save_model(dir: &Path, model: &Transformer, tokenizer: &VocabTokenizer) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let config_path = dir.join(crate::loader::CONFIG_FILE);
    let config = serde_json::to_string_pretty(&model.args)?;
    fs::write(&config_path, config).map_err(|e| Error::io(&config_path, e))?;

    let vocab_path = dir.join(crate::loader::VOCAB_FILE);
    tokenizer.save(&vocab_path)?;

    for precision in [Precision::F32, Precision::Q8] {
        save_weights(&dir.join(precision.weight_file()), model, precision)?;
    }
    Ok(())
}
