//! Pretrained Qwen2-family checkpoints in Hugging Face layout
//! (`config.json`, `tokenizer.json`, `*.safetensors`), run through candle.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2::{Config, ModelForCausalLM};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use ndarray::Array3;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::loader::{CONFIG_FILE, HF_TOKENIZER_FILE};
use crate::model::{LanguageModel, Logits};

pub const SAFETENSORS_FILE: &str = "model.safetensors";
pub const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

impl SafetensorsIndex {
    /// Shard file names, sorted and deduplicated.
    fn shards(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self.weight_map.values().collect();
        names.into_iter().cloned().collect()
    }
}

/// Safetensors files making up the checkpoint in `dir`, or `None` when the
/// directory holds no checkpoint.
pub fn checkpoint_files(dir: &Path) -> Result<Option<Vec<PathBuf>>> {
    let single = dir.join(SAFETENSORS_FILE);
    if single.is_file() {
        return Ok(Some(vec![single]));
    }
    let index_path = dir.join(SAFETENSORS_INDEX_FILE);
    if !index_path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&index_path).map_err(|e| Error::io(&index_path, e))?;
    let index: SafetensorsIndex = serde_json::from_slice(&bytes)?;
    Ok(Some(index.shards().into_iter().map(|name| dir.join(name)).collect()))
}

fn hub_error(file: &str, e: impl std::fmt::Display) -> Error {
    Error::Hub(format!("{file}: {e}"))
}

/// Downloads (or finds in the local cache) a checkpoint from the Hugging
/// Face hub and returns the snapshot directory holding it.
pub fn fetch(model_id: &str, revision: &str) -> Result<PathBuf> {
    info!(model_id, revision, "fetching checkpoint");
    let api = Api::new().map_err(|e| hub_error(model_id, e))?;
    let repo = api.repo(Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string()));

    let config = repo.get(CONFIG_FILE).map_err(|e| hub_error(CONFIG_FILE, e))?;
    repo.get(HF_TOKENIZER_FILE).map_err(|e| hub_error(HF_TOKENIZER_FILE, e))?;
    match repo.get(SAFETENSORS_INDEX_FILE) {
        Ok(index_path) => {
            let bytes = fs::read(&index_path).map_err(|e| Error::io(&index_path, e))?;
            let index: SafetensorsIndex = serde_json::from_slice(&bytes)?;
            for shard in index.shards() {
                repo.get(&shard).map_err(|e| hub_error(&shard, e))?;
            }
        }
        Err(_) => {
            repo.get(SAFETENSORS_FILE).map_err(|e| hub_error(SAFETENSORS_FILE, e))?;
        }
    }

    config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Hub(format!("{} has no parent directory", config.display())))
}

/// Qwen2 decoder loaded from safetensors.
///
/// The candle model keeps a KV cache, so calls are serialized and the cache
/// is cleared before every prefix.
pub struct Qwen2Model {
    inner: Mutex<ModelForCausalLM>,
    config: Config,
    device: Device,
}

impl Qwen2Model {
    pub fn load(config: &[u8], files: &[PathBuf]) -> Result<Self> {
        let config: Config = serde_json::from_slice(config)?;
        let device = Device::Cpu;
        // The mapped files must not change while the model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, DType::F32, &device)? };
        let model = ModelForCausalLM::new(&config, vb)?;
        info!(
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            vocab = config.vocab_size,
            "loaded qwen2 checkpoint"
        );
        Ok(Self { inner: Mutex::new(model), config, device })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl LanguageModel for Qwen2Model {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_position_embeddings
    }

    /// Only the last position comes back: the logits are `[1, 1, vocab]`.
    fn forward(&self, tokens: &[usize]) -> Result<Logits> {
        let vocab_size = self.vocab_size();
        let ids = tokens
            .iter()
            .map(|&id| match u32::try_from(id) {
                Ok(v) if id < vocab_size => Ok(v),
                _ => Err(Error::TokenOutOfRange { id, vocab_size }),
            })
            .collect::<Result<Vec<u32>>>()?;
        let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;

        let logits = {
            let mut model = self.inner.lock().map_err(|_| Error::Poisoned)?;
            model.clear_kv_cache();
            model.forward(&input, 0)?
        };
        let (batch, seq, vocab) = logits.dims3()?;
        let data = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Array3::from_shape_vec((batch, seq, vocab), data)
            .map_err(|e| Error::InvalidWeights(format!("checkpoint logits: {e}")))
    }
}
