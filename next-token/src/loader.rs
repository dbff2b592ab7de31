use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::checkpoint::{self, Qwen2Model};
use crate::error::{Error, Result};
use crate::model::{LanguageModel, ModelArgs, Transformer};
use crate::predictor::Predictor;
use crate::tokenizer::{HfTokenizer, TextTokenizer, VocabTokenizer};
use crate::weights::{self, Precision};

pub const CONFIG_FILE: &str = "config.json";
pub const HF_TOKENIZER_FILE: &str = "tokenizer.json";
pub const VOCAB_FILE: &str = "vocab.txt";

/// Load status reported per asset file.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Initiate { file: String },
    Progress { file: String, loaded: u64, total: u64, percent: f64 },
    Done { file: String },
    Ready,
}

fn percent(loaded: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        loaded as f64 * 100.0 / total as f64
    }
}

/// Last known progress per asset, rendered sorted by file name.
#[derive(Debug, Default)]
pub struct LoadProgress {
    files: BTreeMap<String, f64>,
}

impl LoadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event`; returns true when the rendered status changed.
    pub fn update(&mut self, event: &ProgressEvent) -> bool {
        match event {
            ProgressEvent::Progress { file, percent, .. } => {
                let shown = percent.floor();
                let previous = self.files.insert(file.clone(), shown);
                previous != Some(shown)
            }
            _ => false,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Now loading...\n");
        for (file, pct) in &self.files {
            out.push_str(&format!("{file} {pct}%\n"));
        }
        out
    }

    /// Final status once every asset has loaded.
    pub fn finish(&self) -> String {
        self.render() + "Done."
    }
}

/// Where and how to load a model from.
#[derive(Clone, Debug)]
pub struct ModelLoader {
    dir: PathBuf,
    precision: Precision,
}

impl ModelLoader {
    pub fn new(dir: impl Into<PathBuf>, precision: Precision) -> Self {
        Self { dir: dir.into(), precision }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn asset(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::MissingAsset(path))
        }
    }

    fn read_small(&self, name: &str, on_progress: &mut dyn FnMut(ProgressEvent)) -> Result<(PathBuf, Vec<u8>)> {
        let path = self.asset(name)?;
        on_progress(ProgressEvent::Initiate { file: name.to_string() });
        let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        let total = bytes.len() as u64;
        on_progress(ProgressEvent::Progress { file: name.to_string(), loaded: total, total, percent: 100.0 });
        on_progress(ProgressEvent::Done { file: name.to_string() });
        Ok((path, bytes))
    }

    /// Prefers `tokenizer.json`, falling back to `vocab.txt`. A safetensors
    /// checkpoint always needs `tokenizer.json`.
    pub fn load_tokenizer(&self, on_progress: &mut dyn FnMut(ProgressEvent)) -> Result<Arc<dyn TextTokenizer>> {
        if self.dir.join(HF_TOKENIZER_FILE).is_file() || checkpoint::checkpoint_files(&self.dir)?.is_some() {
            let (_, bytes) = self.read_small(HF_TOKENIZER_FILE, on_progress)?;
            return Ok(Arc::new(HfTokenizer::from_bytes(&bytes)?));
        }
        let (path, bytes) = self.read_small(VOCAB_FILE, on_progress)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::Tokenizer(format!("{}: {e}", path.display())))?;
        Ok(Arc::new(VocabTokenizer::from_vocab_text(&text)))
    }

    /// Loads a safetensors checkpoint when the directory has one, otherwise
    /// the demo weight file for the configured precision.
    pub fn load_model(&self, on_progress: &mut dyn FnMut(ProgressEvent)) -> Result<Arc<dyn LanguageModel>> {
        match checkpoint::checkpoint_files(&self.dir)? {
            Some(files) => self.load_checkpoint(&files, on_progress),
            None => self.load_weight_file(on_progress),
        }
    }

    fn load_checkpoint(&self, files: &[PathBuf], on_progress: &mut dyn FnMut(ProgressEvent)) -> Result<Arc<dyn LanguageModel>> {
        if self.precision != Precision::F32 {
            warn!(precision = %self.precision, "checkpoints are always loaded as f32");
        }
        let (_, config) = self.read_small(CONFIG_FILE, on_progress)?;

        let mut shards = Vec::with_capacity(files.len());
        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::MissingAsset(path.clone()))?;
            let total = fs::metadata(path).map_err(|_| Error::MissingAsset(path.clone()))?.len();
            on_progress(ProgressEvent::Initiate { file: name.clone() });
            shards.push((name, total));
        }
        let model = Qwen2Model::load(&config, files)?;
        for (file, total) in shards {
            on_progress(ProgressEvent::Progress { file: file.clone(), loaded: total, total, percent: 100.0 });
            on_progress(ProgressEvent::Done { file });
        }
        Ok(Arc::new(model))
    }

    fn load_weight_file(&self, on_progress: &mut dyn FnMut(ProgressEvent)) -> Result<Arc<dyn LanguageModel>> {
        let (_, config) = self.read_small(CONFIG_FILE, on_progress)?;
        let args: ModelArgs = serde_json::from_slice(&config)?;
        args.validate()?;

        let name = self.precision.weight_file();
        let path = self.asset(name)?;
        on_progress(ProgressEvent::Initiate { file: name.to_string() });
        let mut store = weights::load_mmap(&path, |read, total| {
            let (loaded, total) = (read as u64, total as u64);
            on_progress(ProgressEvent::Progress {
                file: name.to_string(),
                loaded,
                total,
                percent: percent(loaded, total),
            });
        })?;
        on_progress(ProgressEvent::Done { file: name.to_string() });

        info!(tensors = store.len(), precision = %self.precision, "decoded weights");
        Ok(Arc::new(Transformer::from_store(args, &mut store)?))
    }

    /// Loads tokenizer then model and wraps them in a predictor.
    pub fn load(&self, mut on_progress: impl FnMut(ProgressEvent)) -> Result<Predictor> {
        info!(dir = %self.dir.display(), precision = %self.precision, "loading model");
        let tokenizer = self.load_tokenizer(&mut on_progress)?;
        let model = self.load_model(&mut on_progress)?;
        if tokenizer.vocab_size() > model.vocab_size() {
            return Err(Error::InvalidWeights(format!(
                "tokenizer has {} tokens but the model only {}",
                tokenizer.vocab_size(),
                model.vocab_size()
            )));
        }
        on_progress(ProgressEvent::Ready);
        info!(vocab = model.vocab_size(), "model ready");
        Ok(Predictor::new(tokenizer, model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(file: &str, pct: f64) -> ProgressEvent {
        ProgressEvent::Progress { file: file.to_string(), loaded: 0, total: 0, percent: pct }
    }

    #[test]
    fn renders_sorted_by_file() {
        let mut p = LoadProgress::new();
        p.update(&progress("model.bin", 40.0));
        p.update(&progress("config.json", 100.0));
        assert_eq!(p.render(), "Now loading...\nconfig.json 100%\nmodel.bin 40%\n");
    }

    #[test]
    fn later_progress_replaces_earlier() {
        let mut p = LoadProgress::new();
        assert!(p.update(&progress("model.bin", 10.0)));
        assert!(!p.update(&progress("model.bin", 10.7)));
        assert!(p.update(&progress("model.bin", 55.2)));
        assert_eq!(p.finish(), "Now loading...\nmodel.bin 55%\nDone.");
    }

    #[test]
    fn non_progress_events_are_ignored() {
        let mut p = LoadProgress::new();
        assert!(!p.update(&ProgressEvent::Initiate { file: "vocab.txt".into() }));
        assert!(!p.update(&ProgressEvent::Ready));
        assert_eq!(p.render(), "Now loading...\n");
    }

    #[test]
    fn zero_total_counts_as_complete() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
