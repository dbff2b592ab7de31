use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while loading or running a model.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing model asset: {0}")]
    MissingAsset(PathBuf),

    #[error("Invalid model config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid weight file: {0}")]
    InvalidWeights(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Token id {id} is outside the vocabulary (size {vocab_size})")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    #[error("Checkpoint error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Hub download failed: {0}")]
    Hub(String),

    #[error("Model state was poisoned by an earlier panic")]
    Poisoned,

    #[error("Input text produced no tokens")]
    EmptyInput,

    #[error("Model is not loaded yet")]
    NotReady,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
