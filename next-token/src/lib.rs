//! Next-token prediction over a locally stored language model.
//!
//! A [`ModelLoader`] reads the tokenizer and weights from a model directory,
//! either a Hugging Face Qwen2 checkpoint or a small demo weight file, and
//! the resulting [`Predictor`] turns a text prefix into the ranked list of
//! most likely next tokens.

pub mod checkpoint;
pub mod error;
pub mod loader;
pub mod model;
pub mod predictor;
pub mod probs;
pub mod tokenizer;
pub mod weights;

pub use checkpoint::Qwen2Model;
pub use error::{Error, Result};
pub use loader::{LoadProgress, ModelLoader, ProgressEvent};
pub use model::{LanguageModel, Logits, ModelArgs, Transformer};
pub use predictor::Predictor;
pub use probs::{TokenProbability, DEFAULT_TOP_K};
pub use tokenizer::{HfTokenizer, TextTokenizer, VocabTokenizer};
pub use weights::Precision;
