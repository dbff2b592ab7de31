use std::sync::Arc;

use ndarray::s;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::probs::{rank, softmax, TokenProbability, DEFAULT_TOP_K};
use crate::tokenizer::TextTokenizer;

/// Loaded tokenizer and model, read-only for the rest of the session.
#[derive(Clone)]
pub struct Predictor {
    tokenizer: Arc<dyn TextTokenizer>,
    model: Arc<dyn LanguageModel>,
    top_k: usize,
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor").field("top_k", &self.top_k).finish_non_exhaustive()
    }
}

impl Predictor {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>, model: Arc<dyn LanguageModel>) -> Self {
        Self { tokenizer, model, top_k: DEFAULT_TOP_K }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    /// Ranks the most likely next tokens after `text`.
    ///
    /// The text is tokenized as a literal prefix; only the trailing
    /// `max_seq_len` tokens reach the model.
    pub fn predict(&self, text: &str) -> Result<Vec<TokenProbability>> {
        if text.is_empty() {
            return Err(Error::EmptyInput);
        }
        let ids = self.tokenizer.encode(text, false)?;
        if ids.is_empty() {
            return Err(Error::EmptyInput);
        }
        let window = &ids[ids.len().saturating_sub(self.model.max_seq_len())..];

        let logits = self.model.forward(window)?;
        let last = logits
            .shape()
            .get(1)
            .and_then(|seq| seq.checked_sub(1))
            .ok_or_else(|| Error::InvalidWeights(format!("model returned logits of shape {:?}", logits.shape())))?;
        let last_logits: Vec<f32> = logits.slice(s![0, last, ..]).to_vec();
        debug!(tokens = ids.len(), fed = window.len(), vocab = last_logits.len(), "forward pass");

        let probs = softmax(&last_logits);
        rank(&probs, self.top_k)
            .into_iter()
            .map(|(token_id, probability)| {
                let text = self.tokenizer.decode(&[token_id], true)?;
                Ok(TokenProbability { token_id, text, probability })
            })
            .collect()
    }
}
