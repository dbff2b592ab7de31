use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Text <-> token-id conversion used by the predictor.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<usize>>;

    fn decode(&self, tokens: &[usize], skip_special_tokens: bool) -> Result<String>;

    fn vocab_size(&self) -> usize;
}

const UNK_TOKEN: &str = "<unk>";
const BOS_TOKEN: &str = "<s>";

/// Control tokens understood by [`VocabTokenizer`]. Any other vocabulary
/// entry, `<br>` included, is plain text.
pub const SPECIAL_TOKENS: [&str; 5] = [UNK_TOKEN, BOS_TOKEN, "</s>", "<pad>", "<|endoftext|>"];

fn is_special(token: &str) -> bool {
    SPECIAL_TOKENS.contains(&token)
}

fn unescape(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn escape(token: &str) -> String {
    token
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

/// Greedy longest-match tokenizer over a fixed vocabulary.
///
/// Entries of [`SPECIAL_TOKENS`] are never matched from text and can be
/// dropped on decode.
pub struct VocabTokenizer {
    vocab: HashMap<String, usize>,
    inv_vocab: Vec<String>,
    unk_id: Option<usize>,
    bos_id: Option<usize>,
    max_token_len: usize,
}

impl VocabTokenizer {
    /// Create a tokenizer from a list of tokens; the index is the token id.
    pub fn new(tokens: Vec<String>) -> Self {
        let mut vocab = HashMap::with_capacity(tokens.len());
        for (i, tok) in tokens.iter().enumerate() {
            vocab.entry(tok.clone()).or_insert(i);
        }
        let max_token_len = tokens
            .iter()
            .filter(|t| !is_special(t))
            .map(|t| t.len())
            .max()
            .unwrap_or(0);
        Self {
            unk_id: vocab.get(UNK_TOKEN).copied(),
            bos_id: vocab.get(BOS_TOKEN).copied(),
            vocab,
            inv_vocab: tokens,
            max_token_len,
        }
    }

    /// Reads `vocab.txt`: one token per line, `\n`, `\t`, `\r` and `\\` escaped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::from_vocab_text(&text))
    }

    pub fn from_vocab_text(text: &str) -> Self {
        Self::new(text.lines().map(unescape).collect())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = String::new();
        for tok in &self.inv_vocab {
            text.push_str(&escape(tok));
            text.push('\n');
        }
        fs::write(path, text).map_err(|e| Error::io(path, e))
    }

    /// A small character-plus-words vocabulary used for demo models.
    pub fn demo() -> Self {
        let mut tokens: Vec<String> = ["<unk>", "<s>", "</s>"].iter().map(|s| s.to_string()).collect();
        tokens.extend(
            "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 .,!?;:'\"()-\n"
                .chars()
                .map(String::from),
        );
        let words = [
            "the", "weather", "tomorrow", "is", "where", "i", "live", "future", "of", "japan",
            "because", "taxes", "are", "high", "once", "upon", "a", "time", "there", "was",
            "sunny", "rainy", "cloudy", "city", "town", "bright", "uncertain", "people", "pay",
            "less", "more", "king", "queen", "and", "in", "it", "will", "be", "very",
        ];
        for w in words {
            tokens.push(format!(" {w}"));
            let mut cap = w.to_string();
            if let Some(first) = cap.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            tokens.push(cap);
        }
        Self::new(tokens)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.vocab.contains_key(token)
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.inv_vocab.get(id).map(String::as_str)
    }
}

impl TextTokenizer for VocabTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<usize>> {
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.extend(self.bos_id);
        }

        let mut rest = text;
        while !rest.is_empty() {
            let mut end = rest.len().min(self.max_token_len);
            while !rest.is_char_boundary(end) {
                end -= 1;
            }
            let mut matched = None;
            while end > 0 {
                let candidate = &rest[..end];
                if let Some(&id) = self.vocab.get(candidate).filter(|_| !is_special(candidate)) {
                    matched = Some((id, end));
                    break;
                }
                end -= 1;
                while !rest.is_char_boundary(end) {
                    end -= 1;
                }
            }

            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    rest = &rest[len..];
                }
                None => {
                    let ch_len = rest.chars().next().map_or(1, char::len_utf8);
                    let unk = self.unk_id.ok_or_else(|| {
                        Error::Tokenizer(format!("no token for {:?} and no {UNK_TOKEN}", &rest[..ch_len]))
                    })?;
                    ids.push(unk);
                    rest = &rest[ch_len..];
                }
            }
        }
        Ok(ids)
    }

    fn decode(&self, tokens: &[usize], skip_special_tokens: bool) -> Result<String> {
        let mut out = String::new();
        // ids past the vocabulary (padded model heads) decode to nothing
        for tok in tokens.iter().filter_map(|&id| self.inv_vocab.get(id)) {
            if skip_special_tokens && is_special(tok) {
                continue;
            }
            out.push_str(tok);
        }
        Ok(out)
    }

    fn vocab_size(&self) -> usize {
        self.inv_vocab.len()
    }
}

/// Adapter over a Hugging Face `tokenizer.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<usize>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as usize).collect())
    }

    fn decode(&self, tokens: &[usize], skip_special_tokens: bool) -> Result<String> {
        let ids = tokens
            .iter()
            .map(|&id| {
                u32::try_from(id).map_err(|_| Error::TokenOutOfRange { id, vocab_size: self.vocab_size() })
            })
            .collect::<Result<Vec<u32>>>()?;
        self.inner
            .decode(&ids, skip_special_tokens)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_survive_a_save_cycle() {
        let tokens = vec!["<unk>".to_string(), "\n".to_string(), "a\\b".to_string(), "\t".to_string()];
        let text: String = tokens.iter().map(|t| format!("{}\n", escape(t))).collect();
        let tok = VocabTokenizer::from_vocab_text(&text);
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.token(1), Some("\n"));
        assert_eq!(tok.token(2), Some("a\\b"));
    }

    #[test]
    fn only_known_control_tokens_are_special() {
        assert!(is_special("<s>"));
        assert!(is_special("<|endoftext|>"));
        assert!(!is_special("<br>"));
        assert!(!is_special("<div>"));
        assert!(!is_special(" the"));
    }

    #[test]
    fn demo_vocab_covers_ascii() {
        let tok = VocabTokenizer::demo();
        let ids = tok.encode("The weather tomorrow is sunny.", false).unwrap();
        assert!(!ids.contains(&0));
        assert_eq!(tok.decode(&ids, true).unwrap(), "The weather tomorrow is sunny.");
    }
}
