mod common;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use next_token::{Error, LanguageModel, ModelLoader, Precision, ProgressEvent, Qwen2Model, VocabTokenizer};

const HIDDEN: usize = 16;
const INTERMEDIATE: usize = 32;
const HEADS: usize = 2;
const KV_HEADS: usize = 1;
// wider than the tokenizer, like real checkpoints
const VOCAB: usize = 12;

fn config_json(tie_word_embeddings: bool) -> String {
    format!(
        r#"{{
  "architectures": ["Qwen2ForCausalLM"],
  "hidden_act": "silu",
  "hidden_size": {HIDDEN},
  "intermediate_size": {INTERMEDIATE},
  "max_position_embeddings": 64,
  "max_window_layers": 1,
  "num_attention_heads": {HEADS},
  "num_hidden_layers": 1,
  "num_key_value_heads": {KV_HEADS},
  "rms_norm_eps": 1e-6,
  "rope_theta": 10000.0,
  "sliding_window": 64,
  "tie_word_embeddings": {tie_word_embeddings},
  "use_sliding_window": false,
  "vocab_size": {VOCAB}
}}"#
    )
}

fn write_checkpoint(dir: &Path, tie_word_embeddings: bool) {
    let dev = Device::Cpu;
    let kv = KV_HEADS * HIDDEN / HEADS;
    let random = |shape: &[usize]| Tensor::randn(0f32, 0.1, shape, &dev).unwrap();
    let ones = || Tensor::ones(HIDDEN, DType::F32, &dev).unwrap();

    let mut tensors = HashMap::new();
    tensors.insert("model.embed_tokens.weight".to_string(), random(&[VOCAB, HIDDEN]));
    for (name, shape) in [
        ("self_attn.q_proj.weight", vec![HIDDEN, HIDDEN]),
        ("self_attn.q_proj.bias", vec![HIDDEN]),
        ("self_attn.k_proj.weight", vec![kv, HIDDEN]),
        ("self_attn.k_proj.bias", vec![kv]),
        ("self_attn.v_proj.weight", vec![kv, HIDDEN]),
        ("self_attn.v_proj.bias", vec![kv]),
        ("self_attn.o_proj.weight", vec![HIDDEN, HIDDEN]),
        ("mlp.gate_proj.weight", vec![INTERMEDIATE, HIDDEN]),
        ("mlp.up_proj.weight", vec![INTERMEDIATE, HIDDEN]),
        ("mlp.down_proj.weight", vec![HIDDEN, INTERMEDIATE]),
    ] {
        tensors.insert(format!("model.layers.0.{name}"), random(shape.as_slice()));
    }
    tensors.insert("model.layers.0.input_layernorm.weight".to_string(), ones());
    tensors.insert("model.layers.0.post_attention_layernorm.weight".to_string(), ones());
    tensors.insert("model.norm.weight".to_string(), ones());
    if !tie_word_embeddings {
        tensors.insert("lm_head.weight".to_string(), random(&[VOCAB, HIDDEN]));
    }

    candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
    fs::write(dir.join("config.json"), config_json(tie_word_embeddings)).unwrap();
}

fn checkpoint_dir(tie_word_embeddings: bool) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path(), tie_word_embeddings);
    fs::write(dir.path().join("tokenizer.json"), common::WORD_LEVEL_TOKENIZER).unwrap();
    dir
}

#[test]
fn loads_tied_checkpoint_and_ranks_every_logit() {
    let dir = checkpoint_dir(true);
    let mut events = Vec::new();
    let predictor = ModelLoader::new(dir.path(), Precision::F32).load(|e| events.push(e)).unwrap();

    assert!(events.contains(&ProgressEvent::Done { file: "model.safetensors".into() }));
    assert_eq!(events.last(), Some(&ProgressEvent::Ready));

    let ranked = predictor.predict("once upon a").unwrap();
    assert_eq!(ranked.len(), VOCAB);
    let total: f32 = ranked.iter().map(|c| c.probability).sum();
    assert!((total - 1.0).abs() < 1e-4);
    assert!(ranked.windows(2).all(|w| w[0].probability >= w[1].probability));
    for candidate in ranked.iter().filter(|c| c.token_id >= common::WORD_LEVEL_VOCAB_SIZE) {
        assert_eq!(candidate.text, "");
    }
}

#[test]
fn separate_lm_head_loads() {
    let dir = checkpoint_dir(false);
    let predictor = ModelLoader::new(dir.path(), Precision::F32).load(|_| {}).unwrap();
    assert_eq!(predictor.predict("hello").unwrap().len(), VOCAB);
}

#[test]
fn repeated_predictions_do_not_leak_state() {
    let dir = checkpoint_dir(true);
    let predictor = ModelLoader::new(dir.path(), Precision::F32).load(|_| {}).unwrap();
    let first = predictor.predict("hello world").unwrap();
    predictor.predict("once upon a time").unwrap();
    let again = predictor.predict("hello world").unwrap();
    for (a, b) in first.iter().zip(&again) {
        assert_eq!(a.token_id, b.token_id);
        assert!((a.probability - b.probability).abs() < 1e-6);
    }
}

#[test]
fn checkpoint_logits_cover_the_last_position_only() {
    let dir = checkpoint_dir(true);
    let config = fs::read(dir.path().join("config.json")).unwrap();
    let model = Qwen2Model::load(&config, &[dir.path().join("model.safetensors")]).unwrap();
    assert_eq!(model.vocab_size(), VOCAB);
    assert_eq!(model.max_seq_len(), 64);
    assert_eq!(model.forward(&[4, 5, 6]).unwrap().shape(), &[1, 1, VOCAB]);

    let err = model.forward(&[VOCAB]).unwrap_err();
    assert!(matches!(err, Error::TokenOutOfRange { id: VOCAB, vocab_size: VOCAB }));
}

#[test]
fn checkpoint_needs_tokenizer_json() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path(), true);
    VocabTokenizer::demo().save(&dir.path().join("vocab.txt")).unwrap();
    let err = ModelLoader::new(dir.path(), Precision::F32).load(|_| {}).unwrap_err();
    assert!(matches!(err, Error::MissingAsset(p) if p.ends_with("tokenizer.json")));
}

#[test]
fn q8_request_still_loads_checkpoint() {
    let dir = checkpoint_dir(true);
    let predictor = ModelLoader::new(dir.path(), Precision::Q8).load(|_| {}).unwrap();
    assert!(!predictor.predict("time").unwrap().is_empty());
}
