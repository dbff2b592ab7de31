use next_token::model::{LanguageModel, ModelArgs, Transformer};
use next_token::weights::{self, Precision};
use tempfile::NamedTempFile;

fn small_args() -> ModelArgs {
    ModelArgs {
        max_seq_len: 32,
        vocab_size: 40,
        dim: 16,
        n_layers: 2,
        n_heads: 4,
        hidden_dim: 32,
        ..ModelArgs::default()
    }
}

#[test]
fn test_forward_shapes() {
    let args = small_args();
    let model = Transformer::new(args.clone());
    let tokens = vec![1_usize, 2, 3];
    let logits = model.forward(&tokens).unwrap();
    assert_eq!(logits.shape(), &[1, tokens.len(), args.vocab_size]);
}

#[test]
fn test_saved_weights_reproduce_logits() {
    let model = Transformer::new(small_args());
    let file = NamedTempFile::new().unwrap();
    weights::save_weights(file.path(), &model, Precision::F32).unwrap();

    let mut store = weights::load_mmap(file.path(), |_, _| {}).unwrap();
    let loaded = Transformer::from_store(small_args(), &mut store).unwrap();

    let tokens = [5_usize, 9, 0, 12];
    let a = model.logits(&tokens).unwrap();
    let b = loaded.logits(&tokens).unwrap();
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-5);
    }
}

#[test]
fn test_q8_weights_stay_close() {
    let model = Transformer::new(small_args());
    let file = NamedTempFile::new().unwrap();
    weights::save_weights(file.path(), &model, Precision::Q8).unwrap();

    let mut store = weights::load_mmap(file.path(), |_, _| {}).unwrap();
    let loaded = Transformer::from_store(small_args(), &mut store).unwrap();

    let tokens = [3_usize, 4];
    let a = model.logits(&tokens).unwrap();
    let b = loaded.logits(&tokens).unwrap();
    let max_diff = a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0_f32, f32::max);
    assert!(max_diff < 0.05, "q8 drifted by {max_diff}");
}

#[test]
fn test_mismatched_config_rejected() {
    let model = Transformer::new(small_args());
    let file = NamedTempFile::new().unwrap();
    weights::save_weights(file.path(), &model, Precision::F32).unwrap();

    let mut store = weights::load_mmap(file.path(), |_, _| {}).unwrap();
    let wider = ModelArgs { vocab_size: 41, ..small_args() };
    assert!(Transformer::from_store(wider, &mut store).is_err());
}
