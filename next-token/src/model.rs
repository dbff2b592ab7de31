use ndarray::{s, Array1, Array2, Array3, ArrayViewD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::probs::softmax;
use crate::weights::TensorStore;

/// Logits shaped `[batch, seq, vocab]`.
pub type Logits = Array3<f32>;

/// Anything that maps a token-id sequence to per-position logits.
pub trait LanguageModel: Send + Sync {
    fn vocab_size(&self) -> usize;

    fn max_seq_len(&self) -> usize;

    /// Runs one forward pass; the batch dimension is always 1.
    fn forward(&self, tokens: &[usize]) -> Result<Logits>;
}

fn default_rope_theta() -> f32 {
    10_000.0
}

/// Shape of the demo transformer, stored as `config.json` next to its weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    pub max_seq_len: usize,
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Width of the gated feed-forward layer.
    pub hidden_dim: usize,
    /// Base of the rotary position frequencies.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            max_seq_len: 128,
            vocab_size: 1024,
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            hidden_dim: 256,
            rope_theta: default_rope_theta(),
        }
    }
}

impl ModelArgs {
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.dim == 0 || self.n_heads == 0 || self.max_seq_len == 0 {
            return Err(Error::InvalidWeights(format!("degenerate model config: {self:?}")));
        }
        if self.dim % self.n_heads != 0 {
            return Err(Error::InvalidWeights(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::InvalidWeights(format!(
                "rotary embeddings need an even head size, got {}",
                self.head_dim()
            )));
        }
        Ok(())
    }
}

fn random_matrix(rows: usize, cols: usize) -> Array2<f32> {
    let mut rng = rand::thread_rng();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.1..0.1))
}

struct Embedding {
    table: Array2<f32>, // vocab x dim
}

impl Embedding {
    fn lookup(&self, tokens: &[usize]) -> Result<Array2<f32>> {
        let vocab_size = self.table.nrows();
        let mut out = Array2::<f32>::zeros((tokens.len(), self.table.ncols()));
        for (mut row, &id) in out.outer_iter_mut().zip(tokens) {
            if id >= vocab_size {
                return Err(Error::TokenOutOfRange { id, vocab_size });
            }
            row.assign(&self.table.row(id));
        }
        Ok(out)
    }
}

/// Bias-free projection, weight stored `out x in`.
struct Linear {
    weight: Array2<f32>,
}

impl Linear {
    fn random(in_features: usize, out_features: usize) -> Self {
        Self { weight: random_matrix(out_features, in_features) }
    }

    fn load(store: &mut TensorStore, name: &str, out_features: usize, in_features: usize) -> Result<Self> {
        Ok(Self { weight: store.take_matrix(name, (out_features, in_features))? })
    }

    fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t())
    }
}

struct RmsNorm {
    gain: Array1<f32>,
}

impl RmsNorm {
    const EPS: f32 = 1e-6;

    fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.outer_iter_mut() {
            let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / row.len().max(1) as f32;
            let inv = 1.0 / (mean_sq + Self::EPS).sqrt();
            row.zip_mut_with(&self.gain, |v, g| *v *= inv * g);
        }
        out
    }
}

/// Precomputed cos/sin tables, `max_seq_len x head_dim/2`.
struct Rotary {
    cos: Array2<f32>,
    sin: Array2<f32>,
}

impl Rotary {
    fn new(args: &ModelArgs) -> Self {
        let half = args.head_dim() / 2;
        let angle = |pos: usize, i: usize| {
            let freq = args.rope_theta.powf(-((2 * i) as f32) / args.head_dim() as f32);
            pos as f32 * freq
        };
        Self {
            cos: Array2::from_shape_fn((args.max_seq_len, half), |(p, i)| angle(p, i).cos()),
            sin: Array2::from_shape_fn((args.max_seq_len, half), |(p, i)| angle(p, i).sin()),
        }
    }

    /// Rotates each head of `x` (`seq x n_heads*head_dim`) in place; the two
    /// halves of a head form the rotated pairs.
    fn rotate(&self, x: &mut Array2<f32>, head_dim: usize) {
        let half = head_dim / 2;
        for (pos, mut row) in x.outer_iter_mut().enumerate() {
            for mut head in row.exact_chunks_mut(head_dim) {
                for i in 0..half {
                    let (a, b) = (head[i], head[i + half]);
                    let (cos, sin) = (self.cos[[pos, i]], self.sin[[pos, i]]);
                    head[i] = a * cos - b * sin;
                    head[i + half] = a * sin + b * cos;
                }
            }
        }
    }
}

struct Attention {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn apply(&self, x: &Array2<f32>, rotary: &Rotary) -> Array2<f32> {
        let mut q = self.wq.apply(x);
        let mut k = self.wk.apply(x);
        let v = self.wv.apply(x);
        rotary.rotate(&mut q, self.head_dim);
        rotary.rotate(&mut k, self.head_dim);

        let seq = x.nrows();
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let mut mixed = Array2::<f32>::zeros((seq, self.n_heads * self.head_dim));
        for h in 0..self.n_heads {
            let cols = h * self.head_dim..(h + 1) * self.head_dim;
            let (qh, kh, vh) = (
                q.slice(s![.., cols.clone()]),
                k.slice(s![.., cols.clone()]),
                v.slice(s![.., cols.clone()]),
            );
            let mut out = mixed.slice_mut(s![.., cols]);
            for i in 0..seq {
                // causal: keys 0..=i only
                let scores: Vec<f32> = (0..=i).map(|j| qh.row(i).dot(&kh.row(j)) * scale).collect();
                let weights = softmax(&scores);
                for (j, w) in weights.into_iter().enumerate() {
                    out.row_mut(i).scaled_add(w, &vh.row(j));
                }
            }
        }
        self.wo.apply(&mixed)
    }
}

/// Gated SiLU feed-forward: `w2(silu(w1 x) * w3 x)`.
struct FeedForward {
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl FeedForward {
    fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut gate = self.w1.apply(x);
        gate.zip_mut_with(&self.w3.apply(x), |g, u| *g = *g / (1.0 + (-*g).exp()) * u);
        self.w2.apply(&gate)
    }
}

struct Block {
    attn_norm: RmsNorm,
    attn: Attention,
    ffn_norm: RmsNorm,
    ffn: FeedForward,
}

impl Block {
    fn apply(&self, x: Array2<f32>, rotary: &Rotary) -> Array2<f32> {
        let x = &x + &self.attn.apply(&self.attn_norm.apply(&x), rotary);
        &x + &self.ffn.apply(&self.ffn_norm.apply(&x))
    }
}

/// Small decoder-only transformer used for demo models: rotary attention,
/// RMS norms and a gated feed-forward layer, all on ndarray.
pub struct Transformer {
    pub args: ModelArgs,
    embed: Embedding,
    layers: Vec<Block>,
    norm: RmsNorm,
    head: Linear,
    rotary: Rotary,
}

impl Transformer {
    /// Builds a model with random weights.
    pub fn new(args: ModelArgs) -> Self {
        let (dim, hidden) = (args.dim, args.hidden_dim);
        let ones = || RmsNorm { gain: Array1::ones(dim) };
        let layers = (0..args.n_layers)
            .map(|_| Block {
                attn_norm: ones(),
                attn: Attention {
                    wq: Linear::random(dim, dim),
                    wk: Linear::random(dim, dim),
                    wv: Linear::random(dim, dim),
                    wo: Linear::random(dim, dim),
                    n_heads: args.n_heads,
                    head_dim: args.head_dim(),
                },
                ffn_norm: ones(),
                ffn: FeedForward {
                    w1: Linear::random(dim, hidden),
                    w2: Linear::random(hidden, dim),
                    w3: Linear::random(dim, hidden),
                },
            })
            .collect();
        Self {
            embed: Embedding { table: random_matrix(args.vocab_size, dim) },
            layers,
            norm: ones(),
            head: Linear::random(dim, args.vocab_size),
            rotary: Rotary::new(&args),
            args,
        }
    }

    /// Builds a model from named tensors, checking every shape against `args`.
    pub fn from_store(args: ModelArgs, store: &mut TensorStore) -> Result<Self> {
        args.validate()?;
        let (dim, hidden, vocab) = (args.dim, args.hidden_dim, args.vocab_size);
        let embed = Embedding { table: store.take_matrix("embed.weight", (vocab, dim))? };
        let mut layers = Vec::with_capacity(args.n_layers);
        for i in 0..args.n_layers {
            let p = format!("layers.{i}");
            layers.push(Block {
                attn_norm: RmsNorm { gain: store.take_vector(&format!("{p}.attn_norm.weight"), dim)? },
                attn: Attention {
                    wq: Linear::load(store, &format!("{p}.attn.wq.weight"), dim, dim)?,
                    wk: Linear::load(store, &format!("{p}.attn.wk.weight"), dim, dim)?,
                    wv: Linear::load(store, &format!("{p}.attn.wv.weight"), dim, dim)?,
                    wo: Linear::load(store, &format!("{p}.attn.wo.weight"), dim, dim)?,
                    n_heads: args.n_heads,
                    head_dim: args.head_dim(),
                },
                ffn_norm: RmsNorm { gain: store.take_vector(&format!("{p}.ffn_norm.weight"), dim)? },
                ffn: FeedForward {
                    w1: Linear::load(store, &format!("{p}.ffn.w1.weight"), hidden, dim)?,
                    w2: Linear::load(store, &format!("{p}.ffn.w2.weight"), dim, hidden)?,
                    w3: Linear::load(store, &format!("{p}.ffn.w3.weight"), hidden, dim)?,
                },
            });
        }
        let norm = RmsNorm { gain: store.take_vector("norm.weight", dim)? };
        let head = Linear::load(store, "head.weight", vocab, dim)?;
        if let Some(extra) = store.remaining().next() {
            return Err(Error::InvalidWeights(format!("unexpected tensor {extra}")));
        }
        let rotary = Rotary::new(&args);
        Ok(Self { args, embed, layers, norm, head, rotary })
    }

    /// Every parameter with the name it is stored under.
    pub fn named_tensors(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut out = vec![("embed.weight".to_string(), self.embed.table.view().into_dyn())];
        for (i, block) in self.layers.iter().enumerate() {
            let p = format!("layers.{i}");
            let attn = &block.attn;
            let ffn = &block.ffn;
            out.push((format!("{p}.attn_norm.weight"), block.attn_norm.gain.view().into_dyn()));
            for (name, linear) in [("wq", &attn.wq), ("wk", &attn.wk), ("wv", &attn.wv), ("wo", &attn.wo)] {
                out.push((format!("{p}.attn.{name}.weight"), linear.weight.view().into_dyn()));
            }
            out.push((format!("{p}.ffn_norm.weight"), block.ffn_norm.gain.view().into_dyn()));
            for (name, linear) in [("w1", &ffn.w1), ("w2", &ffn.w2), ("w3", &ffn.w3)] {
                out.push((format!("{p}.ffn.{name}.weight"), linear.weight.view().into_dyn()));
            }
        }
        out.push(("norm.weight".to_string(), self.norm.gain.view().into_dyn()));
        out.push(("head.weight".to_string(), self.head.weight.view().into_dyn()));
        out
    }

    /// Logits for every position, `seq x vocab`. At most `max_seq_len`
    /// tokens fit the rotary tables.
    pub fn logits(&self, tokens: &[usize]) -> Result<Array2<f32>> {
        if tokens.len() > self.args.max_seq_len {
            return Err(Error::InvalidWeights(format!(
                "{} tokens exceed the context of {}",
                tokens.len(),
                self.args.max_seq_len
            )));
        }
        let mut h = self.embed.lookup(tokens)?;
        for layer in &self.layers {
            h = layer.apply(h, &self.rotary);
        }
        Ok(self.head.apply(&self.norm.apply(&h)))
    }
}

impl LanguageModel for Transformer {
    fn vocab_size(&self) -> usize {
        self.args.vocab_size
    }

    fn max_seq_len(&self) -> usize {
        self.args.max_seq_len
    }

    fn forward(&self, tokens: &[usize]) -> Result<Logits> {
        Ok(self.logits(tokens)?.insert_axis(Axis(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_args() -> ModelArgs {
        ModelArgs { max_seq_len: 16, vocab_size: 20, dim: 8, n_layers: 1, n_heads: 2, hidden_dim: 16, ..ModelArgs::default() }
    }

    #[test]
    fn forward_is_batch_seq_vocab() {
        let model = Transformer::new(tiny_args());
        let logits = model.forward(&[1, 2, 3]).unwrap();
        assert_eq!(logits.shape(), &[1, 3, 20]);
    }

    #[test]
    fn earlier_positions_ignore_later_tokens() {
        let model = Transformer::new(tiny_args());
        let short = model.logits(&[4, 5]).unwrap();
        let long = model.logits(&[4, 5, 6]).unwrap();
        for (a, b) in short.row(1).iter().zip(long.row(1).iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn out_of_vocab_token_is_an_error() {
        let model = Transformer::new(tiny_args());
        let err = model.forward(&[25]).unwrap_err();
        assert!(matches!(err, Error::TokenOutOfRange { id: 25, vocab_size: 20 }));
    }

    #[test]
    fn indivisible_heads_rejected() {
        let args = ModelArgs { dim: 10, n_heads: 3, ..tiny_args() };
        assert!(args.validate().is_err());
    }

    #[test]
    fn odd_head_size_rejected() {
        let args = ModelArgs { dim: 6, n_heads: 2, ..tiny_args() };
        assert!(args.validate().is_err());
    }

    #[test]
    fn word_order_reaches_the_last_position() {
        // one layer of plain attention would see {3, 5} as a set
        let model = Transformer::new(tiny_args());
        let a = model.logits(&[3, 5, 7]).unwrap();
        let b = model.logits(&[5, 3, 7]).unwrap();
        let drift = a.row(2).iter().zip(b.row(2).iter()).map(|(x, y)| (x - y).abs()).fold(0.0_f32, f32::max);
        assert!(drift > 1e-7, "order had no effect");
    }

    #[test]
    fn rotation_at_position_zero_is_identity() {
        let rotary = Rotary::new(&tiny_args());
        let mut x = Array2::from_shape_fn((1, 8), |(_, c)| c as f32 + 1.0);
        let before = x.clone();
        rotary.rotate(&mut x, 4);
        assert_eq!(x, before);
    }

    #[test]
    fn too_long_input_is_rejected() {
        let model = Transformer::new(tiny_args());
        assert!(model.logits(&[1; 17]).is_err());
    }
}
