use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use next_token::checkpoint;
use next_token::weights::save_model;
use next_token::{ModelArgs, ModelLoader, Precision, TextTokenizer, Transformer, VocabTokenizer, DEFAULT_TOP_K};
use token_chart::app;
use token_chart::{BarChart, ChartConfig, ChartController};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_SEEDS: [&str; 5] = [
    "The weather tomorrow is",
    "Where I live",
    "The future of Japan",
    "Because taxes are high",
    "Once upon a time",
];

#[derive(Parser)]
#[command(author, version, about = "Explore a language model's next-token distribution")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chart: start from a seed and click tokens to extend it
    Explore {
        #[command(flatten)]
        model: ModelOpts,

        /// Seed phrase shown on the initial chart (repeatable)
        #[arg(long = "seed")]
        seeds: Vec<String>,

        #[command(flatten)]
        chart: ChartOpts,
    },
    /// Print the next-token chart for one text and exit
    Predict {
        #[command(flatten)]
        model: ModelOpts,

        /// Text to continue
        text: String,

        #[command(flatten)]
        chart: ChartOpts,
    },
    /// Write a randomly initialised demo model directory
    Init {
        /// Output directory
        #[arg(long, default_value = "model")]
        out: PathBuf,

        #[arg(long, default_value_t = 64)]
        dim: usize,

        #[arg(long, default_value_t = 2)]
        layers: usize,

        #[arg(long, default_value_t = 4)]
        heads: usize,

        #[arg(long, default_value_t = 256)]
        hidden_dim: usize,

        #[arg(long, default_value_t = 128)]
        max_seq_len: usize,
    },
}

#[derive(Args)]
struct ModelOpts {
    /// Directory holding config.json, the tokenizer and the weights
    #[arg(long, default_value = "model")]
    model_dir: PathBuf,

    /// Fetch a Qwen2 checkpoint from the Hugging Face hub instead, e.g. Qwen/Qwen2.5-0.5B
    #[arg(long, conflicts_with = "model_dir")]
    hub: Option<String>,

    /// Hub revision to fetch
    #[arg(long, default_value = "main", requires = "hub")]
    revision: String,

    /// Weight precision to load (f32 or q8)
    #[arg(long, default_value_t = Precision::F32)]
    precision: Precision,

    /// Number of candidate tokens to show
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,
}

#[derive(Args)]
struct ChartOpts {
    /// Columns used by the bars
    #[arg(long, default_value_t = 48)]
    width: usize,

    /// Columns used by the token labels
    #[arg(long, default_value_t = 16)]
    label_width: usize,
}

impl ModelOpts {
    fn loader(&self) -> Result<ModelLoader> {
        let dir = match &self.hub {
            Some(model_id) => checkpoint::fetch(model_id, &self.revision)
                .with_context(|| format!("failed to fetch {model_id}"))?,
            None => self.model_dir.clone(),
        };
        Ok(ModelLoader::new(dir, self.precision))
    }
}

impl ChartOpts {
    fn config(&self) -> ChartConfig {
        ChartConfig {
            label_width: self.label_width,
            bar_width: self.width,
            ..ChartConfig::default()
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn init_model(out: PathBuf, args: ModelArgs) -> Result<()> {
    let tokenizer = VocabTokenizer::demo();
    let args = ModelArgs { vocab_size: tokenizer.vocab_size(), ..args };
    args.validate()?;
    let model = Transformer::new(args);
    save_model(&out, &model, &tokenizer)
        .with_context(|| format!("failed to write model to {}", out.display()))?;
    info!(dir = %out.display(), "saved demo model");
    println!("Saved demo model to {:?}", out);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Explore { model, seeds, chart } => {
            let seeds = if seeds.is_empty() {
                DEFAULT_SEEDS.iter().map(|s| s.to_string()).collect()
            } else {
                seeds
            };
            let controller = ChartController::new(BarChart::with_seeds(chart.config(), &seeds));
            let loader = model.loader()?;
            app::explore(loader, model.top_k, controller).await
        }
        Commands::Predict { model, text, chart } => {
            let controller = ChartController::new(BarChart::new(chart.config()));
            let loader = model.loader()?;
            app::predict_once(&loader, model.top_k, controller, &text)
        }
        Commands::Init { out, dim, layers, heads, hidden_dim, max_seq_len } => init_model(
            out,
            ModelArgs {
                max_seq_len,
                vocab_size: 0,
                dim,
                n_layers: layers,
                n_heads: heads,
                hidden_dim,
                ..ModelArgs::default()
            },
        ),
    }
}
