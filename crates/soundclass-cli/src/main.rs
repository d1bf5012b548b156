mod config;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soundclass::checkpoint::Checkpoint;
use soundclass::constants::DEFAULT_TOP_K;
use soundclass::network::ClassifierNetwork;
use soundclass::service::{InferenceService, ModelHost};
use soundclass::weights::{TensorSource, WeightStore};
use tracing_subscriber::EnvFilter;

use crate::config::ServiceConfig;

#[derive(Debug, Parser)]
#[command(name = "soundclass")]
#[command(about = "Environmental sound classification (ESC-50 residual CNN)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Classify one audio file and print the top predictions.
    Classify {
        /// Audio file (WAV, FLAC, OGG/Vorbis, MP3).
        #[arg(long)]
        audio: PathBuf,

        /// Model directory with classes.json / model.safetensors.
        #[arg(long, default_value = "models")]
        model_dir: PathBuf,

        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,
    },
    /// Validate a model directory without running inference.
    Inspect {
        #[arg(long, default_value = "models")]
        model_dir: PathBuf,

        /// Also load every weight tensor and report parameter counts.
        #[arg(long, default_value_t = false)]
        weights: bool,
    },
    /// Load the model once and serve HTTP inference requests.
    Serve {
        /// JSON config file; flags below override its values.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        model_dir: Option<PathBuf>,

        #[arg(long)]
        bind: Option<std::net::SocketAddr>,

        #[arg(long)]
        top_k: Option<usize>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Classify {
            audio,
            model_dir,
            top_k,
        } => classify(&audio, &model_dir, top_k),
        Command::Inspect { model_dir, weights } => inspect_model(&model_dir, weights),
        Command::Serve {
            config,
            model_dir,
            bind,
            top_k,
        } => {
            let mut cfg = match config {
                Some(path) => ServiceConfig::from_path(&path)
                    .with_context(|| format!("load config {}", path.display()))?,
                None => ServiceConfig::default(),
            };
            if let Some(dir) = model_dir {
                cfg.model_dir = dir;
            }
            if let Some(addr) = bind {
                cfg.bind = addr;
            }
            if let Some(k) = top_k {
                cfg.top_k = k;
            }
            cfg.validate()?;
            serve(cfg)
        }
    }
}

fn classify(audio: &Path, model_dir: &Path, top_k: usize) -> Result<()> {
    anyhow::ensure!(top_k > 0, "--top-k must be > 0");
    let checkpoint = Checkpoint::load_from_dir(model_dir)
        .with_context(|| format!("load model from {}", model_dir.display()))?;
    let service = InferenceService::new(checkpoint, top_k);

    let bytes = std::fs::read(audio).with_context(|| format!("read file {}", audio.display()))?;
    let predictions = service
        .classify_bytes(&bytes)
        .with_context(|| format!("classify {}", audio.display()))?;

    println!("Inference result:");
    for p in &predictions {
        println!("  -{} {:.2}%", p.class, p.confidence * 100.0);
    }
    Ok(())
}

fn inspect_model(model_dir: &Path, inspect_weights: bool) -> Result<()> {
    let checkpoint = Checkpoint::load_from_dir(model_dir)
        .with_context(|| format!("load model from {}", model_dir.display()))?;
    let num_classes = checkpoint.classes().len();
    eprintln!(
        "model ok: classes={num_classes} first={:?}",
        checkpoint.classes().first()
    );

    if inspect_weights {
        let store = WeightStore::open(model_dir.join("model.safetensors"))
            .context("open model.safetensors")?;
        let names = store.names().context("list tensor names")?;
        let specs = ClassifierNetwork::parameter_shapes(num_classes);
        let total: usize = specs.iter().map(|s| s.numel()).sum();
        eprintln!(
            "weights ok: tensor_count={} expected_tensors={} total_values={total} trainable_params={}",
            names.len(),
            specs.len(),
            ClassifierNetwork::parameter_count(num_classes)
        );
    }
    Ok(())
}

fn serve(cfg: ServiceConfig) -> Result<()> {
    let host = Arc::new(ModelHost::new());
    let model_dir = cfg.model_dir.clone();
    host.start(cfg.top_k, || Checkpoint::load_from_dir(&model_dir))
        .with_context(|| format!("load model from {}", cfg.model_dir.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(server::serve(host, &cfg))
}
