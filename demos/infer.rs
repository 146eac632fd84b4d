//! Image-to-LaTeX inference demo.
//!
//! Loads the service against a local checkpoint directory, runs inference on
//! one or more formula images, and prints the LaTeX output. Repeated runs on
//! the same image are served from the durable cache.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example infer -- \
//!     --model-dir models/Qwen2-VL-7B-Instruct \
//!     --cache-dir ./cache \
//!     formula1.png formula2.png
//! ```
//!
//! Pass `--adapter <path>` to activate a fine-tuned adapter before
//! inference, or `--list-adapters` to show what the artifacts directory
//! currently holds.

use clap::Parser;
use snaptex::core::AppConfig;
use snaptex::service::SnapTexService;
use std::path::PathBuf;
use tracing::{error, info};

/// Command-line arguments for the inference demo
#[derive(Parser)]
#[command(name = "infer")]
#[command(about = "Image-to-LaTeX inference demo - converts formula images to LaTeX")]
struct Args {
    /// Directory holding the base checkpoint (config.json, tokenizer.json, *.safetensors)
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Paths to input formula images to process
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Directory for durable cache entries
    #[arg(long, default_value = "./cache")]
    cache_dir: PathBuf,

    /// Directory the training pipeline writes adapters into
    #[arg(long, default_value = "./models/training/outputs")]
    artifacts_dir: PathBuf,

    /// Adapter path to activate before inference
    #[arg(long)]
    adapter: Option<PathBuf>,

    /// List discovered adapters and exit
    #[arg(long)]
    list_adapters: bool,

    /// Device to use for inference (e.g., 'cpu', 'cuda', 'cuda:0')
    #[arg(long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = AppConfig {
        model_dir: args.model_dir,
        artifacts_dir: args.artifacts_dir,
        cache_dir: args.cache_dir,
        device: args.device,
        ..Default::default()
    };
    let service = SnapTexService::new(&config)?;

    if args.list_adapters {
        let adapters = service.list_adapters().await?;
        if adapters.is_empty() {
            info!("no adapters found");
        }
        for adapter in adapters {
            info!(job_id = %adapter.job_id, path = %adapter.path.display(), "adapter");
        }
        return Ok(());
    }

    if let Some(adapter) = &args.adapter {
        let info = service.switch_model(&adapter.display().to_string()).await?;
        info!(name = %info.name, "adapter activated");
    }

    let current = service.current_model().await?;
    info!(model = %current.name, "active model");

    for path in &args.images {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to read {}: {e}", path.display());
                continue;
            }
        };
        match service.infer(bytes).await {
            Ok(result) => {
                info!(
                    "{}: {} ({} tokens, {} ms)",
                    path.display(),
                    result.latex,
                    result.tokens,
                    result.time_ms
                );
            }
            Err(e) => error!("inference failed for {}: {e}", path.display()),
        }
    }

    Ok(())
}
