//! Guided diffusion checkpoint fetcher
//!
//! Downloads the main network and secondary model checkpoints into a model
//! directory, and optionally smoke-tests the secondary model with a single
//! forward pass.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use candle_guided_diffusion::loader::{
    AutoFetcher, CHECKPOINTS, ModelCheckpoint, SECONDARY_CHECKPOINT, fetch_if_missing,
    load_json_config, load_var_builder,
};
use candle_guided_diffusion::{Pcg32, SecondaryConfig, SecondaryDenoiser};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fetch guided diffusion checkpoints and smoke-test the secondary model"
)]
struct Args {
    /// Directory checkpoints are stored in
    #[arg(short, long, default_value = "modelzoo")]
    model_dir: PathBuf,

    /// Main network checkpoint (uncondImageNet512, uncondImageNet256 or all)
    #[arg(short, long, default_value = "uncondImageNet512")]
    checkpoint: String,

    /// Skip the secondary model
    #[arg(long)]
    no_secondary: bool,

    /// Run one secondary forward pass after fetching
    #[arg(long)]
    smoke_test: bool,

    /// Secondary model config JSON (defaults to the published architecture)
    #[arg(long)]
    secondary_config: Option<PathBuf>,

    /// Image size of the smoke test input
    #[arg(long, default_value_t = 64)]
    size: usize,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_guided_diffusion=info".parse()?)
                .add_directive("guided_diffusion_fetch=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let fetcher = AutoFetcher::new();

    let checkpoints: Vec<ModelCheckpoint> = if args.checkpoint == "all" {
        CHECKPOINTS.to_vec()
    } else {
        vec![ModelCheckpoint::lookup(&args.checkpoint)?]
    };
    for checkpoint in &checkpoints {
        let path = fetch_if_missing(&fetcher, checkpoint.url, checkpoint.path_in(&args.model_dir))
            .with_context(|| format!("fetching {}", checkpoint.id))?;
        info!(checkpoint = checkpoint.id, path = %path.display(), "Checkpoint ready");
    }

    if args.no_secondary {
        return Ok(());
    }
    let secondary_path = fetch_if_missing(
        &fetcher,
        SECONDARY_CHECKPOINT.url,
        SECONDARY_CHECKPOINT.path_in(&args.model_dir),
    )
    .context("fetching secondary model")?;
    info!(path = %secondary_path.display(), "Secondary model ready");

    if !args.smoke_test {
        return Ok(());
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let config: SecondaryConfig = match &args.secondary_config {
        Some(path) => load_json_config(path)?,
        None => SecondaryConfig::default(),
    };
    let vb = load_var_builder(&secondary_path, DType::F32, &device)?;
    let model = SecondaryDenoiser::new(vb, config).context("building secondary model")?;

    let mut rng = Pcg32::seeded(0);
    let x = rng.randn((1, 3, args.size, args.size), &device)?;
    let t = Tensor::new(&[0.5f32], &device)?;
    let out = model.forward(&x, &t)?;
    let v_rms = out.v().flatten_all()?.sqr()?.mean_all()?.sqrt()?.to_scalar::<f32>()?;
    info!(
        input = ?x.dims(),
        pred = ?out.pred().dims(),
        v_rms,
        "Secondary model smoke test passed"
    );
    Ok(())
}
