//! `quell-denoise`: offline denoising of a PCM16 WAV file.
//!
//! ```text
//! quell-denoise --input noisy.wav --output clean.wav [--level high] [--config quell.json]
//! ```
//!
//! Writes a 48 kHz mono PCM16 WAV and prints a JSON summary to stdout.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use quell_core::config::load_config;
use quell_core::{EngineConfig, NoiseEngine, NoiseReductionLevel};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: quell-denoise --input <wav> --output <wav> \
[--level low|medium|high|auto] [--config <json>] [--allow-degraded]";

#[derive(Debug, Default)]
struct Args {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    level: Option<NoiseReductionLevel>,
    config: Option<PathBuf>,
    allow_degraded: bool,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--input" | "-i" => args.input = it.next().map(PathBuf::from),
            "--output" | "-o" => args.output = it.next().map(PathBuf::from),
            "--level" => {
                let raw = it.next().context("--level needs a value")?;
                args.level = Some(NoiseReductionLevel::parse(&raw));
            }
            "--config" => args.config = it.next().map(PathBuf::from),
            "--allow-degraded" => args.allow_degraded = true,
            "--help" | "-h" => return Ok(None),
            other => bail!("unknown argument `{other}`\n{USAGE}"),
        }
    }
    Ok(Some(args))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("QUELL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("quell_core=info,quell_denoise=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(args) = parse_args()? else {
        println!("{USAGE}");
        return Ok(());
    };
    let input = args.input.context("missing --input")?;
    let output = args.output.context("missing --output")?;

    let mut config = match &args.config {
        Some(path) => load_config(path),
        None => EngineConfig::default(),
    };
    if let Some(level) = args.level {
        config.noise_reduction_level = level;
    }
    if args.allow_degraded {
        config.allow_degraded = true;
    }
    config.apply_env_overrides();

    let bytes = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let engine = NoiseEngine::new(config);
    engine.initialize().await.context("engine initialization failed")?;
    info!(state = %engine.state(), degraded = engine.is_degraded(), "engine ready");

    let report = engine
        .process_wav(bytes)
        .await
        .with_context(|| format!("denoising {}", input.display()))?;
    std::fs::write(&output, &report.output)
        .with_context(|| format!("writing {}", output.display()))?;
    engine.destroy(false).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
