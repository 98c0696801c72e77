use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use image::ImageFormat;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use cugan_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use cugan_core::engine::{DylibEngine, InferenceEngine, ResampleEngine};
use cugan_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use cugan_core::variant::catalog_json;
use cugan_core::{
    CanonicalImage, ComputeScheduler, DirAssetSource, InferenceConfig, InferenceSettings,
    ModelVariant, Upscaler,
};

#[derive(Parser)]
#[command(name = "cugan", about = "Real-CUGAN image super-resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale image files with one shared session.
    Upscale(UpscaleArgs),
    /// Print the model variant catalog as JSON.
    Variants,
}

#[derive(Args, Debug, Default)]
struct UpscaleArgs {
    #[arg(required = true, help = "PNG, JPEG or WebP files to upscale")]
    files: Vec<PathBuf>,
    #[arg(long, help = "Model variant: nose, pro or se")]
    variant: Option<ModelVariant>,
    #[arg(long)]
    scale: Option<i32>,
    #[arg(long, allow_hyphen_values = true, help = "-1 conservative, 0 none, 1..3 strength")]
    denoise: Option<i32>,
    #[arg(long)]
    sync_gap: Option<i32>,
    #[arg(long, allow_hyphen_values = true, help = "Accelerator index, -1 for CPU")]
    device: Option<i32>,
    #[arg(long, help = "Enable test-time augmentation")]
    tta: bool,
    #[arg(
        long,
        default_value = "resample",
        help = "Engine: 'resample', 'native' (search for the shared library) or a library path"
    )]
    engine: String,
    #[arg(short = 'o', long, help = "Output directory (defaults to each input's directory)")]
    output_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, resolved_data_dir).await,
        Commands::Variants => {
            println!("{}", catalog_json()?);
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(appender) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&file_filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&console_filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_app_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Command-line values take precedence over the `[inference]` section.
fn apply_overrides(base: InferenceSettings, args: &UpscaleArgs) -> InferenceSettings {
    InferenceSettings {
        variant: args.variant.unwrap_or(base.variant),
        scale: args.scale.unwrap_or(base.scale),
        denoise: args.denoise.unwrap_or(base.denoise),
        sync_gap: args.sync_gap.unwrap_or(base.sync_gap),
        device: args.device.unwrap_or(base.device),
        augment: args.tta || base.augment,
    }
}

fn build_engine(choice: &str) -> Result<Arc<dyn InferenceEngine>> {
    match choice {
        "resample" => Ok(Arc::new(ResampleEngine::new())),
        "native" => Ok(Arc::new(DylibEngine::discover(None)?)),
        path => Ok(Arc::new(DylibEngine::discover(Some(Path::new(path)))?)),
    }
}

fn output_path_for(input: &Path, output_dir: Option<&Path>, scale: u32) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(format!("{stem}_x{scale}.png"))
}

async fn run_upscale(args: UpscaleArgs, data_dir: PathBuf) -> Result<()> {
    let app_config = load_app_config(&data_dir);
    let config: InferenceConfig = apply_overrides(app_config.inference.settings(), &args)
        .validate()
        .context("invalid inference settings")?;

    let engine = build_engine(&args.engine)?;
    let scheduler = Arc::new(ComputeScheduler::new(app_config.compute)?);
    let upscaler = Upscaler::new(engine, scheduler, app_config.models_dir(&data_dir));
    let assets = Arc::new(DirAssetSource::new(app_config.assets_dir(&data_dir)));

    info!(
        engine = upscaler.engine_name(),
        model_root = %upscaler.model_root().display(),
        files = args.files.len(),
        "Creating session"
    );
    if let Some(dir) = &args.output_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
    }
    // Past this point every path ends in `release`.
    let session = Arc::new(upscaler.create_session(config, assets).await?);

    let started = Instant::now();
    let mut pending = Vec::with_capacity(args.files.len());
    for input in &args.files {
        let session = Arc::clone(&session);
        let input = input.clone();
        pending.push(tokio::spawn(async move {
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("failed to read {}", input.display()))?;
            let image = session
                .process(bytes)
                .await
                .with_context(|| format!("failed to upscale {}", input.display()))?;
            anyhow::Ok(image)
        }));
    }

    let mut failures = 0usize;
    for (input, task) in args.files.iter().zip(pending) {
        let outcome = match task.await {
            Ok(Ok(image)) => {
                let output = output_path_for(input, args.output_dir.as_deref(), session.scale());
                save_png(image, output.clone())
                    .await
                    .map(|()| output)
            }
            Ok(Err(err)) => Err(err),
            Err(join) => Err(anyhow::anyhow!("upscale task failed: {join}")),
        };
        match outcome {
            Ok(output) => info!(input = %input.display(), output = %output.display(), "Wrote result"),
            Err(err) => {
                failures += 1;
                error!("{err:#}");
            }
        }
    }

    session.release().await;
    info!(
        files = args.files.len(),
        failures,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Upscale finished"
    );

    if failures > 0 {
        bail!("{failures} of {} file(s) failed", args.files.len());
    }
    Ok(())
}

async fn save_png(image: CanonicalImage, path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        image
            .into_rgba_image()
            .save_with_format(&path, ImageFormat::Png)
            .with_context(|| format!("failed to write {}", path.display()))
    })
    .await
    .context("task join error")?
}
