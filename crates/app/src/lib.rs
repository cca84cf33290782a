use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscaler_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig, UpscaleSettings,
};
use upscaler_core::coordinator::{PipelineCoordinator, RunHandle, RunOutcome};
use upscaler_core::format::{encode_to_file, OutputFormat};
use upscaler_core::full::{FullRequest, OverwritePolicy};
use upscaler_core::geometry::{ScrollbarMetrics, ViewportState};
use upscaler_core::inference::OnnxInferenceService;
use upscaler_core::logging::{self, CrashHook, FileSink, LogOptions, DEFAULT_LOG_FILTER};
use upscaler_core::model_registry::ModelRegistry;
use upscaler_core::plan::{ModelMode, ModelSlot};
use upscaler_core::preview::PreviewKind;
use upscaler_core::progress::{PipelineEvent, Stage};
use upscaler_core::workspace::Workspace;

#[derive(Parser)]
#[command(name = "upscaler", about = "Tiled AI image upscaling with ONNX models")]
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

    #[arg(long, global = true, help = "Data directory (config, models, logs, scratch)")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale an image or every image in a directory.
    Upscale(UpscaleArgs),
    /// Upscale the visible part of an image, or all of it, and merge it back.
    Preview(PreviewArgs),
    /// List models found in the models directory.
    Models,
    /// Print the config file location and its effective values.
    Config,
}

#[derive(Args, Debug, Clone)]
struct ModelArgs {
    #[arg(short = 'm', long = "model", help = "Model name or path to an .onnx file")]
    model: String,
    #[arg(long = "model2", help = "Second model for interpolate and chain modes")]
    model2: Option<String>,
    #[arg(long, help = "single, interpolate or chain (defaults to the config value)")]
    mode: Option<ModelMode>,
    #[arg(long, help = "Share of the second model in interpolate mode, 0-100")]
    blend: Option<f64>,
    #[arg(long, help = "Override the configured tile size")]
    tilesize: Option<u32>,
    #[arg(long, help = "Run inference on the CPU")]
    cpu: bool,
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(help = "Image file or directory of images")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output directory (defaults to an upscaled/ folder next to the input)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Replace the originals instead of writing beside them")]
    in_place: bool,
    #[command(flatten)]
    models: ModelArgs,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    #[arg(help = "Source image")]
    source: PathBuf,
    #[arg(short = 'o', long, help = "Merged preview output (defaults to <name>_preview.png)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Upscale the whole image instead of the visible cutout")]
    full: bool,
    #[arg(long, default_value_t = 1.0)]
    zoom: f64,
    #[arg(long, default_value_t = 0.0)]
    scroll_x: f64,
    #[arg(long, default_value_t = 0.0)]
    scroll_y: f64,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    #[command(flatten)]
    models: ModelArgs,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_status = upscaler_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    upscaler_core::runtime::log_runtime_lib_status(&runtime_status);
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => run_upscale(&resolved_data_dir, args).await,
        Commands::Preview(args) => run_preview(&resolved_data_dir, args).await,
        Commands::Models => list_models(&resolved_data_dir),
        Commands::Config => show_config(&resolved_data_dir),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);
    if let CrashHook::Unavailable { reason } = &crash_hook {
        eprintln!("Warning: crash reports unavailable ({reason}). Panics will not be persisted.");
    }

    let options = LogOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = options.filters();
    let console_filter = parse_env_filter_with_fallback(&filters.console, "console");

    match logging::open_file_sink(&options) {
        FileSink::Rolling { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&filters.file, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_filter),
                );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
        }
        FileSink::Unavailable {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "File logging unavailable; continuing with console-only logging"
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
        "Startup"
    );
}

/// A missing config file means defaults; an unreadable or malformed one is
/// an error.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let path = config_path(data_dir);
    AppConfig::load_from_path(&path)
        .with_context(|| format!("invalid configuration file {}", path.display()))
}

fn build_coordinator(
    data_dir: &Path,
    mut config: AppConfig,
    models: &ModelArgs,
    overwrite: Option<OverwritePolicy>,
) -> Result<(PipelineCoordinator, UpscaleSettings)> {
    if let Some(tilesize) = models.tilesize {
        config.upscale.tilesize = Some(tilesize);
    }
    if models.cpu {
        config.upscale.use_cpu = true;
    }
    if let Some(policy) = overwrite {
        config.output.overwrite = policy.to_string();
    }

    let settings = UpscaleSettings::from_store(&config).context("invalid configuration")?;

    let mut registry = ModelRegistry::new(resolve_relative_to(data_dir, &config.paths.models_dir));
    registry.discover()?;

    let service = OnnxInferenceService::new(config.inference_backend())
        .with_trt_cache_dir(resolve_relative_to(data_dir, &config.paths.trt_cache_dir))
        .with_value_range(config.value_range())
        .with_max_concurrency(settings.max_concurrent_tiles);
    info!(backend = ?service.backend(), "Inference service ready");

    let workspace = Workspace::new(resolve_relative_to(data_dir, &config.paths.work_dir));
    let coordinator = PipelineCoordinator::new(Arc::new(service), workspace, settings.clone());

    coordinator.set_model1(Some(registry.resolve_ref(&models.model, ModelSlot::Primary)));
    coordinator.set_model2(
        models
            .model2
            .as_deref()
            .map(|name| registry.resolve_ref(name, ModelSlot::Secondary)),
    );
    if let Some(mode) = models.mode {
        coordinator.set_mode(mode);
    }
    if let Some(blend) = models.blend {
        coordinator.set_blend(blend);
    }
    if !coordinator.has_valid_selection() {
        bail!(
            "mode '{}' needs two models; pass --model2",
            coordinator.context().mode
        );
    }

    Ok((coordinator, settings))
}

async fn run_upscale(data_dir: &Path, args: UpscaleArgs) -> Result<()> {
    let overwrite = args.in_place.then_some(OverwritePolicy::InPlace);
    let (coordinator, _) = build_coordinator(data_dir, load_config(data_dir)?, &args.models, overwrite)?;

    let output_dir = match args.output {
        Some(dir) => dir,
        None => default_output_dir(&args.input),
    };
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

    let events = coordinator.subscribe();
    let handle = coordinator.start_full(FullRequest {
        input: args.input,
        output_dir,
    })?;

    match wait_with_progress(&coordinator, handle, events).await {
        RunOutcome::Full(report) => {
            for path in &report.succeeded {
                info!(path = %path.display(), "Wrote");
            }
            for failure in &report.failures {
                warn!(path = %failure.path.display(), error = %failure.error, "Skipped");
            }
            eprintln!(
                "Upscaled {} of {} image(s)",
                report.succeeded.len(),
                report.total()
            );
            if !report.is_clean() {
                bail!("{} image(s) failed", report.failures.len());
            }
            Ok(())
        }
        other => outcome_error(other),
    }
}

async fn run_preview(data_dir: &Path, args: PreviewArgs) -> Result<()> {
    let (coordinator, settings) = build_coordinator(data_dir, load_config(data_dir)?, &args.models, None)?;

    let kind = if args.full {
        PreviewKind::FullImage
    } else {
        PreviewKind::Cutout {
            viewport: ViewportState {
                zoom: args.zoom,
                scroll_x: args.scroll_x,
                scroll_y: args.scroll_y,
                width: args.width,
                height: args.height,
            },
            scrollbars: ScrollbarMetrics::default(),
        }
    };
    let output = args
        .output
        .unwrap_or_else(|| default_preview_output(&args.source));

    let events = coordinator.subscribe();
    let handle = coordinator.start_preview(args.source, kind)?;

    match wait_with_progress(&coordinator, handle, events).await {
        RunOutcome::Preview(result) => {
            encode_to_file(&result.merged, &output, OutputFormat::SameAsSource, &settings.output)?;
            eprintln!("{}", result.labels.zoom);
            eprintln!("{}", result.labels.image_size);
            eprintln!("{}", result.labels.cutout_size);
            eprintln!("Preview written to {}", output.display());
            Ok(())
        }
        other => outcome_error(other),
    }
}

fn outcome_error(outcome: RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Cancelled { .. } => bail!("cancelled"),
        RunOutcome::Failed { error, .. } => Err(error.into()),
        RunOutcome::Preview(_) | RunOutcome::Full(_) => Ok(()),
    }
}

/// Waits for the run while drawing progress; Ctrl-C cancels it.
async fn wait_with_progress(
    coordinator: &PipelineCoordinator,
    handle: RunHandle,
    events: broadcast::Receiver<PipelineEvent>,
) -> RunOutcome {
    let printer = tokio::spawn(print_events(events));

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            warn!("Interrupted, cancelling");
            coordinator.cancel();
            wait.await
        }
    };

    printer.abort();
    outcome
}

async fn print_events(mut events: broadcast::Receiver<PipelineEvent>) {
    let start = Instant::now();
    loop {
        match events.recv().await {
            Ok(PipelineEvent::Progress { percent, message }) => {
                eprint!("\r{}    ", progress_line(percent, &message, start.elapsed().as_secs_f64()));
                let _ = std::io::stderr().flush();
            }
            Ok(PipelineEvent::StageChanged { stage }) => {
                if stage != Stage::Idle {
                    info!(%stage, "Stage");
                }
            }
            Ok(PipelineEvent::Finished { success, message }) => {
                eprintln!();
                if !success && !message.is_empty() {
                    warn!(reason = %message, "Run failed");
                }
            }
            Ok(PipelineEvent::TilePreview { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

const PROGRESS_BAR_WIDTH: usize = 30;
const DEFAULT_OUTPUT_SUBDIR: &str = "upscaled";

fn progress_line(percent: f32, message: &str, elapsed_secs: f64) -> String {
    let fraction = (percent as f64 / 100.0).clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    format!(
        "[{}{}] {:5.1}% | {} | Elapsed: {}",
        "█".repeat(filled),
        "░".repeat(empty),
        fraction * 100.0,
        message,
        format_duration(elapsed_secs)
    )
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// `upscaled/` inside the input directory, or beside the input file.
fn default_output_dir(input: &Path) -> PathBuf {
    let base = if input.is_dir() {
        input.to_path_buf()
    } else {
        match input.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    };
    base.join(DEFAULT_OUTPUT_SUBDIR)
}

fn default_preview_output(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "preview".to_string());
    source.with_file_name(format!("{stem}_preview.png"))
}

fn list_models(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    let mut registry = ModelRegistry::new(resolve_relative_to(data_dir, &config.paths.models_dir));
    registry.discover()?;

    if registry.list().is_empty() {
        eprintln!("No models in {}", registry.models_dir().display());
        return Ok(());
    }
    for entry in registry.list() {
        let scale = entry
            .scale_hint
            .map(|s| format!("{s}x"))
            .unwrap_or_else(|| "?".to_string());
        let precision = if entry.is_fp16 { "fp16" } else { "fp32" };
        println!("{:<40} {:>4} {}  {}", entry.name, scale, precision, entry.filename);
    }
    Ok(())
}

fn show_config(data_dir: &Path) -> Result<()> {
    let config = load_config(data_dir)?;
    println!("# {}", config_path(data_dir).display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    if let Err(error) = UpscaleSettings::from_store(&config) {
        warn!(%error, "Configuration is not usable for upscaling");
    }
    Ok(())
}
