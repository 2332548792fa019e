use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::backend::InferenceBackend;
use tilescale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tilescale_core::logging::{self, LogFilter, DEFAULT_LOG_FILTER};
use tilescale_core::upscaler::TileSize;
use tilescale_core::{
    FixedScaleOptions, FixedScaleUpscaler, RgbImage, Upscaler, VariableScaleOptions,
    VariableScaleUpscaler,
};

#[derive(Parser)]
#[command(name = "tilescale", about = "Tiled GPU super-resolution engine")]
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
    /// List the configured compute devices.
    Devices(DevicesArgs),
    /// Run synthetic frames through an upscaler and report timings.
    Bench(BenchArgs),
}

#[derive(Args)]
struct DevicesArgs {
    #[arg(long, help = "Print JSON instead of a table")]
    json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum EngineKind {
    /// 4x RealESRGAN family.
    Fixed,
    /// 1x/2x waifu2x family with noise reduction.
    Variable,
}

#[derive(Args)]
struct BenchArgs {
    #[arg(long, value_enum, default_value_t = EngineKind::Variable)]
    engine: EngineKind,
    #[arg(long, help = "TOML file with upscaler options")]
    preset: Option<PathBuf>,
    #[arg(long, help = "Override the configured backend (cuda, tensorrt, reference)")]
    backend: Option<String>,
    #[arg(long, default_value_t = 256)]
    width: usize,
    #[arg(long, default_value_t = 256)]
    height: usize,
    #[arg(long, default_value_t = 5)]
    frames: usize,
    #[arg(long, help = "Tile size, 0 for automatic")]
    tile_size: Option<usize>,
    #[arg(long)]
    device: Option<usize>,
    #[arg(long)]
    tta: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Serialize)]
struct DeviceRow {
    index: usize,
    name: String,
    heap_budget_mb: usize,
    compute_queue_count: usize,
    transfer_queue_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct BenchReport {
    engine: EngineKind,
    backend: String,
    input: (usize, usize),
    output: (usize, usize),
    tile: (usize, usize),
    tta: bool,
    frames: usize,
    tiles_per_frame: usize,
    inferences_per_frame: usize,
    mean_ms: f64,
    min_ms: f64,
    max_ms: f64,
    fps: f64,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Devices(args) => list_devices(&config, args.json),
        Commands::Bench(args) => run_bench(config, &resolved_data_dir, args),
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = LogFilter::select(cli_log_filter, verbose, rust_log.as_deref());
    let (file_layer, log_dir, file_error) = match logging::open_log_file(data_dir) {
        Ok(log) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(log.appender),
            ),
            Some(log.dir),
            None,
        ),
        Err(error) => (None, None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(parse_env_filter_with_fallback(&filter.directives))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. \
             Continuing without structured tracing."
        );
        return;
    }

    debug!(
        filter = %filter.directives,
        source = ?filter.source,
        log_dir = ?log_dir,
        "Logging initialized"
    );
    if let Some(error) = file_error {
        warn!(
            error = %format!("{error:#}"),
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn device_rows(config: &AppConfig) -> Vec<DeviceRow> {
    config
        .devices
        .iter()
        .enumerate()
        .map(|(index, info)| DeviceRow {
            index,
            name: info.name.clone(),
            heap_budget_mb: info.heap_budget_mb,
            compute_queue_count: info.compute_queue_count,
            transfer_queue_count: info.transfer_queue_count,
        })
        .collect()
}

fn list_devices(config: &AppConfig, json: bool) -> Result<()> {
    let rows = device_rows(config);
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No devices configured");
        return Ok(());
    }
    println!("{:>3}  {:<16} {:>10} {:>8} {:>9}", "#", "name", "heap MiB", "compute", "transfer");
    for row in rows {
        println!(
            "{:>3}  {:<16} {:>10} {:>8} {:>9}",
            row.index,
            row.name,
            row.heap_budget_mb,
            row.compute_queue_count,
            row.transfer_queue_count
        );
    }
    Ok(())
}

fn read_preset<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read preset: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse preset TOML: {}", path.display()))
}

fn build_upscaler(
    config: &AppConfig,
    data_dir: &Path,
    args: &BenchArgs,
) -> Result<Box<dyn Upscaler>> {
    let instance = config.gpu_instance();
    let models_root = config.models_root(data_dir);
    let loader = config.operator_loader(data_dir);
    debug!(
        models_root = %models_root.display(),
        backend = %config.inference.backend,
        "Building upscaler"
    );

    let upscaler: Box<dyn Upscaler> = match args.engine {
        EngineKind::Fixed => {
            let mut options: FixedScaleOptions = read_preset(args.preset.as_deref())?;
            if let Some(tile) = args.tile_size {
                options.tile_size = TileSize::from(tile);
            }
            if let Some(device) = args.device {
                options.device_index = device;
            }
            options.tta |= args.tta;
            Box::new(FixedScaleUpscaler::new(&instance, &models_root, &options, loader.as_ref())?)
        }
        EngineKind::Variable => {
            let mut options: VariableScaleOptions = read_preset(args.preset.as_deref())?;
            if let Some(tile) = args.tile_size {
                options.tile_size = TileSize::from(tile);
            }
            if let Some(device) = args.device {
                options.device_index = device;
            }
            options.tta |= args.tta;
            Box::new(VariableScaleUpscaler::new(
                &instance,
                &models_root,
                &options,
                loader.as_ref(),
            )?)
        }
    };
    Ok(upscaler)
}

/// Deterministic test pattern that changes from frame to frame.
fn synthetic_frame(width: usize, height: usize, frame: usize) -> RgbImage {
    RgbImage::from_fn(width, height, |c, x, y| {
        let v = (x * 3 + y * 5 + c * 61 + frame * 17) % 256;
        v as f32 / 255.0
    })
}

fn summarize(frame_ms: &[f64]) -> (f64, f64, f64, f64) {
    if frame_ms.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let total: f64 = frame_ms.iter().sum();
    let mean = total / frame_ms.len() as f64;
    let min = frame_ms.iter().copied().fold(f64::INFINITY, f64::min);
    let max = frame_ms.iter().copied().fold(0.0, f64::max);
    let fps = if total > 0.0 {
        frame_ms.len() as f64 * 1000.0 / total
    } else {
        0.0
    };
    (mean, min, max, fps)
}

fn run_bench(mut config: AppConfig, data_dir: &Path, args: BenchArgs) -> Result<()> {
    if args.width == 0 || args.height == 0 {
        bail!("--width and --height must be positive");
    }
    if let Some(backend) = args.backend.as_deref() {
        config.inference.backend = InferenceBackend::from_str_lossy(backend);
    }
    let upscaler = build_upscaler(&config, data_dir, &args)?;
    let upscaler_config = *upscaler.config();
    let (out_w, out_h) = upscaler.output_size(args.width, args.height);
    info!(
        engine = ?args.engine,
        backend = %config.inference.backend,
        width = args.width,
        height = args.height,
        out_width = out_w,
        out_height = out_h,
        tile_w = upscaler_config.tile_w,
        tile_h = upscaler_config.tile_h,
        frames = args.frames,
        "Starting benchmark"
    );

    let mut output = RgbImage::new(out_w, out_h);
    let mut frame_ms = Vec::with_capacity(args.frames);
    let mut last_stats = None;
    for frame in 0..args.frames {
        let input = synthetic_frame(args.width, args.height, frame);
        let started = Instant::now();
        let stats = upscaler
            .process_with_stats(&input.as_frame(), &mut output.as_frame_mut())
            .with_context(|| format!("frame {frame} failed"))?;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        debug!(frame, elapsed_ms = elapsed, tiles = stats.tiles, "Frame processed");
        frame_ms.push(elapsed);
        last_stats = Some(stats);
    }

    let (mean_ms, min_ms, max_ms, fps) = summarize(&frame_ms);
    let stats = last_stats.unwrap_or_default();
    let report = BenchReport {
        engine: args.engine,
        backend: config.inference.backend.to_string(),
        input: (args.width, args.height),
        output: (out_w, out_h),
        tile: (upscaler_config.tile_w, upscaler_config.tile_h),
        tta: upscaler_config.tta,
        frames: args.frames,
        tiles_per_frame: stats.tiles,
        inferences_per_frame: stats.inferences,
        mean_ms,
        min_ms,
        max_ms,
        fps,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}x{} -> {}x{} | {} frames | {} tiles/frame | \
             mean {:.2} ms | min {:.2} ms | max {:.2} ms | {:.2} fps",
            args.width,
            args.height,
            out_w,
            out_h,
            report.frames,
            report.tiles_per_frame,
            mean_ms,
            min_ms,
            max_ms,
            fps
        );
    }
    Ok(())
}
