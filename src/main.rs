//! # Tumulus CLI
//!
//! Command-line interface for the tumulus library.
//! Tiles scanned maps, runs mound detection and merges duplicate detections.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::error;
use tumulus::{
    Crs, OracleConfig, PipelineConfig, PipelinePaths, API_KEY_ENV, DEFAULT_DEDUP_DISTANCE_M,
    DEFAULT_MODEL, DEFAULT_OVERLAP, DEFAULT_TILE_SIZE,
};

mod cli;

/// Command-line interface for tumulus
#[derive(Parser)]
#[command(name = "tumulus")]
#[command(about = "Burial mound detection on scanned topographic maps")]
#[command(long_about = "Finds burial mound symbols on georeferenced map scans:
  tumulus tile                     # Split inputs/*.tif into outputs/tiles/
  tumulus detect                   # Send new tiles to the detection model
  tumulus detect --retry-errors    # Also resend tiles whose reply was unusable
  tumulus dedupe                   # Merge duplicates into outputs/mounds.geojson
  tumulus run                      # All three steps in order

Detection resumes from outputs/all_detections.json; interrupted runs
lose at most one checkpoint interval. The API key is read from
GOOGLE_API_KEY unless --api-key is given.")]
#[command(version = env!("TUMULUS_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Project root containing inputs/ and outputs/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Directory of input GeoTIFFs (default: <root>/inputs)
    #[arg(long, global = true)]
    inputs: Option<PathBuf>,

    /// Output directory (default: <root>/outputs)
    #[arg(long, global = true)]
    outputs: Option<PathBuf>,

    /// Show what would be done without writing anything or calling the model
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Split input rasters into georeferenced PNG tiles
    Tile(GridArgs),

    /// Run the detection model over tiles not yet processed
    Detect {
        #[command(flatten)]
        grid: GridArgs,
        #[command(flatten)]
        detect: DetectArgs,
    },

    /// Merge duplicate detections into one point per mound
    Dedupe(DedupeArgs),

    /// Tile, detect and dedupe in one go
    Run {
        #[command(flatten)]
        grid: GridArgs,
        #[command(flatten)]
        detect: DetectArgs,
        #[command(flatten)]
        dedupe: DedupeArgs,
    },
}

#[derive(Args, Clone)]
struct GridArgs {
    /// Tile edge length in pixels
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    tile_size: u32,

    /// Overlap between neighbouring tiles in pixels
    #[arg(long, default_value_t = DEFAULT_OVERLAP)]
    overlap: u32,
}

#[derive(Args, Clone)]
struct DetectArgs {
    /// Gemini API key
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Gemini model name
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Stop after this many new tiles
    #[arg(long)]
    max_tiles: Option<usize>,

    /// Seconds to wait after every model call
    #[arg(long, default_value_t = 10.0)]
    delay: f64,

    /// Extra seconds to wait after a failed call
    #[arg(long, default_value_t = 20.0)]
    error_backoff: f64,

    /// Save progress every N tiles
    #[arg(long, default_value_t = 10)]
    checkpoint_every: usize,

    /// Clear ledgered error entries so those tiles are sent again
    #[arg(long)]
    retry_errors: bool,
}

#[derive(Args, Clone)]
struct DedupeArgs {
    /// Merge distance in CRS units (metres for UTM)
    #[arg(long, default_value_t = DEFAULT_DEDUP_DISTANCE_M)]
    distance: f64,

    /// CRS assumed when the detections carry none
    #[arg(long, default_value = "EPSG:32635")]
    default_crs: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr; RUST_LOG still wins when set
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    if cli.verbose {
        eprintln!("🏺 Tumulus v{} starting...", env!("TUMULUS_VERSION"));
    }

    let paths = resolve_paths(&cli);

    match &cli.command {
        Command::Tile(grid) => {
            let config = build_config(Some(grid), None, None)?;
            tile(&paths, &config, cli.dry_run)?;
        }
        Command::Detect { grid, detect } => {
            let config = build_config(Some(grid), Some(detect), None)?;
            if !cli.dry_run {
                require_api_key(detect)?;
            }
            run_detection(&paths, &config, detect, cli.dry_run).await?;
        }
        Command::Dedupe(dedupe) => {
            let config = build_config(None, None, Some(dedupe))?;
            deduplicate(&paths, &config, cli.dry_run)?;
        }
        Command::Run {
            grid,
            detect,
            dedupe,
        } => {
            let config = build_config(Some(grid), Some(detect), Some(dedupe))?;
            // Credentials are checked before any tile is written
            if !cli.dry_run {
                require_api_key(detect)?;
            }
            tile(&paths, &config, cli.dry_run)?;
            run_detection(&paths, &config, detect, cli.dry_run).await?;
            deduplicate(&paths, &config, cli.dry_run)?;
        }
    }

    Ok(())
}

/// Resolve the input/output layout from the root and explicit overrides
fn resolve_paths(cli: &Cli) -> PipelinePaths {
    let inputs = cli.inputs.clone().unwrap_or_else(|| cli.root.join("inputs"));
    let outputs = cli.outputs.clone().unwrap_or_else(|| cli.root.join("outputs"));
    PipelinePaths::new(&inputs, &outputs)
}

/// Build and validate the pipeline configuration before any work starts
fn build_config(
    grid: Option<&GridArgs>,
    detect: Option<&DetectArgs>,
    dedupe: Option<&DedupeArgs>,
) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::default();

    if let Some(grid) = grid {
        config.tile_size = grid.tile_size;
        config.overlap = grid.overlap;
    }
    if let Some(detect) = detect {
        config.max_tiles = detect.max_tiles;
        config.request_delay = seconds(detect.delay, "--delay")?;
        config.error_backoff = seconds(detect.error_backoff, "--error-backoff")?;
        config.checkpoint_interval = detect.checkpoint_every;
    }
    if let Some(dedupe) = dedupe {
        config.dedup_distance_m = dedupe.distance;
        config.default_crs = Some(Crs::new(dedupe.default_crs.clone()));
    }

    config.validate()?;
    Ok(config)
}

fn require_api_key(detect: &DetectArgs) -> anyhow::Result<()> {
    if detect.api_key.as_deref().map_or(true, |key| key.trim().is_empty()) {
        bail!("{API_KEY_ENV} is not set; export it or pass --api-key");
    }
    Ok(())
}

fn seconds(value: f64, flag: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{flag} must be a non-negative number of seconds"))
}

fn tile(paths: &PipelinePaths, config: &PipelineConfig, dry_run: bool) -> anyhow::Result<()> {
    let rasters = tumulus::find_rasters(&paths.inputs_dir)
        .with_context(|| format!("Cannot list {}", paths.inputs_dir.display()))?;

    if dry_run {
        eprintln!(
            "🔍 [DRY RUN] Would tile {} raster(s) into {} ({}px tiles, {}px overlap):",
            rasters.len(),
            paths.tiles_dir.display(),
            config.tile_size,
            config.overlap
        );
        for raster in &rasters {
            eprintln!("  {}", raster.display());
        }
        return Ok(());
    }

    eprintln!("🗺️  Tiling {} raster(s) from {}", rasters.len(), paths.inputs_dir.display());
    let progress = cli::ProgressManager::new(0, "✂️  Writing tiles");
    let report = tumulus::tile(paths, config, Some(progress.callback("✅ Raster tiled")))?;
    progress.pb.finish_and_clear();

    eprintln!(
        "✅ {} tiles from {} raster(s)",
        report.total_tiles(),
        report.tiled.len()
    );
    for (raster, reason) in &report.failed {
        eprintln!("⚠️  Skipped {}: {reason}", raster.display());
    }
    Ok(())
}

async fn run_detection(
    paths: &PipelinePaths,
    config: &PipelineConfig,
    detect: &DetectArgs,
    dry_run: bool,
) -> anyhow::Result<()> {
    if dry_run {
        let plan = match tumulus::plan_detection(paths, config, detect.retry_errors) {
            Ok(plan) => plan,
            // Tiles may not exist yet when `run --dry-run` is used
            Err(e) => {
                eprintln!("🔍 [DRY RUN] Would detect on tiles in {} ({e})", paths.tiles_dir.display());
                return Ok(());
            }
        };
        eprintln!(
            "🔍 [DRY RUN] Would send {} tile(s) to {} ({} already processed)",
            plan.pending.len(),
            detect.model,
            plan.already_done
        );
        for tile in &plan.pending {
            eprintln!("  {tile}");
        }
        return Ok(());
    }

    let oracle_config = OracleConfig {
        api_key: detect.api_key.clone(),
        model: detect.model.clone(),
        ..Default::default()
    };

    let progress = cli::ProgressManager::new(0, &format!("🔎 Detecting mounds with {}", detect.model));
    let summary = tumulus::detect_with_gemini(
        oracle_config,
        paths,
        config,
        detect.retry_errors,
        Some(progress.callback("✅ Detection pass completed!")),
    )
    .await
    .context("Detection run failed")?;
    progress.pb.finish_and_clear();

    eprintln!(
        "✅ {} new tile(s) processed, {} detection(s), {} unusable repl(ies), {} tile(s) left",
        summary.processed, summary.detections, summary.parse_errors, summary.remaining
    );
    if summary.transport_errors > 0 {
        eprintln!(
            "⚠️  {} tile(s) failed in transit and will be retried on the next run",
            summary.transport_errors
        );
    }
    eprintln!("📁 Results saved to {}", paths.ledger_file.display());
    Ok(())
}

fn deduplicate(paths: &PipelinePaths, config: &PipelineConfig, dry_run: bool) -> anyhow::Result<()> {
    if dry_run {
        eprintln!(
            "🔍 [DRY RUN] Would merge detections in {} within {} m into {}",
            paths.raw_features_file.display(),
            config.dedup_distance_m,
            paths.dedup_file.display()
        );
        return Ok(());
    }

    if !paths.raw_features_file.exists() {
        bail!(
            "{} not found; run `tumulus detect` first",
            paths.raw_features_file.display()
        );
    }

    let (raw, unique) = tumulus::dedupe(paths, config)
        .with_context(|| format!("Cannot deduplicate {}", paths.raw_features_file.display()))?;
    eprintln!("✅ Reduced {raw} detections to {unique} unique mounds");
    eprintln!("📁 Saved to {}", paths.dedup_file.display());
    Ok(())
}
