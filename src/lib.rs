//! # Tumulus Library
//!
//! Finds burial mound symbols on scanned topographic maps and turns them into
//! georeferenced points.
//!
//! ## Pipeline
//!
//! - **Tile**: split every GeoTIFF into overlapping PNG tiles with world-file
//!   and CRS sidecars
//! - **Detect**: send each tile to a vision oracle, resumably, and map the
//!   returned boxes into map coordinates
//! - **Dedupe**: merge detections repeated across tile overlaps into one point
//!   per mound
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use tumulus::{OracleConfig, PipelineConfig, PipelinePaths};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let paths = PipelinePaths::under(Path::new("."));
//!     let config = PipelineConfig::default();
//!
//!     tumulus::tile(&paths, &config, None)?;
//!
//!     let oracle = OracleConfig {
//!         api_key: std::env::var("GOOGLE_API_KEY").ok(),
//!         ..Default::default()
//!     };
//!     tumulus::detect_with_gemini(oracle, &paths, &config, false, None).await?;
//!
//!     tumulus::dedupe(&paths, &config)?;
//!     Ok(())
//! }
//! ```
//!
//! Interrupted detection runs resume from the last checkpoint. Running two
//! detections against the same output directory at once is not supported;
//! the last writer wins.

// Re-export core types that users might need
pub use crate::core::catalog::{TileCatalog, TileRecord};
pub use crate::core::cluster::{DeduplicatedPoint, DetectionClusterer};
pub use crate::core::config::{
    PipelineConfig, PipelinePaths, ProgressCallback, DEFAULT_DEDUP_DISTANCE_M, DEFAULT_OVERLAP,
    DEFAULT_TILE_SIZE,
};
pub use crate::core::error::{Error, Result};
pub use crate::core::geojson::{dedupe_file, read_features, write_features, write_points};
pub use crate::core::ledger::{CheckpointStore, LedgerEntry, ProcessingLedger};
pub use crate::core::mapper::{
    map_detection, map_tile_detections, FeatureProperties, GeoFeature, RawDetection, TileGeoref,
};
pub use crate::core::oracle::{
    parse_detection_payload, DetectionOracle, GeminiOracle, OracleConfig, TileOutcome,
    API_KEY_ENV, DEFAULT_MODEL, DETECTION_PROMPT, SYSTEM_INSTRUCTION,
};
pub use crate::core::raster::{open_raster, Crs, InMemoryRaster, PixelWindow, RasterSource};
pub use crate::core::runner::{plan_run, BatchRunner, RunPlan, RunSummary};
pub use crate::core::tiler::{
    find_rasters, plan_windows, TileInfo, TileSet, TileWindow, Tiler, TilingReport,
};
pub use crate::core::transform::AffineGeoTransform;

// Internal modules
mod core;

/// Tile every raster in `paths.inputs_dir` into `paths.tiles_dir`
///
/// Rasters that fail are listed in the report; only invalid settings or an
/// unreadable input directory are errors.
pub fn tile(
    paths: &PipelinePaths,
    config: &PipelineConfig,
    progress: Option<ProgressCallback>,
) -> Result<TilingReport> {
    let tiler = Tiler::new(config.clone())?;
    tiler.tile_directory(&paths.inputs_dir, &paths.tiles_dir, progress.as_ref())
}

/// Run the oracle over every tile not yet in the ledger
///
/// With `retry_errors`, ledgered error entries are removed first so those
/// tiles are sent again.
pub async fn detect<O: DetectionOracle>(
    oracle: O,
    paths: &PipelinePaths,
    config: &PipelineConfig,
    retry_errors: bool,
    progress: Option<ProgressCallback>,
) -> Result<RunSummary> {
    let catalog = TileCatalog::scan(&paths.tiles_dir)?;
    if retry_errors {
        clear_ledger_errors(paths)?;
    }

    let store = CheckpointStore::new(&paths.ledger_file, &paths.raw_features_file);
    let runner = BatchRunner::new(oracle, config.clone(), store)?;
    runner.run(&catalog, progress.as_ref()).await
}

/// [`detect`] with the Gemini REST oracle
///
/// Fails with [`Error::MissingCredentials`] before touching any file when no
/// API key is configured.
pub async fn detect_with_gemini(
    oracle_config: OracleConfig,
    paths: &PipelinePaths,
    config: &PipelineConfig,
    retry_errors: bool,
    progress: Option<ProgressCallback>,
) -> Result<RunSummary> {
    let oracle = GeminiOracle::new(oracle_config)?;
    detect(oracle, paths, config, retry_errors, progress).await
}

/// What [`detect`] would send, without calling the oracle or touching the ledger
///
/// With `retry_errors`, ledgered error tiles count as pending.
pub fn plan_detection(
    paths: &PipelinePaths,
    config: &PipelineConfig,
    retry_errors: bool,
) -> Result<RunPlan> {
    let catalog = TileCatalog::scan(&paths.tiles_dir)?;
    let mut ledger = ProcessingLedger::load(&paths.ledger_file)?;
    if retry_errors {
        ledger.clear_errors();
    }
    Ok(plan_run(&catalog, &ledger, config.max_tiles))
}

/// Remove error entries from the ledger; returns how many were removed
pub fn clear_ledger_errors(paths: &PipelinePaths) -> Result<usize> {
    let mut ledger = ProcessingLedger::load(&paths.ledger_file)?;
    let cleared = ledger.clear_errors();
    if cleared > 0 {
        ledger.save(&paths.ledger_file)?;
        log::info!("Cleared {cleared} error entries for retry");
    }
    Ok(cleared)
}

/// Merge the raw detections into deduplicated mound points
///
/// Returns `(raw detections, unique mounds)`.
pub fn dedupe(paths: &PipelinePaths, config: &PipelineConfig) -> Result<(usize, usize)> {
    config.validate()?;
    let clusterer = DetectionClusterer::new(config.dedup_distance_m)?
        .with_default_crs(config.default_crs.clone());
    dedupe_file(
        &paths.raw_features_file,
        &paths.dedup_file,
        &clusterer,
        config.default_crs.as_ref(),
    )
}
