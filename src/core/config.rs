//! Pipeline configuration for tumulus
//!
//! A single immutable configuration is built once (by the CLI or a library
//! caller) and threaded through tiling, detection and clustering.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{Error, Result};
use crate::core::raster::Crs;

/// Default square tile edge in pixels
pub const DEFAULT_TILE_SIZE: u32 = 512;

/// Default overlap in pixels; mound symbols are 20-30px across
pub const DEFAULT_OVERLAP: u32 = 64;

/// Default deduplication distance in CRS units (metres for projected CRSs)
pub const DEFAULT_DEDUP_DISTANCE_M: f64 = 20.0;

/// Progress callback receiving `(done, total)` work units
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Settings shared by every stage of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Tile edge length in pixels
    pub tile_size: u32,

    /// Shared margin between neighbouring tiles in pixels
    pub overlap: u32,

    /// Clustering threshold; buffers of half this radius are unioned
    pub dedup_distance_m: f64,

    /// Persist ledger and features after this many processed tiles
    pub checkpoint_interval: usize,

    /// Maximum number of new tiles handled in one invocation
    pub max_tiles: Option<usize>,

    /// Fixed pause after every oracle call (rate limiting)
    pub request_delay: Duration,

    /// Extra pause after a transport failure
    pub error_backoff: Duration,

    /// CRS assigned to feature collections that carry none
    pub default_crs: Option<Crs>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
            dedup_distance_m: DEFAULT_DEDUP_DISTANCE_M,
            checkpoint_interval: 10,
            max_tiles: None,
            request_delay: Duration::from_secs(10),
            error_backoff: Duration::from_secs(20),
            default_crs: None,
        }
    }
}

impl PipelineConfig {
    /// Stride between consecutive tile origins
    pub fn step(&self) -> u32 {
        self.tile_size - self.overlap
    }

    /// Reject settings that would make any stage misbehave
    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(Error::InvalidConfig("tile size must be positive".to_string()));
        }
        if self.overlap >= self.tile_size {
            return Err(Error::InvalidConfig(format!(
                "overlap ({}) must be smaller than tile size ({})",
                self.overlap, self.tile_size
            )));
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::InvalidConfig(
                "checkpoint interval must be at least 1".to_string(),
            ));
        }
        if !self.dedup_distance_m.is_finite() || self.dedup_distance_m <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "dedup distance must be a positive number, got {}",
                self.dedup_distance_m
            )));
        }
        Ok(())
    }
}

/// On-disk layout of a pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePaths {
    /// Directory holding the input rasters
    pub inputs_dir: PathBuf,

    /// Directory receiving one sub-directory of tiles per raster
    pub tiles_dir: PathBuf,

    /// Ledger file, doubling as the raw-results export
    pub ledger_file: PathBuf,

    /// Accumulated raw detection boxes
    pub raw_features_file: PathBuf,

    /// Deduplicated mound points
    pub dedup_file: PathBuf,
}

impl PipelinePaths {
    /// Standard layout under a project root: `inputs/` and `outputs/`
    pub fn under(root: &Path) -> Self {
        Self::new(&root.join("inputs"), &root.join("outputs"))
    }

    /// Layout with explicit input and output directories
    pub fn new(inputs_dir: &Path, outputs_dir: &Path) -> Self {
        Self {
            inputs_dir: inputs_dir.to_path_buf(),
            tiles_dir: outputs_dir.join("tiles"),
            ledger_file: outputs_dir.join("all_detections.json"),
            raw_features_file: outputs_dir.join("all_detections.geojson"),
            dedup_file: outputs_dir.join("mounds.geojson"),
        }
    }
}
