//! Raster tiling for tumulus
//!
//! Splits a raster into fixed-size overlapping windows and writes, per window,
//! a PNG tile, a pixel-centre world file (`.pgw`) and a PAM sidecar holding the
//! CRS (`.png.aux.xml`). Each map also gets a `metadata.json` lookup of
//! `tile_filename -> [lower_left_x, lower_left_y, res_x, res_y]`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use log::{debug, error, info, warn};

use crate::core::config::{PipelineConfig, ProgressCallback};
use crate::core::error::{Error, Result};
use crate::core::raster::{open_raster, Crs, RasterSource};
use crate::core::transform::AffineGeoTransform;

/// Name of the per-map legacy lookup table
pub const METADATA_FILE: &str = "metadata.json";

/// Value written for pixels outside the raster
const FILL_VALUE: u8 = 0;

/// Source-pixel origin of one tile window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWindow {
    pub col: u32,
    pub row: u32,
}

/// A written tile and its georeferencing
#[derive(Debug, Clone, PartialEq)]
pub struct TileInfo {
    pub name: String,
    pub path: PathBuf,
    pub window: TileWindow,
    /// Corner-anchored transform of the tile
    pub transform: AffineGeoTransform,
    /// `[lower_left_x, lower_left_y, res_x, res_y]`
    pub lower_left: [f64; 4],
}

/// All tiles written for one raster
#[derive(Debug, Clone)]
pub struct TileSet {
    pub map_name: String,
    pub directory: PathBuf,
    pub tiles: Vec<TileInfo>,
}

/// Outcome of tiling a directory of rasters
#[derive(Debug, Default)]
pub struct TilingReport {
    /// `(map name, tile count)` for every raster tiled
    pub tiled: Vec<(String, usize)>,
    /// `(raster path, reason)` for every raster skipped
    pub failed: Vec<(PathBuf, String)>,
}

impl TilingReport {
    pub fn total_tiles(&self) -> usize {
        self.tiled.iter().map(|(_, count)| count).sum()
    }
}

/// Window origins covering `[0, width) x [0, height)`, rows first then columns.
///
/// Origins are multiples of `tile_size - overlap` strictly inside the raster;
/// the last window on each axis may extend past the edge.
pub fn plan_windows(width: u32, height: u32, config: &PipelineConfig) -> Result<Vec<TileWindow>> {
    config.validate()?;
    let step = config.step() as usize;

    let windows = (0..height)
        .step_by(step)
        .flat_map(|row| (0..width).step_by(step).map(move |col| TileWindow { col, row }))
        .collect();
    Ok(windows)
}

/// Tile filename: `<map>_x<col>_y<row>.png`
pub fn tile_name(map_name: &str, window: TileWindow) -> String {
    format!("{map_name}_x{}_y{}.png", window.col, window.row)
}

/// Minimal PAM dataset so GIS viewers pick up the CRS of a PNG tile
pub fn pam_xml(crs: &Crs) -> String {
    format!("<PAMDataset>\n  <SRS>{crs}</SRS>\n</PAMDataset>\n")
}

/// Splits rasters into georeferenced tiles
pub struct Tiler {
    config: PipelineConfig,
}

impl Tiler {
    /// Create a tiler; fails on invalid tile/overlap sizing
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Tile one raster into `tiles_dir/<map_name>/`.
    ///
    /// Existing files are overwritten; nothing is skipped.
    pub fn tile_raster(
        &self,
        raster: &dyn RasterSource,
        map_name: &str,
        tiles_dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<TileSet> {
        let transform = raster.transform();
        transform.validate()?;

        let windows = plan_windows(raster.width(), raster.height(), &self.config)?;
        let directory = tiles_dir.join(map_name);
        fs::create_dir_all(&directory)?;

        info!(
            "Processing {} tiles for {map_name} ({}x{} px)",
            windows.len(),
            raster.width(),
            raster.height()
        );
        if raster.crs().is_none() {
            warn!("{map_name} has no CRS; skipping .aux.xml sidecars");
        }

        let size = self.config.tile_size;
        let total = windows.len() as u64;
        let mut tiles = Vec::with_capacity(windows.len());
        let mut metadata = BTreeMap::new();

        for (index, window) in windows.into_iter().enumerate() {
            let pixels = raster.read_window(
                window.col as i64,
                window.row as i64,
                size,
                size,
                FILL_VALUE,
            )?;
            let image = RgbImage::from_raw(size, size, pixels.to_rgb()).ok_or_else(|| {
                Error::ImageError(format!("pixel buffer does not match {size}x{size} RGB"))
            })?;

            let name = tile_name(map_name, window);
            let path = directory.join(&name);
            image.save(&path)?;

            let tile_transform = transform.for_window(window.col as f64, window.row as f64);
            fs::write(path.with_extension("pgw"), tile_transform.to_world_file())?;
            if let Some(crs) = raster.crs() {
                fs::write(path.with_extension("png.aux.xml"), pam_xml(crs))?;
            }

            let (left, bottom, _, _) = tile_transform.bounds(size as f64, size as f64);
            let (res_x, res_y) = tile_transform.resolution();
            let lower_left = [left, bottom, res_x, res_y];
            metadata.insert(name.clone(), lower_left);

            debug!("Wrote tile {name}");
            tiles.push(TileInfo {
                name,
                path,
                window,
                transform: tile_transform,
                lower_left,
            });

            if let Some(progress) = progress {
                progress(index as u64 + 1, total);
            }
        }

        let metadata_file = fs::File::create(directory.join(METADATA_FILE))?;
        serde_json::to_writer_pretty(metadata_file, &metadata)?;

        info!(
            "Finished tiling {map_name}: {} tiles in {}",
            tiles.len(),
            directory.display()
        );
        Ok(TileSet {
            map_name: map_name.to_string(),
            directory,
            tiles,
        })
    }

    /// Tile every GeoTIFF in `inputs_dir`; failing rasters are logged and skipped
    pub fn tile_directory(
        &self,
        inputs_dir: &Path,
        tiles_dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<TilingReport> {
        let rasters = find_rasters(inputs_dir)?;
        let mut report = TilingReport::default();

        if rasters.is_empty() {
            warn!("No .tif files found in {}", inputs_dir.display());
            return Ok(report);
        }

        for path in rasters {
            let map_name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!("Starting {}...", path.display());

            let result = open_raster(&path)
                .and_then(|raster| self.tile_raster(&raster, &map_name, tiles_dir, progress));
            match result {
                Ok(tile_set) => report.tiled.push((map_name, tile_set.tiles.len())),
                Err(e) => {
                    error!("Error processing {}: {e}", path.display());
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

/// Sorted `*.tif` / `*.tiff` files directly inside `dir`
pub fn find_rasters(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut rasters = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tiff = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"));
        if path.is_file() && is_tiff {
            rasters.push(path);
        }
    }
    rasters.sort();
    Ok(rasters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raster::InMemoryRaster;
    use tempfile::tempdir;

    fn config(tile_size: u32, overlap: u32) -> PipelineConfig {
        PipelineConfig {
            tile_size,
            overlap,
            ..Default::default()
        }
    }

    fn test_raster(width: u32, height: u32, bands: usize) -> InMemoryRaster {
        InMemoryRaster::new(
            width,
            height,
            bands,
            vec![200; (width * height) as usize * bands],
            AffineGeoTransform::north_up(500_000.0, 4_650_000.0, 2.0, 2.0),
            Some(Crs::from_epsg(32635)),
        )
        .unwrap()
    }

    /// Every pixel is inside some window and consecutive windows share `overlap` pixels
    fn assert_covers(width: u32, height: u32, tile: u32, overlap: u32) {
        let windows = plan_windows(width, height, &config(tile, overlap)).unwrap();
        let mut cols: Vec<u32> = windows.iter().map(|w| w.col).collect();
        let mut rows: Vec<u32> = windows.iter().map(|w| w.row).collect();
        cols.sort();
        cols.dedup();
        rows.sort();
        rows.dedup();

        for axis in [(&cols, width), (&rows, height)] {
            let (origins, extent) = axis;
            assert_eq!(origins[0], 0);
            for pair in origins.windows(2) {
                assert_eq!(pair[0] + tile - pair[1], overlap, "overlap between {pair:?}");
            }
            let last = *origins.last().unwrap();
            assert!(last < extent);
            assert!(last + tile >= extent, "gap at the far edge");
        }
        assert_eq!(windows.len(), cols.len() * rows.len());
    }

    #[test]
    fn test_plan_windows_coverage() {
        assert_covers(1000, 700, 512, 64);
        assert_covers(448, 448, 512, 64);
        assert_covers(449, 1, 512, 64);
        assert_covers(2048, 2048, 256, 0);
        assert_covers(31, 77, 10, 9);
    }

    #[test]
    fn test_plan_windows_order_is_row_major() {
        let windows = plan_windows(1000, 500, &config(512, 64)).unwrap();
        let origins: Vec<(u32, u32)> = windows.iter().map(|w| (w.col, w.row)).collect();
        assert_eq!(
            origins,
            vec![(0, 0), (448, 0), (896, 0), (0, 448), (448, 448), (896, 448)]
        );
    }

    #[test]
    fn test_plan_windows_rejects_bad_overlap() {
        assert!(plan_windows(100, 100, &config(64, 64)).is_err());
        assert!(Tiler::new(config(64, 100)).is_err());
    }

    #[test]
    fn test_plan_windows_empty_raster() {
        assert!(plan_windows(0, 100, &config(64, 8)).unwrap().is_empty());
    }

    #[test]
    fn test_tile_name_format() {
        let name = tile_name("K-35-107", TileWindow { col: 448, row: 896 });
        assert_eq!(name, "K-35-107_x448_y896.png");
    }

    #[test]
    fn test_tile_raster_writes_sidecars() {
        let dir = tempdir().unwrap();
        let tiler = Tiler::new(config(64, 16)).unwrap();
        let raster = test_raster(100, 70, 1);

        let tile_set = tiler.tile_raster(&raster, "map", dir.path(), None).unwrap();
        // origins 0, 48, 96 across and 0, 48 down
        assert_eq!(tile_set.tiles.len(), 6);

        let last = tile_set.tiles.last().unwrap();
        assert_eq!(last.name, "map_x96_y48.png");
        assert!(last.path.exists());

        let decoded = image::open(&last.path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (64, 64));
        // (0,0) is inside the raster; (63,63) lies beyond both edges
        assert_eq!(decoded.get_pixel(0, 0).0, [200, 200, 200]);
        assert_eq!(decoded.get_pixel(63, 63).0, [0, 0, 0]);

        let pgw = fs::read_to_string(dir.path().join("map/map_x96_y48.pgw")).unwrap();
        let parsed = AffineGeoTransform::from_world_file(&pgw).unwrap();
        assert!((parsed.c - (500_000.0 + 96.0 * 2.0)).abs() < 1e-9);
        assert!((parsed.f - (4_650_000.0 - 48.0 * 2.0)).abs() < 1e-9);

        let aux = fs::read_to_string(dir.path().join("map/map_x96_y48.png.aux.xml")).unwrap();
        assert!(aux.contains("<SRS>EPSG:32635</SRS>"));
    }

    #[test]
    fn test_tile_raster_metadata_lower_left() {
        let dir = tempdir().unwrap();
        let tiler = Tiler::new(config(64, 16)).unwrap();
        let raster = test_raster(100, 70, 3);
        tiler.tile_raster(&raster, "map", dir.path(), None).unwrap();

        let text = fs::read_to_string(dir.path().join("map").join(METADATA_FILE)).unwrap();
        let metadata: BTreeMap<String, [f64; 4]> = serde_json::from_str(&text).unwrap();
        assert_eq!(metadata.len(), 6);

        let [ll_x, ll_y, res_x, res_y] = metadata["map_x48_y0.png"];
        assert!((ll_x - 500_096.0).abs() < 1e-9);
        assert!((ll_y - (4_650_000.0 - 128.0)).abs() < 1e-9);
        assert_eq!((res_x, res_y), (2.0, 2.0));
    }

    #[test]
    fn test_tile_raster_rejects_zero_resolution() {
        let dir = tempdir().unwrap();
        let tiler = Tiler::new(config(64, 16)).unwrap();
        let raster = InMemoryRaster::new(
            10,
            10,
            1,
            vec![0; 100],
            AffineGeoTransform::new(0.0, 0.0, 0.0, 0.0, -1.0, 0.0),
            None,
        )
        .unwrap();
        let result = tiler.tile_raster(&raster, "flat", dir.path(), None);
        assert!(matches!(result, Err(Error::InvalidTransform(_))));
    }

    #[test]
    fn test_tile_raster_reports_progress() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let dir = tempdir().unwrap();
        let tiler = Tiler::new(config(64, 0)).unwrap();
        let raster = test_raster(128, 64, 1);

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let progress: ProgressCallback = Arc::new(move |done, total| {
            assert_eq!(total, 2);
            seen_clone.store(done, Ordering::SeqCst);
        });
        tiler.tile_raster(&raster, "p", dir.path(), Some(&progress)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tile_directory_skips_broken_rasters() {
        let inputs = tempdir().unwrap();
        let tiles = tempdir().unwrap();
        fs::write(inputs.path().join("broken.tif"), b"not a tiff").unwrap();
        fs::write(inputs.path().join("notes.txt"), b"ignored").unwrap();

        let tiler = Tiler::new(PipelineConfig::default()).unwrap();
        let report = tiler.tile_directory(inputs.path(), tiles.path(), None).unwrap();
        assert!(report.tiled.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("broken.tif"));
    }

    #[test]
    fn test_tile_directory_empty() {
        let inputs = tempdir().unwrap();
        let tiles = tempdir().unwrap();
        let tiler = Tiler::new(PipelineConfig::default()).unwrap();
        let report = tiler.tile_directory(inputs.path(), tiles.path(), None).unwrap();
        assert_eq!(report.total_tiles(), 0);
        assert!(report.failed.is_empty());
    }
}
