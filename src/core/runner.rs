//! Resumable detection runs
//!
//! Tiles are sent to the oracle one at a time in filename order. Outcomes go
//! into the ledger; the ledger and the accumulated features are checkpointed
//! every few tiles so an interrupted run resumes where it stopped.

use log::{debug, info, warn};

use crate::core::catalog::{TileCatalog, TileRecord};
use crate::core::config::{PipelineConfig, ProgressCallback};
use crate::core::error::Result;
use crate::core::geojson::common_crs;
use crate::core::ledger::{CheckpointStore, ProcessingLedger};
use crate::core::mapper::{map_tile_detections, GeoFeature};
use crate::core::oracle::{DetectionOracle, TileOutcome, DETECTION_PROMPT};
use crate::core::raster::Crs;

/// Counters for one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Tiles in the catalog
    pub total_tiles: usize,

    /// Tiles already ledgered when the run started
    pub already_done: usize,

    /// Tiles ledgered by this run, including error entries
    pub processed: usize,

    /// Georeferenced features added by this run
    pub detections: usize,

    /// Unusable replies ledgered as errors
    pub parse_errors: usize,

    /// Calls that failed in transport and stay pending
    pub transport_errors: usize,

    /// Tiles that could not be read from disk
    pub skipped: usize,

    /// Tiles still without a ledger entry
    pub remaining: usize,
}

/// Tiles a run would send, without calling the oracle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub already_done: usize,
    pub pending: Vec<String>,
}

/// Unledgered tiles in filename order, at most `max_tiles` of them
pub fn plan_run(catalog: &TileCatalog, ledger: &ProcessingLedger, max_tiles: Option<usize>) -> RunPlan {
    let unprocessed = catalog
        .iter()
        .filter(|tile| !ledger.contains(&tile.name))
        .map(|tile| tile.name.clone());
    RunPlan {
        already_done: catalog.iter().filter(|t| ledger.contains(&t.name)).count(),
        pending: unprocessed.take(max_tiles.unwrap_or(usize::MAX)).collect(),
    }
}

/// Drives the oracle across a tile catalog with checkpointing
pub struct BatchRunner<O> {
    oracle: O,
    config: PipelineConfig,
    store: CheckpointStore,
    instruction: String,
}

impl<O: DetectionOracle> BatchRunner<O> {
    pub fn new(oracle: O, config: PipelineConfig, store: CheckpointStore) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            oracle,
            config,
            store,
            instruction: DETECTION_PROMPT.to_string(),
        })
    }

    /// Replace the per-tile instruction
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Tiles the next run would process, honouring the cap
    pub fn plan(&self, catalog: &TileCatalog) -> Result<RunPlan> {
        let ledger = self.store.load_ledger()?;
        Ok(plan_run(catalog, &ledger, self.config.max_tiles))
    }

    pub async fn run(
        &self,
        catalog: &TileCatalog,
        progress: Option<&ProgressCallback>,
    ) -> Result<RunSummary> {
        let mut ledger = self.store.load_ledger()?;
        let mut features = ledger.features(catalog, self.config.tile_size);
        let plan = plan_run(catalog, &ledger, self.config.max_tiles);

        let mut summary = RunSummary {
            total_tiles: catalog.len(),
            already_done: plan.already_done,
            ..Default::default()
        };
        info!(
            "Found {} tiles total, {} already processed",
            summary.total_tiles, summary.already_done
        );
        info!("Processing {} new tiles...", plan.pending.len());

        let total = plan.pending.len() as u64;
        for (i, name) in plan.pending.iter().enumerate() {
            if let Some(tile) = catalog.get(name) {
                if let Err(e) = self
                    .process_tile(tile, &mut ledger, &mut features, &mut summary)
                    .await
                {
                    // Keep what was done so far before giving up
                    self.checkpoint(&ledger, &features)?;
                    return Err(e);
                }
            }

            if let Some(progress) = progress {
                progress(i as u64 + 1, total);
            }
            if (i + 1) % self.config.checkpoint_interval == 0 {
                self.checkpoint(&ledger, &features)?;
                info!("Saved progress after {} tiles", i + 1);
            }
        }

        self.checkpoint(&ledger, &features)?;
        summary.remaining = catalog.iter().filter(|t| !ledger.contains(&t.name)).count();
        info!(
            "Run finished: {} processed, {} detections, {} parse errors, {} transport errors, {} remaining",
            summary.processed,
            summary.detections,
            summary.parse_errors,
            summary.transport_errors,
            summary.remaining
        );
        Ok(summary)
    }

    /// One oracle round trip; only fatal errors are returned
    async fn process_tile(
        &self,
        tile: &TileRecord,
        ledger: &mut ProcessingLedger,
        features: &mut Vec<GeoFeature>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let image = match tokio::fs::read(&tile.path).await {
            Ok(image) => image,
            Err(e) => {
                warn!("Error reading {}: {e}", tile.name);
                summary.skipped += 1;
                return Ok(());
            }
        };

        let reply = match self.oracle.infer(&image, &self.instruction).await {
            Err(e) if e.is_fatal() => return Err(e),
            reply => reply,
        };
        let outcome = TileOutcome::from_reply(reply);

        match &outcome {
            TileOutcome::Detected(detections) => {
                let mapped = map_tile_detections(
                    detections,
                    tile.georef.as_ref(),
                    self.config.tile_size,
                    &tile.name,
                    tile.crs.as_ref(),
                );
                debug!("{}: {} detections", tile.name, mapped.len());
                summary.detections += mapped.len();
                features.extend(mapped);
            }
            TileOutcome::ParseFailed { error, .. } => {
                warn!("Failed to parse response for {}: {error}", tile.name);
                summary.parse_errors += 1;
            }
            TileOutcome::TransportFailed(reason) => {
                warn!(
                    "Error processing {}: {reason}; backing off {:?}",
                    tile.name, self.config.error_backoff
                );
                summary.transport_errors += 1;
                tokio::time::sleep(self.config.error_backoff).await;
            }
        }

        if ledger.record(&tile.name, &outcome) {
            summary.processed += 1;
        }

        tokio::time::sleep(self.config.request_delay).await;
        Ok(())
    }

    fn checkpoint(&self, ledger: &ProcessingLedger, features: &[GeoFeature]) -> Result<()> {
        self.store.save(ledger, features, self.output_crs(features))
    }

    fn output_crs<'a>(&'a self, features: &'a [GeoFeature]) -> Option<&'a Crs> {
        common_crs(features, |f| f.crs.as_ref()).or(self.config.default_crs.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::core::geojson::read_features;
    use crate::core::raster::InMemoryRaster;
    use crate::core::tiler::Tiler;
    use crate::core::transform::AffineGeoTransform;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const ONE_MOUND: &str = r#"{"detections": [{"box_2d": [400, 400, 450, 450], "label": "mound"}]}"#;

    /// Replays scripted replies, then answers with `fallback`
    struct ScriptedOracle {
        script: Mutex<VecDeque<Result<String>>>,
        fallback: String,
        calls: AtomicUsize,
        watch_ledger: Option<PathBuf>,
        ledger_sizes: Mutex<Vec<usize>>,
    }

    impl ScriptedOracle {
        fn answering(fallback: &str) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: fallback.to_string(),
                calls: AtomicUsize::new(0),
                watch_ledger: None,
                ledger_sizes: Mutex::new(Vec::new()),
            }
        }

        fn then(self, reply: Result<String>) -> Self {
            self.script.lock().unwrap().push_back(reply);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DetectionOracle for ScriptedOracle {
        async fn infer(&self, image_png: &[u8], _instruction: &str) -> Result<String> {
            assert!(image_png.starts_with(b"\x89PNG"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(path) = &self.watch_ledger {
                let size = ProcessingLedger::load(path).map(|l| l.len()).unwrap_or(0);
                self.ledger_sizes.lock().unwrap().push(size);
            }
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            tile_size: 32,
            overlap: 8,
            request_delay: Duration::ZERO,
            error_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Four tiles of a 40x40 raster under `<tmp>/tiles/m/`
    fn tiled_workspace() -> (TempDir, TileCatalog, CheckpointStore) {
        let dir = tempdir().unwrap();
        let tiles_dir = dir.path().join("tiles");
        let raster = InMemoryRaster::new(
            40,
            40,
            3,
            vec![90; 40 * 40 * 3],
            AffineGeoTransform::north_up(500_000.0, 4_650_000.0, 1.0, 1.0),
            Some(Crs::from_epsg(32635)),
        )
        .unwrap();
        Tiler::new(fast_config())
            .unwrap()
            .tile_raster(&raster, "m", &tiles_dir, None)
            .unwrap();
        let catalog = TileCatalog::scan(&tiles_dir).unwrap();
        let store = CheckpointStore::new(
            &dir.path().join("all_detections.json"),
            &dir.path().join("all_detections.geojson"),
        );
        (dir, catalog, store)
    }

    fn feature_count(path: &Path) -> usize {
        read_features(path, None).unwrap().len()
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (_dir, catalog, store) = tiled_workspace();
        assert_eq!(catalog.len(), 4);

        let runner = BatchRunner::new(ScriptedOracle::answering(ONE_MOUND), fast_config(), store.clone()).unwrap();
        let first = runner.run(&catalog, None).await.unwrap();
        assert_eq!(first.processed, 4);
        assert_eq!(first.detections, 4);
        assert_eq!(first.remaining, 0);
        assert_eq!(feature_count(store.features_file()), 4);

        let second = runner.run(&catalog, None).await.unwrap();
        assert_eq!(second.already_done, 4);
        assert_eq!(second.processed, 0);
        assert_eq!(runner.oracle().calls(), 4);
        assert_eq!(feature_count(store.features_file()), 4);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_ledgered() {
        let (_dir, catalog, store) = tiled_workspace();
        let oracle = ScriptedOracle::answering(ONE_MOUND).then(Ok("Sorry, I cannot help".to_string()));
        let runner = BatchRunner::new(oracle, fast_config(), store.clone()).unwrap();

        let summary = runner.run(&catalog, None).await.unwrap();
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.detections, 3);

        let ledger = store.load_ledger().unwrap();
        assert_eq!(ledger.error_tiles(), vec!["m_x0_y0.png"]);
        let raw = serde_json::to_value(ledger.get("m_x0_y0.png").unwrap()).unwrap();
        assert_eq!(raw["raw_text"], "Sorry, I cannot help");
    }

    #[tokio::test]
    async fn test_transport_failure_stays_pending() {
        let (_dir, catalog, store) = tiled_workspace();
        let oracle = ScriptedOracle::answering(r#"{"detections": []}"#)
            .then(Ok(r#"{"detections": []}"#.to_string()))
            .then(Err(Error::NetworkError("connection reset".to_string())));
        let runner = BatchRunner::new(oracle, fast_config(), store.clone()).unwrap();

        let summary = runner.run(&catalog, None).await.unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.transport_errors, 1);
        assert_eq!(summary.remaining, 1);

        let ledger = store.load_ledger().unwrap();
        assert!(!ledger.contains("m_x0_y24.png"));

        let retry = runner.plan(&catalog).unwrap();
        assert_eq!(retry.pending, vec!["m_x0_y24.png".to_string()]);
    }

    #[tokio::test]
    async fn test_max_tiles_caps_a_run() {
        let (_dir, catalog, store) = tiled_workspace();
        let config = PipelineConfig {
            max_tiles: Some(3),
            ..fast_config()
        };
        let runner = BatchRunner::new(ScriptedOracle::answering(ONE_MOUND), config, store.clone()).unwrap();

        let first = runner.run(&catalog, None).await.unwrap();
        assert_eq!(first.processed, 3);
        assert_eq!(first.remaining, 1);

        let second = runner.run(&catalog, None).await.unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.remaining, 0);
        assert_eq!(feature_count(store.features_file()), 4);
    }

    #[tokio::test]
    async fn test_checkpoints_every_interval() {
        let (_dir, catalog, store) = tiled_workspace();
        let config = PipelineConfig {
            checkpoint_interval: 3,
            ..fast_config()
        };
        let mut oracle = ScriptedOracle::answering(r#"{"detections": []}"#);
        oracle.watch_ledger = Some(store.ledger_file().to_path_buf());
        let runner = BatchRunner::new(oracle, config, store.clone()).unwrap();

        runner.run(&catalog, None).await.unwrap();
        let seen = runner.oracle().ledger_sizes.lock().unwrap().clone();
        assert_eq!(seen, vec![0, 0, 0, 3]);
        assert_eq!(store.load_ledger().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_after_saving() {
        let (_dir, catalog, store) = tiled_workspace();
        let oracle = ScriptedOracle::answering(ONE_MOUND)
            .then(Ok(ONE_MOUND.to_string()))
            .then(Err(Error::MissingCredentials("no key".to_string())));
        let runner = BatchRunner::new(oracle, fast_config(), store.clone()).unwrap();

        let result = runner.run(&catalog, None).await;
        assert!(matches!(result, Err(Error::MissingCredentials(_))));
        assert_eq!(store.load_ledger().unwrap().len(), 1);
        assert_eq!(feature_count(store.features_file()), 1);
    }

    #[tokio::test]
    async fn test_features_rebuilt_on_resume() {
        let (_dir, catalog, store) = tiled_workspace();
        let config = PipelineConfig {
            max_tiles: Some(2),
            ..fast_config()
        };
        let runner = BatchRunner::new(ScriptedOracle::answering(ONE_MOUND), config, store.clone()).unwrap();
        runner.run(&catalog, None).await.unwrap();

        // Lose the feature export; the ledger alone is enough to resume
        std::fs::remove_file(store.features_file()).unwrap();
        runner.run(&catalog, None).await.unwrap();

        let features = read_features(store.features_file(), None).unwrap();
        assert_eq!(features.len(), 4);
        assert!(features.iter().all(|f| f.crs == Some(Crs::from_epsg(32635))));
    }

    #[tokio::test]
    async fn test_plan_honours_cap_and_order() {
        let (_dir, catalog, store) = tiled_workspace();
        let config = PipelineConfig {
            max_tiles: Some(2),
            ..fast_config()
        };
        let runner = BatchRunner::new(ScriptedOracle::answering(ONE_MOUND), config, store).unwrap();
        let plan = runner.plan(&catalog).unwrap();
        assert_eq!(plan.already_done, 0);
        assert_eq!(plan.pending, vec!["m_x0_y0.png".to_string(), "m_x0_y24.png".to_string()]);
        assert_eq!(runner.oracle().calls(), 0);
    }

    #[tokio::test]
    async fn test_progress_reports_each_tile() {
        use std::sync::Arc;

        let (_dir, catalog, store) = tiled_workspace();
        let runner = BatchRunner::new(ScriptedOracle::answering(ONE_MOUND), fast_config(), store).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = Arc::clone(&ticks);
        let progress: ProgressCallback = Arc::new(move |_, total| {
            assert_eq!(total, 4);
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        });
        runner.run(&catalog, Some(&progress)).await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
    }
}
