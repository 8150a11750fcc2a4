//! Processing ledger and checkpoints
//!
//! The ledger maps tile filenames to the oracle's outcome and is the commit
//! point of a detection run: a tile is processed exactly when it has a ledger
//! entry. The file format is the plain JSON object
//! `{tile_filename: {"detections": [...]} | {"raw_text": ..., "error": ...}}`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::catalog::TileCatalog;
use crate::core::error::{Error, Result};
use crate::core::geojson::write_features;
use crate::core::mapper::{map_tile_detections, GeoFeature, RawDetection};
use crate::core::oracle::TileOutcome;
use crate::core::raster::Crs;

/// Outcome recorded for one tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LedgerEntry {
    /// Unusable oracle reply
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_text: Option<String>,
        error: String,
    },

    /// Parsed detections, possibly none
    Detections { detections: Vec<RawDetection> },

    /// Anything else found in an existing ledger file
    Unrecognized(serde_json::Value),
}

impl LedgerEntry {
    pub fn is_error(&self) -> bool {
        !matches!(self, LedgerEntry::Detections { .. })
    }

    pub fn detections(&self) -> &[RawDetection] {
        match self {
            LedgerEntry::Detections { detections } => detections,
            _ => &[],
        }
    }
}

/// Tile filename -> outcome, ordered by filename
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingLedger {
    entries: BTreeMap<String, LedgerEntry>,
}

impl ProcessingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a ledger; a missing file is an empty ledger
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No ledger at {}, starting fresh", path.display());
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)?;
        let ledger: Self = serde_json::from_str(&text).map_err(|e| {
            Error::InvalidInput(format!("ledger {} is not readable: {e}", path.display()))
        })?;
        info!("Loaded {} ledger entries from {}", ledger.len(), path.display());
        Ok(ledger)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tile: &str) -> bool {
        self.entries.contains_key(tile)
    }

    pub fn get(&self, tile: &str) -> Option<&LedgerEntry> {
        self.entries.get(tile)
    }

    pub fn insert(&mut self, tile: impl Into<String>, entry: LedgerEntry) {
        self.entries.insert(tile.into(), entry);
    }

    /// Ledger an oracle outcome; transport failures are not recorded.
    ///
    /// Returns whether an entry was written.
    pub fn record(&mut self, tile: &str, outcome: &TileOutcome) -> bool {
        let entry = match outcome {
            TileOutcome::Detected(detections) => LedgerEntry::Detections {
                detections: detections.clone(),
            },
            TileOutcome::ParseFailed { raw_text, error } => LedgerEntry::Failed {
                raw_text: raw_text.clone(),
                error: error.clone(),
            },
            TileOutcome::TransportFailed(_) => return false,
        };
        self.insert(tile, entry);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LedgerEntry)> {
        self.entries.iter().map(|(tile, entry)| (tile.as_str(), entry))
    }

    /// Tiles whose entry is an error marker
    pub fn error_tiles(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, entry)| entry.is_error())
            .map(|(tile, _)| tile)
            .collect()
    }

    /// Drop error entries so the next run retries those tiles
    pub fn clear_errors(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_error());
        before - self.entries.len()
    }

    pub fn detection_count(&self) -> usize {
        self.entries.values().map(|entry| entry.detections().len()).sum()
    }

    /// Rebuild the georeferenced features of every ledgered tile
    pub fn features(&self, catalog: &TileCatalog, tile_size: u32) -> Vec<GeoFeature> {
        let mut features = Vec::new();
        for (tile, entry) in self.iter() {
            let detections = entry.detections();
            if detections.is_empty() {
                continue;
            }
            let record = catalog.get(tile);
            features.extend(map_tile_detections(
                detections,
                record.and_then(|r| r.georef.as_ref()),
                tile_size,
                tile,
                record.and_then(|r| r.crs.as_ref()),
            ));
        }
        features
    }
}

/// Where checkpoints land: the ledger plus the raw feature export
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    ledger_file: PathBuf,
    features_file: PathBuf,
}

impl CheckpointStore {
    pub fn new(ledger_file: &Path, features_file: &Path) -> Self {
        Self {
            ledger_file: ledger_file.to_path_buf(),
            features_file: features_file.to_path_buf(),
        }
    }

    pub fn ledger_file(&self) -> &Path {
        &self.ledger_file
    }

    pub fn features_file(&self) -> &Path {
        &self.features_file
    }

    pub fn load_ledger(&self) -> Result<ProcessingLedger> {
        ProcessingLedger::load(&self.ledger_file)
    }

    /// Persist features first, then the ledger, each by atomic replacement.
    ///
    /// A crash between the two leaves the previous ledger in force; features
    /// are rebuilt from it on resume.
    pub fn save(
        &self,
        ledger: &ProcessingLedger,
        features: &[GeoFeature],
        crs: Option<&Crs>,
    ) -> Result<()> {
        write_features(&self.features_file, features, crs)?;
        ledger.save(&self.ledger_file)?;
        debug!(
            "Checkpoint: {} tiles, {} features",
            ledger.len(),
            features.len()
        );
        Ok(())
    }
}

/// Serialize to a temporary file beside `path` and rename it into place
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut file = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::TileRecord;
    use crate::core::mapper::TileGeoref;
    use tempfile::tempdir;

    fn mound(box_2d: [f64; 4]) -> RawDetection {
        RawDetection::new(box_2d, "mound")
    }

    #[test]
    fn test_record_outcomes() {
        let mut ledger = ProcessingLedger::new();
        assert!(ledger.record("a.png", &TileOutcome::Detected(vec![mound([0.0, 0.0, 1.0, 1.0])])));
        assert!(ledger.record(
            "b.png",
            &TileOutcome::ParseFailed {
                raw_text: Some("oops".to_string()),
                error: "JSONDecodeError".to_string(),
            }
        ));
        assert!(!ledger.record("c.png", &TileOutcome::TransportFailed("reset".to_string())));

        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains("a.png"));
        assert!(!ledger.contains("c.png"));
        assert_eq!(ledger.error_tiles(), vec!["b.png"]);
        assert_eq!(ledger.detection_count(), 1);
    }

    #[test]
    fn test_file_format() {
        let mut ledger = ProcessingLedger::new();
        ledger.record("a.png", &TileOutcome::Detected(vec![]));
        ledger.record(
            "b.png",
            &TileOutcome::ParseFailed {
                raw_text: Some("no".to_string()),
                error: "JSONDecodeError".to_string(),
            },
        );
        let json = serde_json::to_value(&ledger).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "a.png": {"detections": []},
                "b.png": {"raw_text": "no", "error": "JSONDecodeError"}
            })
        );
    }

    #[test]
    fn test_reads_existing_ledger_shapes() {
        let text = r#"{
            "m_x0_y0.png": {"detections": [{"box_2d": [1, 2, 3, 4], "label": "mound", "reasoning": "dot"}]},
            "m_x448_y0.png": {"error": "500 Internal error"},
            "m_x896_y0.png": {"raw_text": "```", "error": "JSONDecodeError"},
            "m_x0_y448.png": {"mounds": []}
        }"#;
        let ledger: ProcessingLedger = serde_json::from_str(text).unwrap();
        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.get("m_x0_y0.png").unwrap().detections().len(), 1);
        assert!(matches!(
            ledger.get("m_x0_y448.png"),
            Some(LedgerEntry::Unrecognized(_))
        ));
        assert_eq!(ledger.error_tiles().len(), 3);
    }

    #[test]
    fn test_clear_errors() {
        let mut ledger = ProcessingLedger::new();
        ledger.record("a.png", &TileOutcome::Detected(vec![]));
        ledger.insert(
            "b.png",
            LedgerEntry::Failed {
                raw_text: None,
                error: "blocked".to_string(),
            },
        );
        assert_eq!(ledger.clear_errors(), 1);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.error_tiles().is_empty());
        assert_eq!(ledger.clear_errors(), 0);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all_detections.json");
        assert!(ProcessingLedger::load(&path).unwrap().is_empty());

        fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(ProcessingLedger::load(&path), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_save_round_trip_creates_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outputs").join("all_detections.json");
        let mut ledger = ProcessingLedger::new();
        ledger.record("a.png", &TileOutcome::Detected(vec![mound([10.0, 10.0, 20.0, 20.0])]));
        ledger.save(&path).unwrap();

        assert_eq!(ProcessingLedger::load(&path).unwrap(), ledger);
        // no temp files left behind
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_features_from_ledger() {
        let catalog = TileCatalog::from_records(vec![TileRecord {
            name: "a.png".to_string(),
            map_name: "a".to_string(),
            path: PathBuf::from("a.png"),
            georef: Some(TileGeoref::from_lower_left([100.0, 200.0, 2.0, 2.0])),
            crs: Some(Crs::from_epsg(32635)),
        }]);
        let mut ledger = ProcessingLedger::new();
        ledger.record("a.png", &TileOutcome::Detected(vec![mound([0.0, 0.0, 10.0, 10.0])]));
        // Unknown tile: detections are dropped
        ledger.record("gone.png", &TileOutcome::Detected(vec![mound([0.0, 0.0, 10.0, 10.0])]));

        let features = ledger.features(&catalog, 512);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].properties.source_tile, "a.png");
        assert_eq!(features[0].crs, Some(Crs::from_epsg(32635)));
    }

    #[test]
    fn test_checkpoint_writes_both_files() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(
            &dir.path().join("all_detections.json"),
            &dir.path().join("all_detections.geojson"),
        );
        let mut ledger = ProcessingLedger::new();
        ledger.record("a.png", &TileOutcome::Detected(vec![]));
        store.save(&ledger, &[], Some(&Crs::from_epsg(32635))).unwrap();

        assert!(store.ledger_file().exists());
        assert!(store.features_file().exists());
        assert_eq!(store.load_ledger().unwrap().len(), 1);
    }
}
