//! Tile discovery
//!
//! Finds the tiles written by the tiler and pairs each one with its
//! georeferencing, so detections never need a reverse lookup by filename.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::core::error::{Error, Result};
use crate::core::mapper::TileGeoref;
use crate::core::raster::Crs;
use crate::core::tiler::METADATA_FILE;
use crate::core::transform::AffineGeoTransform;

/// A tile on disk and everything needed to georeference its detections
#[derive(Debug, Clone, PartialEq)]
pub struct TileRecord {
    /// Tile filename, also the ledger key
    pub name: String,
    pub map_name: String,
    pub path: PathBuf,
    pub georef: Option<TileGeoref>,
    pub crs: Option<Crs>,
}

/// All tiles under a tiles directory, sorted by filename
#[derive(Debug, Clone, Default)]
pub struct TileCatalog {
    tiles: Vec<TileRecord>,
    index: BTreeMap<String, usize>,
}

impl TileCatalog {
    pub fn from_records(mut tiles: Vec<TileRecord>) -> Self {
        tiles.sort_by(|a, b| a.name.cmp(&b.name));
        let index = tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| (tile.name.clone(), i))
            .collect();
        Self { tiles, index }
    }

    /// Walk `tiles_dir/<map>/` directories that hold a `metadata.json`
    pub fn scan(tiles_dir: &Path) -> Result<Self> {
        if !tiles_dir.is_dir() {
            return Err(Error::InvalidInput(format!(
                "tiles directory {} does not exist",
                tiles_dir.display()
            )));
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(tiles_dir)? {
            let map_dir = entry?.path();
            let metadata_path = map_dir.join(METADATA_FILE);
            if !map_dir.is_dir() || !metadata_path.is_file() {
                continue;
            }
            records.extend(scan_map_dir(&map_dir, &metadata_path)?);
        }

        let catalog = Self::from_records(records);
        info!(
            "Found {} tiles in {}",
            catalog.len(),
            tiles_dir.display()
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TileRecord> {
        self.index.get(name).map(|&i| &self.tiles[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TileRecord> {
        self.tiles.iter()
    }
}

fn scan_map_dir(map_dir: &Path, metadata_path: &Path) -> Result<Vec<TileRecord>> {
    let map_name = map_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let metadata: BTreeMap<String, [f64; 4]> = match fs::read_to_string(metadata_path)
        .map_err(Error::from)
        .and_then(|text| serde_json::from_str(&text).map_err(Error::from))
    {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!("Ignoring unreadable {}: {e}", metadata_path.display());
            BTreeMap::new()
        }
    };

    let mut records = Vec::new();
    for entry in fs::read_dir(map_dir)? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
        if !path.is_file() || !is_png {
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        let georef = read_georef(&path, metadata.get(&name));
        if georef.is_none() {
            warn!("No georeferencing found for {name}");
        }
        let crs = read_pam_crs(&path.with_extension("png.aux.xml"));

        records.push(TileRecord {
            name,
            map_name: map_name.clone(),
            path,
            georef,
            crs,
        });
    }
    debug!("{map_name}: {} tiles", records.len());
    Ok(records)
}

/// World file first, then the legacy lower-left tuple
fn read_georef(tile_path: &Path, lower_left: Option<&[f64; 4]>) -> Option<TileGeoref> {
    let world_file = tile_path.with_extension("pgw");
    if world_file.is_file() {
        match fs::read_to_string(&world_file)
            .map_err(Error::from)
            .and_then(|text| AffineGeoTransform::from_world_file(&text))
        {
            Ok(transform) => return Some(TileGeoref::Affine(transform)),
            Err(e) => warn!("Ignoring {}: {e}", world_file.display()),
        }
    }
    lower_left.map(|tuple| TileGeoref::from_lower_left(*tuple))
}

/// Contents of the `<SRS>` element of a PAM sidecar
fn read_pam_crs(path: &Path) -> Option<Crs> {
    let text = fs::read_to_string(path).ok()?;
    parse_pam_srs(&text)
}

fn parse_pam_srs(xml: &str) -> Option<Crs> {
    let open = xml.find("<SRS")?;
    let body_start = open + xml[open..].find('>')? + 1;
    let body_len = xml[body_start..].find("</SRS>")?;
    let srs = xml[body_start..body_start + body_len].trim();
    (!srs.is_empty()).then(|| Crs::new(srs))
}
