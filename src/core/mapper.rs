//! Detection coordinate mapping
//!
//! The oracle reports boxes as `[ymin, xmin, ymax, xmax]` on a 0-1000 scale,
//! top-left origin, y pointing down. This module maps them through the tile's
//! georeferencing into map coordinates.

use geo::{coord, Geometry, Point, Rect};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::raster::Crs;
use crate::core::transform::AffineGeoTransform;

/// Full scale of normalized oracle coordinates
pub const NORMALIZED_SCALE: f64 = 1000.0;

/// Label assumed when the oracle omits one
pub const DEFAULT_LABEL: &str = "mound";

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

/// One detection as returned by the oracle, still in tile space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// `[ymin, xmin, ymax, xmax]`, 0-1000
    pub box_2d: [f64; 4],

    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl RawDetection {
    pub fn new(box_2d: [f64; 4], label: impl Into<String>) -> Self {
        Self {
            box_2d,
            label: label.into(),
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Box in tile pixels with swapped edges put back in order
    pub fn pixel_box(&self, tile_size: u32) -> PixelBox {
        let [y0, x0, y1, x1] = self.box_2d.map(|n| n / NORMALIZED_SCALE * tile_size as f64);
        PixelBox {
            xmin: x0.min(x1),
            ymin: y0.min(y1),
            xmax: x0.max(x1),
            ymax: y0.max(y1),
        }
    }
}

/// Tile-local pixel box, y down
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

/// Georeferencing known for one tile
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileGeoref {
    /// Corner-anchored transform recovered from the `.pgw` sidecar
    Affine(AffineGeoTransform),

    /// Legacy `metadata.json` tuple: lower-left corner plus positive resolution
    LowerLeft {
        ll_x: f64,
        ll_y: f64,
        res_x: f64,
        res_y: f64,
    },
}

impl TileGeoref {
    pub fn from_lower_left([ll_x, ll_y, res_x, res_y]: [f64; 4]) -> Self {
        TileGeoref::LowerLeft {
            ll_x,
            ll_y,
            res_x,
            res_y,
        }
    }

    /// Map a pixel box to `(min_x, min_y, max_x, max_y)` in map units
    pub fn map_box(&self, pixels: PixelBox, tile_size: u32) -> (f64, f64, f64, f64) {
        match *self {
            TileGeoref::Affine(transform) => {
                let (x0, y0) = transform.pixel_to_geo(pixels.xmin, pixels.ymin);
                let (x1, y1) = transform.pixel_to_geo(pixels.xmax, pixels.ymax);
                (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
            }
            TileGeoref::LowerLeft {
                ll_x,
                ll_y,
                res_x,
                res_y,
            } => {
                let size = tile_size as f64;
                (
                    ll_x + pixels.xmin * res_x,
                    ll_y + (size - pixels.ymax) * res_y,
                    ll_x + pixels.xmax * res_x,
                    ll_y + (size - pixels.ymin) * res_y,
                )
            }
        }
    }
}

/// Provenance carried by every feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureProperties {
    #[serde(default)]
    pub source_tile: String,

    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// A georeferenced detection: a box polygon or a point
#[derive(Debug, Clone, PartialEq)]
pub struct GeoFeature {
    pub geometry: Geometry<f64>,
    pub crs: Option<Crs>,
    pub properties: FeatureProperties,
}

impl GeoFeature {
    pub fn point(x: f64, y: f64, crs: Option<Crs>, properties: FeatureProperties) -> Self {
        Self {
            geometry: Geometry::Point(Point::new(x, y)),
            crs,
            properties,
        }
    }
}

/// Map one detection of `source_tile` into a box feature
pub fn map_detection(
    detection: &RawDetection,
    georef: &TileGeoref,
    tile_size: u32,
    source_tile: &str,
    crs: Option<&Crs>,
) -> GeoFeature {
    let (min_x, min_y, max_x, max_y) = georef.map_box(detection.pixel_box(tile_size), tile_size);
    let rect = Rect::new(coord! { x: min_x, y: min_y }, coord! { x: max_x, y: max_y });

    GeoFeature {
        geometry: Geometry::Polygon(rect.to_polygon()),
        crs: crs.cloned(),
        properties: FeatureProperties {
            source_tile: source_tile.to_string(),
            label: detection.label.clone(),
            reasoning: detection.reasoning.clone(),
        },
    }
}

/// Map all detections of a tile; without georeferencing they are dropped
pub fn map_tile_detections(
    detections: &[RawDetection],
    georef: Option<&TileGeoref>,
    tile_size: u32,
    source_tile: &str,
    crs: Option<&Crs>,
) -> Vec<GeoFeature> {
    let Some(georef) = georef else {
        if !detections.is_empty() {
            warn!(
                "No georeferencing for {source_tile}; dropping {} detection(s)",
                detections.len()
            );
        }
        return Vec::new();
    };

    detections
        .iter()
        .map(|detection| map_detection(detection, georef, tile_size, source_tile, crs))
        .collect()
}
