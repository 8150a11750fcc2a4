//! GeoJSON feature collections
//!
//! Raw detection boxes and deduplicated points are exchanged as GeoJSON
//! `FeatureCollection`s. The CRS is written in the legacy named-CRS `crs`
//! member so GIS tools keep projected coordinates in place.

use std::fs;
use std::path::Path;

use geo::Geometry;
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, JsonValue};
use log::{info, warn};
use serde_json::json;

use crate::core::cluster::{DeduplicatedPoint, DetectionClusterer};
use crate::core::error::{Error, Result};
use crate::core::ledger::write_json_atomic;
use crate::core::mapper::{FeatureProperties, GeoFeature};
use crate::core::raster::Crs;

/// Foreign member holding the named CRS
const CRS_MEMBER: &str = "crs";

/// Empty collection tagged with `crs`
pub fn new_collection(crs: Option<&Crs>) -> FeatureCollection {
    let foreign_members = crs.map(|crs| {
        let mut members = JsonObject::new();
        members.insert(
            CRS_MEMBER.to_string(),
            json!({ "type": "name", "properties": { "name": crs.to_urn() } }),
        );
        members
    });
    FeatureCollection {
        bbox: None,
        features: Vec::new(),
        foreign_members,
    }
}

/// CRS named in the collection's `crs` member, normalized to `EPSG:n` when possible
pub fn collection_crs(collection: &FeatureCollection) -> Option<Crs> {
    let name = collection
        .foreign_members
        .as_ref()?
        .get(CRS_MEMBER)?
        .get("properties")?
        .get("name")?
        .as_str()?;
    let crs = Crs::new(name);
    Some(crs.epsg().map(Crs::from_epsg).unwrap_or(crs))
}

/// First CRS carried by `crs_of`; warns when the items disagree
pub fn common_crs<'a, T>(
    items: &'a [T],
    crs_of: impl Fn(&'a T) -> Option<&'a Crs>,
) -> Option<&'a Crs> {
    let mut found: Option<&Crs> = None;
    for crs in items.iter().filter_map(crs_of) {
        match found {
            None => found = Some(crs),
            Some(first) if first != crs => {
                warn!("Mixed CRS in one collection ({first} and {crs}); labelling it {first}");
                break;
            }
            Some(_) => {}
        }
    }
    found
}

fn feature(geometry: &Geometry<f64>, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(geometry))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn to_properties(properties: &FeatureProperties) -> Result<JsonObject> {
    match serde_json::to_value(properties)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(Error::InvalidInput(format!(
            "feature properties serialized to {other}"
        ))),
    }
}

fn from_properties(properties: Option<JsonObject>) -> FeatureProperties {
    let properties = JsonValue::Object(properties.unwrap_or_default());
    serde_json::from_value(properties).unwrap_or_else(|e| {
        warn!("Feature properties not understood ({e}); using defaults");
        FeatureProperties {
            source_tile: String::new(),
            label: crate::core::mapper::DEFAULT_LABEL.to_string(),
            reasoning: None,
        }
    })
}

/// Box/point features as a collection; an explicit `crs` wins over the features' own
pub fn features_collection(
    features: &[GeoFeature],
    crs: Option<&Crs>,
) -> Result<FeatureCollection> {
    let crs = crs.or_else(|| common_crs(features, |f| f.crs.as_ref()));
    let mut collection = new_collection(crs);
    for f in features {
        collection
            .features
            .push(feature(&f.geometry, to_properties(&f.properties)?));
    }
    Ok(collection)
}

pub fn points_collection(points: &[DeduplicatedPoint], crs: Option<&Crs>) -> FeatureCollection {
    let crs = crs.or_else(|| common_crs(points, |p| p.crs.as_ref()));
    let mut collection = new_collection(crs);
    for point in points {
        let mut properties = JsonObject::new();
        properties.insert("label".to_string(), JsonValue::from(point.label.clone()));
        if let Some(reasoning) = &point.reasoning {
            properties.insert("reasoning".to_string(), JsonValue::from(reasoning.clone()));
        }
        properties.insert("member_count".to_string(), JsonValue::from(point.member_count));
        properties.insert(
            "source_tiles".to_string(),
            JsonValue::from(point.source_tiles.clone()),
        );
        collection
            .features
            .push(feature(&Geometry::Point(point.point), properties));
    }
    collection
}

/// Convert a collection into features; `fallback_crs` applies when it names none
pub fn collection_features(
    collection: FeatureCollection,
    fallback_crs: Option<&Crs>,
) -> Vec<GeoFeature> {
    let crs = collection_crs(&collection).or_else(|| fallback_crs.cloned());
    collection
        .features
        .into_iter()
        .filter_map(|feature| {
            let geometry = match feature.geometry.map(Geometry::<f64>::try_from) {
                Some(Ok(geometry)) => geometry,
                Some(Err(e)) => {
                    warn!("Skipping feature with unusable geometry: {e}");
                    return None;
                }
                None => {
                    warn!("Skipping feature without geometry");
                    return None;
                }
            };
            Some(GeoFeature {
                geometry,
                crs: crs.clone(),
                properties: from_properties(feature.properties),
            })
        })
        .collect()
}

/// Read a file that must hold a `FeatureCollection`
pub fn read_collection(path: &Path) -> Result<FeatureCollection> {
    let text = fs::read_to_string(path)?;
    match text.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(collection) => Ok(collection),
        GeoJson::Feature(_) | GeoJson::Geometry(_) => Err(Error::InvalidInput(format!(
            "{} is not a GeoJSON FeatureCollection",
            path.display()
        ))),
    }
}

/// Read a feature collection file
pub fn read_features(path: &Path, fallback_crs: Option<&Crs>) -> Result<Vec<GeoFeature>> {
    Ok(collection_features(read_collection(path)?, fallback_crs))
}

/// Write box/point features, atomically replacing `path`
pub fn write_features(path: &Path, features: &[GeoFeature], crs: Option<&Crs>) -> Result<()> {
    write_json_atomic(path, &features_collection(features, crs)?)
}

/// Write deduplicated points
pub fn write_points(path: &Path, points: &[DeduplicatedPoint], crs: Option<&Crs>) -> Result<()> {
    write_json_atomic(path, &points_collection(points, crs))
}

/// Read raw detections, cluster them and write the merged points.
///
/// The output keeps the input's CRS; `default_crs` applies only when the input
/// names none. Returns `(raw count, merged count)`.
pub fn dedupe_file(
    input: &Path,
    output: &Path,
    clusterer: &DetectionClusterer,
    default_crs: Option<&Crs>,
) -> Result<(usize, usize)> {
    let collection = read_collection(input)?;
    let crs = collection_crs(&collection).or_else(|| default_crs.cloned());
    let features = collection_features(collection, crs.as_ref());
    info!("Loaded {} detections from {}", features.len(), input.display());

    let points = clusterer.cluster(&features);
    write_points(output, &points, crs.as_ref())?;

    info!(
        "Reduced {} detections to {} unique mounds, saved to {}",
        features.len(),
        points.len(),
        output.display()
    );
    Ok((features.len(), points.len()))
}
