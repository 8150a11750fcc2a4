//! Duplicate detection merging
//!
//! Detections in overlap regions are reported once per tile. Each detection is
//! reduced to its centroid and buffered by half the merge distance; buffers that
//! touch are unioned and every connected region collapses to its centroid.
//! Connectivity is single-linkage, so chains of close detections merge.

use geo::{BooleanOps, Centroid, Coord, LineString, MultiPolygon, Point, Polygon};
use log::{debug, warn};
use rstar::primitives::GeomWithData;
use rstar::RTree;

use crate::core::error::{Error, Result};
use crate::core::mapper::GeoFeature;
use crate::core::raster::Crs;

/// Segments used to approximate a buffer circle
const CIRCLE_SEGMENTS: usize = 64;

/// One merged mound
#[derive(Debug, Clone, PartialEq)]
pub struct DeduplicatedPoint {
    pub point: Point<f64>,
    pub crs: Option<Crs>,

    /// Number of raw detections merged into this point
    pub member_count: usize,

    /// Distinct source tiles of the members, sorted
    pub source_tiles: Vec<String>,

    /// Label of the first member in input order
    pub label: String,

    /// Reasoning of the first member in input order
    pub reasoning: Option<String>,
}

/// Buffer-union-centroid clusterer
#[derive(Debug, Clone)]
pub struct DetectionClusterer {
    distance: f64,
    default_crs: Option<Crs>,
}

impl DetectionClusterer {
    /// `distance` is in CRS units; detections closer than this merge
    pub fn new(distance: f64) -> Result<Self> {
        if !distance.is_finite() || distance <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "merge distance must be a positive number, got {distance}"
            )));
        }
        Ok(Self {
            distance,
            default_crs: None,
        })
    }

    /// CRS assigned to points whose members carry none
    pub fn with_default_crs(mut self, crs: Option<Crs>) -> Self {
        self.default_crs = crs;
        self
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn cluster(&self, features: &[GeoFeature]) -> Vec<DeduplicatedPoint> {
        let members: Vec<(usize, Point<f64>)> = features
            .iter()
            .enumerate()
            .filter_map(|(i, feature)| match feature.geometry.centroid() {
                Some(centroid) => Some((i, centroid)),
                None => {
                    warn!(
                        "Skipping empty geometry from {}",
                        feature.properties.source_tile
                    );
                    None
                }
            })
            .collect();

        if members.is_empty() {
            return Vec::new();
        }

        let components = self.connected_components(&members);
        debug!(
            "Merged {} detections into {} clusters",
            members.len(),
            components.len()
        );

        components
            .into_iter()
            .map(|component| {
                let centroids: Vec<Point<f64>> = component.iter().map(|&m| members[m].1).collect();
                let indices: Vec<usize> = component.iter().map(|&m| members[m].0).collect();
                self.merge(features, &indices, &centroids)
            })
            .collect()
    }

    /// Groups of member positions whose buffers overlap, ordered by first member
    fn connected_components(&self, members: &[(usize, Point<f64>)]) -> Vec<Vec<usize>> {
        let tree = RTree::bulk_load(
            members
                .iter()
                .enumerate()
                .map(|(m, (_, p))| GeomWithData::new([p.x(), p.y()], m))
                .collect(),
        );

        let mut sets = DisjointSets::new(members.len());
        let max_distance_2 = self.distance * self.distance;
        for (m, (_, p)) in members.iter().enumerate() {
            for neighbour in tree.locate_within_distance([p.x(), p.y()], max_distance_2) {
                sets.union(m, neighbour.data);
            }
        }

        let mut components: Vec<Vec<usize>> = Vec::new();
        let mut slot_of_root = vec![usize::MAX; members.len()];
        for m in 0..members.len() {
            let root = sets.find(m);
            if slot_of_root[root] == usize::MAX {
                slot_of_root[root] = components.len();
                components.push(Vec::new());
            }
            components[slot_of_root[root]].push(m);
        }
        components
    }

    fn merge(&self, features: &[GeoFeature], indices: &[usize], centroids: &[Point<f64>]) -> DeduplicatedPoint {
        let point = if centroids.len() == 1 {
            centroids[0]
        } else {
            self.union_centroid(centroids)
        };

        let representative = &features[indices[0]];
        let mut source_tiles: Vec<String> = indices
            .iter()
            .map(|&i| features[i].properties.source_tile.clone())
            .collect();
        source_tiles.sort();
        source_tiles.dedup();

        DeduplicatedPoint {
            point,
            crs: representative.crs.clone().or_else(|| self.default_crs.clone()),
            member_count: indices.len(),
            source_tiles,
            label: representative.properties.label.clone(),
            reasoning: representative.properties.reasoning.clone(),
        }
    }

    /// Centroid of the union of the half-distance buffers
    fn union_centroid(&self, centroids: &[Point<f64>]) -> Point<f64> {
        // Coincident buffers add nothing to the union
        let mut distinct: Vec<Point<f64>> = Vec::with_capacity(centroids.len());
        for c in centroids {
            if !distinct.contains(c) {
                distinct.push(*c);
            }
        }
        if let [only] = distinct[..] {
            return only;
        }

        let radius = self.distance / 2.0;
        let region = distinct
            .iter()
            .map(|c| MultiPolygon::new(vec![circle(*c, radius)]))
            .reduce(|acc, buffer| acc.union(&buffer));

        region.and_then(|region| region.centroid()).unwrap_or_else(|| {
            // Degenerate union; fall back to the mean position
            let n = centroids.len() as f64;
            let (sx, sy) = centroids
                .iter()
                .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x(), sy + p.y()));
            Point::new(sx / n, sy / n)
        })
    }
}

fn circle(center: Point<f64>, radius: f64) -> Polygon<f64> {
    let ring: Vec<Coord<f64>> = (0..=CIRCLE_SEGMENTS)
        .map(|i| {
            let angle = std::f64::consts::TAU * (i % CIRCLE_SEGMENTS) as f64 / CIRCLE_SEGMENTS as f64;
            Coord {
                x: center.x() + radius * angle.cos(),
                y: center.y() + radius * angle.sin(),
            }
        })
        .collect();
    Polygon::new(LineString::new(ring), vec![])
}

/// Union-find over member positions with path halving
struct DisjointSets {
    parent: Vec<usize>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the smaller index as root so components stay in input order
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapper::FeatureProperties;

    fn detection(x: f64, y: f64, tile: &str) -> GeoFeature {
        GeoFeature::point(
            x,
            y,
            Some(Crs::from_epsg(32635)),
            FeatureProperties {
                source_tile: tile.to_string(),
                label: "mound".to_string(),
                reasoning: Some(format!("seen on {tile}")),
            },
        )
    }

    #[test]
    fn test_close_pair_merges() {
        let clusterer = DetectionClusterer::new(20.0).unwrap();
        let points = clusterer.cluster(&[detection(0.0, 0.0, "a.png"), detection(5.0, 0.0, "b.png")]);
        assert_eq!(points.len(), 1);

        let merged = &points[0];
        assert_eq!(merged.member_count, 2);
        assert_eq!(merged.source_tiles, vec!["a.png", "b.png"]);
        assert!((merged.point.x() - 2.5).abs() < 1e-6);
        assert!(merged.point.y().abs() < 1e-6);
        assert_eq!(merged.reasoning.as_deref(), Some("seen on a.png"));
        assert_eq!(merged.crs, Some(Crs::from_epsg(32635)));
    }

    #[test]
    fn test_distant_pair_stays_apart() {
        let clusterer = DetectionClusterer::new(20.0).unwrap();
        let points = clusterer.cluster(&[detection(0.0, 0.0, "a.png"), detection(50.0, 0.0, "a.png")]);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].point, Point::new(0.0, 0.0));
        assert_eq!(points[1].point, Point::new(50.0, 0.0));
        assert!(points.iter().all(|p| p.member_count == 1));
    }

    #[test]
    fn test_empty_input() {
        let clusterer = DetectionClusterer::new(20.0).unwrap();
        assert!(clusterer.cluster(&[]).is_empty());
    }

    #[test]
    fn test_chain_merges_transitively() {
        // 0-15 and 15-30 overlap, 0-30 does not
        let clusterer = DetectionClusterer::new(20.0).unwrap();
        let chain = [
            detection(0.0, 0.0, "a.png"),
            detection(15.0, 0.0, "b.png"),
            detection(30.0, 0.0, "c.png"),
        ];
        let points = clusterer.cluster(&chain);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].member_count, 3);
        assert!((points[0].point.x() - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_box_features_use_centroids() {
        use crate::core::mapper::{map_detection, RawDetection, TileGeoref};

        let georef = TileGeoref::from_lower_left([0.0, 0.0, 1.0, 1.0]);
        let a = map_detection(&RawDetection::new([0.0, 0.0, 20.0, 20.0], "mound"), &georef, 1000, "a.png", None);
        let b = map_detection(&RawDetection::new([5.0, 5.0, 25.0, 25.0], "mound"), &georef, 1000, "b.png", None);
        let points = DetectionClusterer::new(20.0)
            .unwrap()
            .with_default_crs(Some(Crs::from_epsg(32635)))
            .cluster(&[a, b]);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].crs, Some(Crs::from_epsg(32635)));
    }

    #[test]
    fn test_rejects_bad_distance() {
        assert!(DetectionClusterer::new(0.0).is_err());
        assert!(DetectionClusterer::new(-5.0).is_err());
        assert!(DetectionClusterer::new(f64::INFINITY).is_err());
    }
}
