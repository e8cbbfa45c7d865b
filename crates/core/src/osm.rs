//! OSM import: PBF reading, tag classification, geometry projection.
//!
//! Two passes over the PBF: the first caches node locations (projected to
//! fixed Web-Mercator coordinates), the second classifies tagged nodes and
//! ways and feeds approved features to the [`FeatureInserter`]. The
//! classifier is swappable; [`DefaultProfile`] covers the usual base-map
//! layers. Relation/multipolygon assembly is out of scope.

use std::collections::HashMap;
use std::path::Path;

use osmpbf::{Element, ElementReader};

use crate::feature::{Feature, META_KEY_LAYER};
use crate::fixed::{bounding_box, FixedGeometry, FixedPoint, FixedPolygon, FixedPolygonPart, FixedPolyline};
use crate::ingest::{FeatureInserter, LayerNamesBuilder};
use crate::store::Store;
use crate::{Result, Z_INTERNAL, Z_MAX};

/// Project WGS84 to fixed Web-Mercator coordinates at [`Z_INTERNAL`].
pub fn lon_lat_to_fixed(lon: f64, lat: f64) -> FixedPoint {
    let world = (1u64 << 32) as f64;
    let lat = lat.clamp(-85.0511, 85.0511);
    let x = (lon + 180.0) / 360.0 * world;
    let y = (1.0 - lat.to_radians().tan().asinh() / std::f64::consts::PI) / 2.0 * world;
    let max = (1i64 << 32) - 1;
    FixedPoint::new(
        (x as i64).clamp(0, max),
        (y as i64).clamp(0, max),
    )
}

/// A feature candidate handed to the classifier.
pub struct PendingFeature {
    id: i64,
    tags: Vec<(String, String)>,
    /// Closed ways eligible for polygon assembly.
    pub closed: bool,
    approved: bool,
    zoom_levels: (u8, u8),
    target_layer: Option<String>,
    tag_as_metadata: Vec<String>,
    metadata: Vec<(String, String)>,
    /// Bounding-box area in fixed units², for area-scaled zoom approval.
    bbox_area: u128,
}

impl PendingFeature {
    fn new(id: i64, tags: Vec<(String, String)>, closed: bool, bbox_area: u128) -> Self {
        Self {
            id,
            tags,
            closed,
            approved: false,
            zoom_levels: (0, Z_MAX),
            target_layer: None,
            tag_as_metadata: Vec::new(),
            metadata: Vec::new(),
            bbox_area,
        }
    }

    pub fn get_id(&self) -> i64 {
        self.id
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tag(key) == Some(value)
    }

    pub fn has_any_tag(&self, key: &str, values: &[&str]) -> bool {
        self.tag(key).is_some_and(|v| values.contains(&v))
    }

    /// Approve with an explicit minimum zoom.
    pub fn set_approved_min(&mut self, min_z: u8) {
        self.approved = true;
        self.zoom_levels = (min_z.min(Z_MAX), Z_MAX);
    }

    /// Approve with a minimum zoom derived from the feature's size: the
    /// first zoom at which its bounding box covers at least ~16 px².
    pub fn set_approved_min_by_area(&mut self, floor_z: u8) {
        let mut min_z = Z_MAX;
        for z in 0..=Z_MAX {
            let shifted = self.bbox_area >> (2 * (Z_INTERNAL - z) as u32);
            if shifted >= 16 {
                min_z = z;
                break;
            }
        }
        self.set_approved_min(min_z.max(floor_z));
    }

    /// Approve for the full zoom range.
    pub fn set_approved_full(&mut self) {
        self.set_approved_min(0);
    }

    pub fn set_target_layer(&mut self, name: &str) {
        self.target_layer = Some(name.to_owned());
    }

    /// Copy the value of `key` from the source tags into the metadata.
    pub fn add_tag_as_metadata(&mut self, key: &str) {
        self.tag_as_metadata.push(key.to_owned());
    }

    pub fn add_metadata(&mut self, key: &str, value: &str) {
        self.metadata.push((key.to_owned(), value.to_owned()));
    }

    fn into_feature(self, geometry: FixedGeometry, layer_names: &mut LayerNamesBuilder) -> Option<Feature> {
        let layer = self.target_layer.clone()?;
        layer_names.layer_index(&layer);

        let mut meta = std::collections::BTreeMap::new();
        for key in &self.tag_as_metadata {
            if let Some(value) = self.tag(key) {
                meta.insert(key.clone(), value.to_owned());
            }
        }
        for (key, value) in self.metadata {
            meta.insert(key, value);
        }
        meta.insert(META_KEY_LAYER.to_owned(), layer);

        Some(Feature {
            id: self.id.unsigned_abs(),
            zoom_levels: self.zoom_levels,
            meta,
            geometry,
            ..Default::default()
        })
    }
}

/// Tag-to-feature classification, swappable per deployment.
pub trait Classifier {
    fn classify_node(&self, feature: &mut PendingFeature);
    fn classify_way(&self, feature: &mut PendingFeature);
}

/// Built-in base-map profile: roads, rail, water, buildings, landuse,
/// boundaries, places.
pub struct DefaultProfile;

impl Classifier for DefaultProfile {
    fn classify_node(&self, f: &mut PendingFeature) {
        if let Some(place) = f.tag("place") {
            let min_z = match place {
                "city" => 6,
                "town" => 9,
                "village" => 12,
                _ => 14,
            };
            f.set_target_layer("place");
            f.set_approved_min(min_z);
            f.add_tag_as_metadata("name");
            f.add_tag_as_metadata("place");
        } else if f.tag("amenity").is_some() || f.tag("shop").is_some() {
            f.set_target_layer("poi");
            f.set_approved_min(15);
            f.add_tag_as_metadata("name");
            f.add_tag_as_metadata("amenity");
            f.add_tag_as_metadata("shop");
        }
    }

    fn classify_way(&self, f: &mut PendingFeature) {
        if let Some(highway) = f.tag("highway") {
            let min_z = match highway {
                "motorway" | "trunk" => 5,
                "primary" => 8,
                "secondary" => 10,
                "tertiary" => 11,
                "residential" | "unclassified" => 13,
                _ => 14,
            };
            f.set_target_layer("road");
            f.set_approved_min(min_z);
            f.add_tag_as_metadata("name");
            f.add_tag_as_metadata("highway");
        } else if f.tag("railway").is_some() {
            f.set_target_layer("rail");
            f.set_approved_min(8);
            f.add_tag_as_metadata("railway");
        } else if f.closed && f.tag("building").is_some() {
            f.set_target_layer("building");
            f.set_approved_min(14);
        } else if f.has_tag("natural", "water")
            || f.tag("waterway").is_some()
            || f.has_any_tag("landuse", &["reservoir", "basin"])
        {
            f.set_target_layer("water");
            if f.closed {
                f.set_approved_min_by_area(4);
            } else {
                f.set_approved_min(10);
            }
            f.add_tag_as_metadata("name");
        } else if f.closed && (f.tag("landuse").is_some() || f.tag("leisure").is_some() || f.tag("natural").is_some()) {
            f.set_target_layer("landuse");
            f.set_approved_min_by_area(7);
            f.add_tag_as_metadata("landuse");
            f.add_tag_as_metadata("leisure");
            f.add_tag_as_metadata("natural");
        } else if f.has_tag("boundary", "administrative") {
            f.set_target_layer("boundary");
            f.set_approved_min(2);
            f.add_tag_as_metadata("admin_level");
        }
    }
}

/// Whether a closed way should become a polygon rather than a ring road.
fn is_area(tags: &[(String, String)]) -> bool {
    tags.iter().any(|(k, v)| {
        matches!(
            k.as_str(),
            "building" | "landuse" | "leisure" | "natural" | "amenity"
        ) || (k == "area" && v == "yes")
    })
}

/// Import an OSM PBF extract into the feature store.
pub fn import_osm(store: &Store, path: &Path, classifier: &dyn Classifier) -> Result<u64> {
    // Pass 1: node locations, projected once.
    let mut locations: HashMap<i64, FixedPoint> = HashMap::new();
    let reader = ElementReader::from_path(path)?;
    reader.for_each(|element| match element {
        Element::Node(node) => {
            locations.insert(node.id(), lon_lat_to_fixed(node.lon(), node.lat()));
        }
        Element::DenseNode(node) => {
            locations.insert(node.id(), lon_lat_to_fixed(node.lon(), node.lat()));
        }
        _ => {}
    })?;
    log::info!("cached {} node locations", locations.len());

    // Pass 2: classify and insert.
    let mut layer_names = LayerNamesBuilder::load(store)?;
    let mut inserter = FeatureInserter::new(store);
    let mut failure: Option<crate::Error> = None;

    let reader = ElementReader::from_path(path)?;
    reader.for_each(|element| {
        if failure.is_some() {
            return;
        }
        let handled = match element {
            Element::Node(node) => handle_node(
                node.id(),
                node.tags().map(|(k, v)| (k.to_owned(), v.to_owned())).collect(),
                lon_lat_to_fixed(node.lon(), node.lat()),
                classifier,
                &mut layer_names,
                &mut inserter,
            ),
            Element::DenseNode(node) => handle_node(
                node.id(),
                node.tags().map(|(k, v)| (k.to_owned(), v.to_owned())).collect(),
                lon_lat_to_fixed(node.lon(), node.lat()),
                classifier,
                &mut layer_names,
                &mut inserter,
            ),
            Element::Way(way) => {
                let tags: Vec<(String, String)> =
                    way.tags().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
                if tags.is_empty() {
                    Ok(())
                } else {
                    let points: Vec<FixedPoint> = way
                        .refs()
                        .filter_map(|id| locations.get(&id).copied())
                        .collect();
                    handle_way(way.id(), tags, points, classifier, &mut layer_names, &mut inserter)
                }
            }
            Element::Relation(_) => Ok(()),
        };
        if let Err(e) = handled {
            failure = Some(e);
        }
    })?;
    if let Some(e) = failure {
        return Err(e);
    }

    layer_names.save(store)?;
    let inserted = inserter.finish()?;
    log::info!(
        "imported {inserted} features across {} layers",
        layer_names.names().len()
    );
    Ok(inserted)
}

fn handle_node(
    id: i64,
    tags: Vec<(String, String)>,
    location: FixedPoint,
    classifier: &dyn Classifier,
    layer_names: &mut LayerNamesBuilder,
    inserter: &mut FeatureInserter,
) -> Result<()> {
    if tags.is_empty() {
        return Ok(());
    }
    let mut pending = PendingFeature::new(id, tags, false, 0);
    classifier.classify_node(&mut pending);
    if !pending.approved {
        return Ok(());
    }
    if let Some(feature) = pending.into_feature(FixedGeometry::Point(location), layer_names) {
        inserter.insert(feature)?;
    }
    Ok(())
}

fn handle_way(
    id: i64,
    tags: Vec<(String, String)>,
    mut points: Vec<FixedPoint>,
    classifier: &dyn Classifier,
    layer_names: &mut LayerNamesBuilder,
    inserter: &mut FeatureInserter,
) -> Result<()> {
    if points.len() < 2 {
        return Ok(());
    }
    let closed = points.len() >= 4 && points.first() == points.last();

    let geometry = if closed && is_area(&tags) {
        points.pop(); // drop the closing duplicate
        FixedGeometry::Polygon(FixedPolygon {
            parts: vec![FixedPolygonPart {
                outer: points,
                inner: vec![],
            }],
        })
    } else {
        FixedGeometry::Polyline(FixedPolyline { lines: vec![points] })
    };

    let bbox = bounding_box(&geometry);
    let bbox_area = if bbox.is_valid() {
        (bbox.max.x - bbox.min.x) as u128 * (bbox.max.y - bbox.min.y) as u128
    } else {
        0
    };

    let mut pending = PendingFeature::new(id, tags, closed, bbox_area);
    classifier.classify_way(&mut pending);
    if !pending.approved {
        return Ok(());
    }
    if let Some(feature) = pending.into_feature(geometry, layer_names) {
        inserter.insert(feature)?;
    }
    Ok(())
}
