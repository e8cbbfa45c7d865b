//! MVT (Mapbox Vector Tile) encoding.
//!
//! Turns shifted fixed geometry into MVT geometry commands and assembles
//! per-layer protobuf messages:
//!
//! - **Zigzag encoding**: signed deltas as small unsigned varints
//! - **Command encoding**: `(command_id | (count << 3))`
//! - **Winding**: exterior rings surveyor-positive, holes negative
//! - **Layer building**: first-seen key/value caches, version 2, extent 4096
//!
//! Reference: <https://github.com/mapbox/vector-tile-spec>

use std::collections::HashMap;

use crate::feature::{Feature, META_KEY_LAYER};
use crate::fixed::{ring_area2, FixedGeometry, FixedPoint};
use crate::tile::TileCoord;
use crate::vector_tile::tile::{Feature as MvtFeature, GeomType, Layer, Value};

/// Tile extent (4096 as per MVT spec).
pub const EXTENT: u32 = 4096;

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

#[inline]
pub fn zigzag_encode(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

#[inline]
pub fn zigzag_decode(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

#[inline]
pub fn command_encode(command_id: u32, count: u32) -> u32 {
    (command_id & 0x7) | (count << 3)
}

#[inline]
pub fn command_decode(command: u32) -> (u32, u32) {
    (command & 0x7, command >> 3)
}

/// Relative-coordinate cursor shared across all parts of one feature.
struct GeometryWriter {
    commands: Vec<u32>,
    cursor: FixedPoint,
    origin: FixedPoint,
}

impl GeometryWriter {
    fn new(tile: TileCoord) -> Self {
        Self {
            commands: Vec::new(),
            cursor: FixedPoint::new(0, 0),
            origin: FixedPoint::new(tile.x as i64 * EXTENT as i64, tile.y as i64 * EXTENT as i64),
        }
    }

    fn push_delta(&mut self, p: FixedPoint) {
        let local = FixedPoint::new(p.x - self.origin.x, p.y - self.origin.y);
        self.commands.push(zigzag_encode((local.x - self.cursor.x) as i32));
        self.commands.push(zigzag_encode((local.y - self.cursor.y) as i32));
        self.cursor = local;
    }

    fn line(&mut self, points: &[FixedPoint], close: bool) {
        if points.len() < 2 {
            return;
        }
        self.commands.push(command_encode(CMD_MOVE_TO, 1));
        self.push_delta(points[0]);
        self.commands.push(command_encode(CMD_LINE_TO, points.len() as u32 - 1));
        for p in &points[1..] {
            self.push_delta(*p);
        }
        if close {
            self.commands.push(command_encode(CMD_CLOSE_PATH, 1));
        }
    }

    fn ring(&mut self, ring: &[FixedPoint], exterior: bool) {
        if ring.len() < 3 {
            return;
        }
        // Exterior rings must be surveyor-positive, holes negative.
        let positive = ring_area2(ring) > 0;
        if positive == exterior {
            self.line(ring, true);
        } else {
            let reversed: Vec<FixedPoint> = ring.iter().rev().copied().collect();
            self.line(&reversed, true);
        }
    }
}

/// Encode a geometry (already shifted into `tile`'s zoom pixel grid) as MVT
/// commands in tile-local coordinates.
pub fn encode_geometry(geometry: &FixedGeometry, tile: TileCoord) -> (Vec<u32>, GeomType) {
    let mut writer = GeometryWriter::new(tile);
    let geom_type = match geometry {
        FixedGeometry::Null => GeomType::Unknown,
        FixedGeometry::Point(p) => {
            writer.commands.push(command_encode(CMD_MOVE_TO, 1));
            writer.push_delta(*p);
            GeomType::Point
        }
        FixedGeometry::Polyline(polyline) => {
            for line in &polyline.lines {
                writer.line(line, false);
            }
            GeomType::Linestring
        }
        FixedGeometry::Polygon(polygon) => {
            for part in &polygon.parts {
                writer.ring(&part.outer, true);
                for hole in &part.inner {
                    writer.ring(hole, false);
                }
            }
            GeomType::Polygon
        }
    };
    (writer.commands, geom_type)
}

/// Builds one MVT layer, deduplicating tag keys and values in first-seen
/// order.
pub struct LayerBuilder {
    name: String,
    features: Vec<MvtFeature>,
    keys: Vec<String>,
    key_index: HashMap<String, u32>,
    values: Vec<Value>,
    value_index: HashMap<String, u32>,
}

impl LayerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Vec::new(),
            keys: Vec::new(),
            key_index: HashMap::new(),
            values: Vec::new(),
            value_index: HashMap::new(),
        }
    }

    fn key_index_of(&mut self, key: &str) -> u32 {
        if let Some(&idx) = self.key_index.get(key) {
            return idx;
        }
        let idx = self.keys.len() as u32;
        self.keys.push(key.to_owned());
        self.key_index.insert(key.to_owned(), idx);
        idx
    }

    fn value_index_of(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.value_index.get(value) {
            return idx;
        }
        let idx = self.values.len() as u32;
        self.values.push(Value {
            string_value: Some(value.to_owned()),
            ..Default::default()
        });
        self.value_index.insert(value.to_owned(), idx);
        idx
    }

    /// Add a feature whose geometry has already survived the clip pipeline
    /// (shifted into `tile`'s pixel grid).
    pub fn add_feature(&mut self, feature: &Feature, geometry: &FixedGeometry, tile: TileCoord) {
        let (commands, geom_type) = encode_geometry(geometry, tile);
        if commands.is_empty() {
            return;
        }

        let mut tags = Vec::new();
        for (key, value) in &feature.meta {
            // The routing key and internal markers are not tile content.
            if key == META_KEY_LAYER || key.starts_with("__") {
                continue;
            }
            tags.push(self.key_index_of(key));
            tags.push(self.value_index_of(value));
        }

        self.features.push(MvtFeature {
            id: Some(feature.id),
            tags,
            r#type: Some(geom_type as i32),
            geometry: commands,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn build(self) -> Layer {
        Layer {
            version: 2,
            name: self.name,
            features: self.features,
            keys: self.keys,
            values: self.values,
            extent: Some(EXTENT),
        }
    }
}
