//! Feature record codec.
//!
//! A feature serializes to a compact protobuf message:
//!
//! | tag | field          | wire           | notes |
//! |-----|----------------|----------------|-------|
//! | 1   | header         | packed sint64  | `[min_z, max_z]` plus the bbox corners when known |
//! | 2   | id             | uint64         | |
//! | 3   | meta pairs     | packed uint32  | alternating key/value codes into the shared table, 0 = inline |
//! | 4   | meta keys      | repeated string| inline keys in pair order |
//! | 5   | meta values    | repeated string| inline values in pair order |
//! | 6   | simplify masks | repeated string| carried verbatim |
//! | 7   | geometry       | message        | kind + ring layout + delta-coded coordinates |
//!
//! Metadata is held in a `BTreeMap`, so iteration (and therefore the encoded
//! bytes) is deterministic. Unknown tags are skipped on decode.

use std::collections::BTreeMap;

use prost::Message;

use crate::fixed::{
    bounding_box, FixedGeometry, FixedPoint, FixedPolygon, FixedPolygonPart, FixedPolyline,
};
use crate::shared_strings::MetaCoding;
use crate::{Error, Result, INVALID_ZOOM};

/// Metadata key that routes a feature into its tile layer.
pub const META_KEY_LAYER: &str = "layer";

/// The atomic unit of the store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Feature {
    /// Source-assigned identifier; not globally unique across layers.
    pub id: u64,
    /// Inclusive `(min_z, max_z)` visibility range. `min_z ==`
    /// [`INVALID_ZOOM`] marks an unclassified feature and is rejected by the
    /// packer.
    pub zoom_levels: (u8, u8),
    pub meta: BTreeMap<String, String>,
    /// Per-zoom vertex-retention masks; carried through the codec, unused by
    /// the direct simplification path.
    pub simplify_masks: Vec<String>,
    pub geometry: FixedGeometry,
}

impl Feature {
    pub fn layer_name(&self) -> Option<&str> {
        self.meta.get(META_KEY_LAYER).map(String::as_str)
    }

    pub fn min_z(&self) -> u8 {
        self.zoom_levels.0
    }

    pub fn max_z(&self) -> u8 {
        self.zoom_levels.1
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct FeatureRecord {
    #[prost(sint64, repeated, tag = "1")]
    header: Vec<i64>,
    #[prost(uint64, required, tag = "2")]
    id: u64,
    #[prost(uint32, repeated, tag = "3")]
    meta_pairs: Vec<u32>,
    #[prost(string, repeated, tag = "4")]
    meta_keys: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    meta_values: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    simplify_masks: Vec<String>,
    #[prost(message, optional, tag = "7")]
    geometry: Option<GeometryRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct GeometryRecord {
    #[prost(enumeration = "GeometryKind", tag = "1")]
    kind: i32,
    /// Vertex count per line (polylines) or per ring (polygons).
    #[prost(uint32, repeated, tag = "2")]
    sizes: Vec<u32>,
    /// Rings per polygon part; the first ring of each part is the outer.
    #[prost(uint32, repeated, tag = "3")]
    part_rings: Vec<u32>,
    /// Delta-coded x/y pairs, one running cursor across all parts.
    #[prost(sint64, repeated, tag = "4")]
    coords: Vec<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
enum GeometryKind {
    Null = 0,
    Point = 1,
    Polyline = 2,
    Polygon = 3,
}

/// Serialize a feature, replacing shared metadata strings by their codes.
pub fn serialize_feature(feature: &Feature, coding: &MetaCoding) -> Vec<u8> {
    let mut header = vec![feature.min_z() as i64, feature.max_z() as i64];
    let bbox = bounding_box(&feature.geometry);
    if bbox.is_valid() {
        header.extend([bbox.min.x, bbox.min.y, bbox.max.x, bbox.max.y]);
    }

    let mut meta_pairs = Vec::with_capacity(feature.meta.len() * 2);
    let mut meta_keys = Vec::new();
    let mut meta_values = Vec::new();
    for (key, value) in &feature.meta {
        let key_code = coding.code_of(key);
        meta_pairs.push(key_code);
        if key_code == 0 {
            meta_keys.push(key.clone());
        }
        let value_code = coding.code_of(value);
        meta_pairs.push(value_code);
        if value_code == 0 {
            meta_values.push(value.clone());
        }
    }

    FeatureRecord {
        header,
        id: feature.id,
        meta_pairs,
        meta_keys,
        meta_values,
        simplify_masks: feature.simplify_masks.clone(),
        geometry: Some(encode_geometry(&feature.geometry)),
    }
    .encode_to_vec()
}

/// Decode a feature, resolving shared-string codes through `coding`.
pub fn deserialize_feature(bytes: &[u8], coding: &MetaCoding) -> Result<Feature> {
    let record = FeatureRecord::decode(bytes)?;

    if record.header.len() != 2 && record.header.len() != 6 {
        return Err(decode_err("header must hold 2 or 6 values"));
    }
    let min_z = zoom(record.header[0])?;
    let max_z = zoom(record.header[1])?;

    if record.meta_pairs.len() % 2 != 0 {
        return Err(decode_err("odd number of meta pair entries"));
    }
    let mut inline_keys = record.meta_keys.into_iter();
    let mut inline_values = record.meta_values.into_iter();
    let mut meta = BTreeMap::new();
    for pair in record.meta_pairs.chunks(2) {
        let key = resolve(pair[0], coding, &mut inline_keys)?;
        let value = resolve(pair[1], coding, &mut inline_values)?;
        meta.insert(key, value);
    }

    let geometry = match &record.geometry {
        Some(geometry) => decode_geometry(geometry)?,
        None => return Err(decode_err("missing geometry")),
    };
    Ok(Feature {
        id: record.id,
        zoom_levels: (min_z, max_z),
        meta,
        simplify_masks: record.simplify_masks,
        geometry,
    })
}

fn zoom(value: i64) -> Result<u8> {
    if (0..=INVALID_ZOOM as i64).contains(&value) {
        Ok(value as u8)
    } else {
        Err(decode_err("zoom level out of range"))
    }
}

fn resolve(
    code: u32,
    coding: &MetaCoding,
    inline: &mut impl Iterator<Item = String>,
) -> Result<String> {
    if code == 0 {
        inline
            .next()
            .ok_or_else(|| decode_err("missing inline meta string"))
    } else {
        coding
            .string_of(code)
            .map(str::to_owned)
            .ok_or_else(|| decode_err("meta code outside shared-string table"))
    }
}

fn decode_err(reason: &str) -> Error {
    Error::Decode {
        key: "feature".into(),
        reason: reason.into(),
    }
}

struct DeltaCursor {
    x: i64,
    y: i64,
}

impl DeltaCursor {
    fn new() -> Self {
        Self { x: 0, y: 0 }
    }

    fn push(&mut self, p: FixedPoint, coords: &mut Vec<i64>) {
        coords.push(p.x - self.x);
        coords.push(p.y - self.y);
        self.x = p.x;
        self.y = p.y;
    }

    fn pull(&mut self, coords: &mut std::slice::Iter<'_, i64>) -> Result<FixedPoint> {
        let dx = coords.next().ok_or_else(|| decode_err("truncated coords"))?;
        let dy = coords.next().ok_or_else(|| decode_err("truncated coords"))?;
        self.x += dx;
        self.y += dy;
        Ok(FixedPoint::new(self.x, self.y))
    }
}

fn encode_geometry(geometry: &FixedGeometry) -> GeometryRecord {
    let mut record = GeometryRecord::default();
    let mut cursor = DeltaCursor::new();
    match geometry {
        FixedGeometry::Null => record.kind = GeometryKind::Null as i32,
        FixedGeometry::Point(p) => {
            record.kind = GeometryKind::Point as i32;
            cursor.push(*p, &mut record.coords);
        }
        FixedGeometry::Polyline(polyline) => {
            record.kind = GeometryKind::Polyline as i32;
            for line in &polyline.lines {
                record.sizes.push(line.len() as u32);
                for p in line {
                    cursor.push(*p, &mut record.coords);
                }
            }
        }
        FixedGeometry::Polygon(polygon) => {
            record.kind = GeometryKind::Polygon as i32;
            for part in &polygon.parts {
                record.part_rings.push(1 + part.inner.len() as u32);
                for ring in std::iter::once(&part.outer).chain(&part.inner) {
                    record.sizes.push(ring.len() as u32);
                    for p in ring {
                        cursor.push(*p, &mut record.coords);
                    }
                }
            }
        }
    }
    record
}

fn decode_geometry(record: &GeometryRecord) -> Result<FixedGeometry> {
    let mut cursor = DeltaCursor::new();
    let mut coords = record.coords.iter();
    let mut read_line = |size: u32| -> Result<Vec<FixedPoint>> {
        (0..size).map(|_| cursor.pull(&mut coords)).collect()
    };

    let geometry = match GeometryKind::try_from(record.kind)
        .map_err(|_| decode_err("unknown geometry kind"))?
    {
        GeometryKind::Null => FixedGeometry::Null,
        GeometryKind::Point => {
            if record.coords.len() != 2 {
                return Err(decode_err("point must carry one coordinate pair"));
            }
            FixedGeometry::Point(read_line(1)?[0])
        }
        GeometryKind::Polyline => {
            let lines = record
                .sizes
                .iter()
                .map(|&size| read_line(size))
                .collect::<Result<Vec<_>>>()?;
            FixedGeometry::Polyline(FixedPolyline { lines })
        }
        GeometryKind::Polygon => {
            let mut sizes = record.sizes.iter();
            let mut parts = Vec::with_capacity(record.part_rings.len());
            for &rings in &record.part_rings {
                if rings == 0 {
                    return Err(decode_err("polygon part without rings"));
                }
                let mut next_ring = || -> Result<Vec<FixedPoint>> {
                    let &size = sizes.next().ok_or_else(|| decode_err("missing ring size"))?;
                    read_line(size)
                };
                let outer = next_ring()?;
                let inner = (1..rings).map(|_| next_ring()).collect::<Result<Vec<_>>>()?;
                parts.push(FixedPolygonPart { outer, inner });
            }
            FixedGeometry::Polygon(FixedPolygon { parts })
        }
    };
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FixedPoint;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    fn sample_polygon() -> FixedGeometry {
        FixedGeometry::Polygon(FixedPolygon {
            parts: vec![FixedPolygonPart {
                outer: vec![
                    FixedPoint::new(1 << 20, 1 << 20),
                    FixedPoint::new(3 << 20, 1 << 20),
                    FixedPoint::new(3 << 20, 3 << 20),
                    FixedPoint::new(1 << 20, 3 << 20),
                ],
                inner: vec![vec![
                    FixedPoint::new(3 << 19, 3 << 19),
                    FixedPoint::new(3 << 19, 1 << 20),
                    FixedPoint::new(1 << 20, 1 << 20),
                ]],
            }],
        })
    }

    #[test]
    fn test_round_trip_with_empty_coding() {
        let feature = Feature {
            id: 42,
            zoom_levels: (6, 18),
            meta: meta(&[("layer", "water"), ("name", "Bodensee")]),
            simplify_masks: vec!["\x01\x02".into()],
            geometry: sample_polygon(),
        };
        let coding = MetaCoding::empty();
        let bytes = serialize_feature(&feature, &coding);
        let decoded = deserialize_feature(&bytes, &coding).unwrap();
        assert_eq!(decoded, feature);
    }

    #[test]
    fn test_round_trip_with_shared_codes() {
        let coding = MetaCoding::from_strings(vec!["layer".into(), "water".into()]);
        let feature = Feature {
            id: 7,
            zoom_levels: (0, 20),
            meta: meta(&[("layer", "water"), ("intermittent", "yes")]),
            geometry: FixedGeometry::Point(FixedPoint::new(123, 456)),
            ..Default::default()
        };
        let bytes = serialize_feature(&feature, &coding);
        let decoded = deserialize_feature(&bytes, &coding).unwrap();
        assert_eq!(decoded, feature);

        // Coded strings must not appear inline in the wire bytes.
        let inline_free = serialize_feature(
            &Feature {
                meta: meta(&[("layer", "water")]),
                geometry: FixedGeometry::Point(FixedPoint::new(123, 456)),
                ..feature.clone()
            },
            &coding,
        );
        assert!(!inline_free.windows(5).any(|w| w == b"water"));
    }

    #[test]
    fn test_round_trip_null_geometry_omits_bbox() {
        let feature = Feature {
            id: 1,
            zoom_levels: (3, 9),
            geometry: FixedGeometry::Null,
            ..Default::default()
        };
        let coding = MetaCoding::empty();
        let with_null = serialize_feature(&feature, &coding);
        let with_box = serialize_feature(
            &Feature {
                geometry: FixedGeometry::Point(FixedPoint::new(5, 5)),
                ..feature.clone()
            },
            &coding,
        );
        assert!(with_null.len() < with_box.len());
        assert_eq!(deserialize_feature(&with_null, &coding).unwrap(), feature);
    }

    #[test]
    fn test_polyline_round_trip() {
        let feature = Feature {
            id: 9,
            zoom_levels: (10, 14),
            meta: meta(&[("layer", "road")]),
            geometry: FixedGeometry::Polyline(FixedPolyline {
                lines: vec![
                    vec![FixedPoint::new(0, 0), FixedPoint::new(-5, 17)],
                    vec![
                        FixedPoint::new(1 << 30, 1 << 29),
                        FixedPoint::new((1 << 30) + 4096, 1 << 29),
                    ],
                ],
            }),
            ..Default::default()
        };
        let coding = MetaCoding::empty();
        let decoded = deserialize_feature(&serialize_feature(&feature, &coding), &coding).unwrap();
        assert_eq!(decoded, feature);
    }

    #[test]
    fn test_decode_code_outside_table_fails() {
        let coding = MetaCoding::from_strings(vec!["layer".into()]);
        let feature = Feature {
            meta: meta(&[("layer", "x")]),
            ..Default::default()
        };
        let bytes = serialize_feature(&feature, &coding);
        // Decoding against a smaller table must fail, not mis-resolve.
        let err = deserialize_feature(&bytes, &MetaCoding::empty()).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_garbage_bytes_fail() {
        assert!(deserialize_feature(&[0xff, 0xff, 0x01], &MetaCoding::empty()).is_err());
    }
}
