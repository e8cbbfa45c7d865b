//! End-to-end pipeline: insert → pack → prepare → decode MVT.

use std::collections::BTreeMap;

use prost::Message;

use tilery_core::feature::Feature;
use tilery_core::fixed::{
    FixedGeometry, FixedPoint, FixedPolygon, FixedPolygonPart, FixedPolyline,
};
use tilery_core::ingest::FeatureInserter;
use tilery_core::packer::pack_database;
use tilery_core::prepare::prepare_tiles;
use tilery_core::render::{make_render_ctx, render_tile};
use tilery_core::store::Store;
use tilery_core::tile::{tile_key, tile_of_key, TileCoord};
use tilery_core::vector_tile::Tile;
use tilery_core::Z_INDEX_DEFAULT;

fn meta(layer: &str, extra: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut m: BTreeMap<String, String> = extra
        .iter()
        .map(|&(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    m.insert("layer".to_owned(), layer.to_owned());
    m
}

/// A polygon filling most of one index tile.
fn landuse_polygon(tile: TileCoord) -> Feature {
    let b = tile.bounds();
    let inset = tile.span() / 10;
    Feature {
        id: 1,
        zoom_levels: (0, 20),
        meta: meta("landuse", &[("kind", "forest")]),
        geometry: FixedGeometry::Polygon(FixedPolygon {
            parts: vec![FixedPolygonPart {
                outer: vec![
                    FixedPoint::new(b.min.x + inset, b.min.y + inset),
                    FixedPoint::new(b.max.x - inset, b.min.y + inset),
                    FixedPoint::new(b.max.x - inset, b.max.y - inset),
                    FixedPoint::new(b.min.x + inset, b.max.y - inset),
                ],
                inner: vec![],
            }],
        }),
        ..Default::default()
    }
}

/// A road crossing the border between `tile` and its right-hand neighbor.
fn border_road(tile: TileCoord) -> Feature {
    let b = tile.bounds();
    let cy = (b.min.y + b.max.y) / 2;
    Feature {
        id: 2,
        zoom_levels: (0, 20),
        meta: meta("road", &[("highway", "primary")]),
        geometry: FixedGeometry::Polyline(FixedPolyline {
            lines: vec![vec![
                FixedPoint::new(b.max.x - 800_000, cy),
                FixedPoint::new(b.max.x + 800_000, cy),
            ]],
        }),
        ..Default::default()
    }
}

fn build_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();

    let polygon_tile = TileCoord::new(300, 400, Z_INDEX_DEFAULT);
    let road_tile = TileCoord::new(400, 300, Z_INDEX_DEFAULT);

    let mut inserter = FeatureInserter::new(&store);
    inserter.insert(landuse_polygon(polygon_tile)).unwrap();
    inserter.insert(border_road(road_tile)).unwrap();
    inserter.finish().unwrap();

    pack_database(&store).unwrap();
    (dir, store)
}

#[test]
fn test_prepare_builds_the_pyramid() {
    let (_dir, store) = build_store();
    prepare_tiles(&store, 2).unwrap();

    assert_eq!(store.max_prepared_zoom().unwrap(), Some(2));

    // The footprint spans x 300..=400, y 300..=400 at z10, which projects to
    // a single tile on every level up to z2.
    let mut stored: Vec<TileCoord> = store
        .tiles()
        .iter()
        .map(|e| tile_of_key(&e.unwrap().0).unwrap())
        .collect();
    stored.sort();
    assert_eq!(
        stored,
        vec![
            TileCoord::new(0, 0, 0),
            TileCoord::new(0, 0, 1),
            TileCoord::new(1, 1, 2),
        ]
    );

    // Every stored tile decodes as an MVT with both layers.
    for tile in &stored {
        let bytes = store.tiles().get(&tile_key(*tile)).unwrap().unwrap();
        let decoded = Tile::decode(bytes.as_ref()).unwrap();
        let names: Vec<_> = decoded.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["landuse", "road"], "tile {tile:?}");

        let landuse = &decoded.layers[0];
        assert_eq!(landuse.version, 2);
        assert_eq!(landuse.extent, Some(4096));
        assert_eq!(landuse.features.len(), 1);
        assert_eq!(landuse.features[0].id, Some(1));
        assert_eq!(landuse.keys, vec!["kind"]);
        assert_eq!(
            landuse.values[0].string_value.as_deref(),
            Some("forest")
        );
        assert!(!landuse.features[0].geometry.is_empty());
    }
}

#[test]
fn test_prepare_is_idempotent() {
    let (_dir, store) = build_store();
    prepare_tiles(&store, 2).unwrap();

    let snapshot: Vec<(Vec<u8>, Vec<u8>)> = store
        .tiles()
        .iter()
        .map(|e| {
            let (k, v) = e.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect();

    prepare_tiles(&store, 2).unwrap();
    let again: Vec<(Vec<u8>, Vec<u8>)> = store
        .tiles()
        .iter()
        .map(|e| {
            let (k, v) = e.unwrap();
            (k.to_vec(), v.to_vec())
        })
        .collect();

    assert_eq!(snapshot, again);
}

#[test]
fn test_render_tile_prepared_and_on_demand() {
    let (_dir, store) = build_store();
    prepare_tiles(&store, 2).unwrap();
    let ctx = make_render_ctx(&store).unwrap();

    // Within the prepared range: a plain lookup.
    let prepared = render_tile(&store, &ctx, TileCoord::new(0, 0, 0)).unwrap();
    assert_eq!(
        prepared,
        store
            .tiles()
            .get(&tile_key(TileCoord::new(0, 0, 0)))
            .unwrap()
            .unwrap()
            .to_vec()
    );

    // Beyond it: rendered on demand from the packs.
    let deep = render_tile(&store, &ctx, TileCoord::new(300, 400, 10)).unwrap();
    let decoded = Tile::decode(deep.as_slice()).unwrap();
    assert_eq!(decoded.layers.len(), 1);
    assert_eq!(decoded.layers[0].name, "landuse");

    // A prepared tile with no content is empty bytes.
    let empty = render_tile(&store, &ctx, TileCoord::new(3, 3, 2)).unwrap();
    assert!(empty.is_empty());
}

#[test]
fn test_border_road_renders_on_both_sides() {
    let (_dir, store) = build_store();
    let ctx = make_render_ctx(&store).unwrap();

    let left = render_tile(&store, &ctx, TileCoord::new(400, 300, 10)).unwrap();
    let right = render_tile(&store, &ctx, TileCoord::new(401, 300, 10)).unwrap();
    for bytes in [left, right] {
        let decoded = Tile::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.layers.len(), 1);
        assert_eq!(decoded.layers[0].name, "road");
        assert_eq!(decoded.layers[0].features.len(), 1);
    }
}

#[test]
fn test_prepare_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    prepare_tiles(&store, 3).unwrap();
    assert_eq!(store.max_prepared_zoom().unwrap(), Some(3));
    assert!(store.tiles().is_empty().unwrap());
}
