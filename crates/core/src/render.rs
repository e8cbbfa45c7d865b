//! Tile assembly and serving.
//!
//! [`build_tile`] runs the geometry pipeline (simplify → clip → shift →
//! encode) over the pack records relevant to one tile and assembles the MVT
//! message; [`render_tile`] is the serving entry point: a single `tiles`
//! lookup for prepared zooms, an on-demand build beyond them.

use prost::Message;
use sled::IVec;

use crate::clip::clip;
use crate::feature::deserialize_feature;
use crate::fixed::shift;
use crate::mvt::LayerBuilder;
use crate::pack::{collect_packs, Pack};
use crate::shared_strings::{decode_string_table, load_meta_coding, MetaCoding};
use crate::simplify::simplify;
use crate::store::{Store, META_KEY_LAYER_NAMES};
use crate::tile::{tile_key, TileCoord};
use crate::vector_tile::Tile;
use crate::Result;
use std::collections::BTreeMap;

/// Immutable context shared by all render workers.
pub struct RenderCtx {
    pub coding: MetaCoding,
    pub layer_names: Vec<String>,
    pub max_prepared_zoom: Option<u8>,
}

pub fn make_render_ctx(store: &Store) -> Result<RenderCtx> {
    let layer_names = match store.meta_get_raw(META_KEY_LAYER_NAMES)? {
        Some(bytes) => decode_string_table(&bytes)?,
        None => Vec::new(),
    };
    Ok(RenderCtx {
        coding: load_meta_coding(store)?,
        layer_names,
        max_prepared_zoom: store.max_prepared_zoom()?,
    })
}

/// Build the MVT bytes for `tile` from its covering packs. Returns `None`
/// when no layer keeps any geometry (a zero-layer tile encodes to zero
/// bytes, which the preparer skips storing).
pub fn build_tile(
    ctx: &RenderCtx,
    tile: TileCoord,
    packs: &[(TileCoord, IVec)],
) -> Result<Option<Vec<u8>>> {
    let draw_bounds = tile.draw_bounds();
    let mut builders: BTreeMap<String, LayerBuilder> = BTreeMap::new();

    for (pack_tile, value) in packs {
        let pack = Pack::parse(*pack_tile, value)?;
        let mut record_error = None;
        pack.records_foreach(tile, &mut |bytes| {
            if record_error.is_some() {
                return;
            }
            match deserialize_feature(bytes, &ctx.coding) {
                Ok(feature) => {
                    let Some(layer) = feature.layer_name().map(str::to_owned) else {
                        log::debug!("skipping feature {} without layer key", feature.id);
                        return;
                    };

                    if tile.z < feature.min_z() || tile.z > feature.max_z() {
                        return;
                    }

                    let geometry = simplify(&feature.geometry, tile.z);
                    let mut geometry = clip(&geometry, &draw_bounds);
                    if geometry.is_null() {
                        return;
                    }
                    shift(&mut geometry, tile.z);

                    builders
                        .entry(layer)
                        .or_insert_with_key(|name| LayerBuilder::new(name.clone()))
                        .add_feature(&feature, &geometry, tile);
                }
                Err(e) => record_error = Some(e),
            }
        })?;
        if let Some(e) = record_error {
            return Err(e);
        }
    }

    let layers: Vec<_> = builders
        .into_values()
        .filter(|builder| !builder.is_empty())
        .map(LayerBuilder::build)
        .collect();
    if layers.is_empty() {
        return Ok(None);
    }
    Ok(Some(Tile { layers }.encode_to_vec()))
}

/// Serve one tile: a key lookup within the prepared range, an on-demand
/// render beyond it. Unknown/empty tiles yield empty bytes.
pub fn render_tile(store: &Store, ctx: &RenderCtx, tile: TileCoord) -> Result<Vec<u8>> {
    if ctx.max_prepared_zoom.is_some_and(|max| tile.z <= max) {
        return Ok(store
            .tiles()
            .get(&tile_key(tile))?
            .map(|v| v.to_vec())
            .unwrap_or_default());
    }

    let packs = collect_packs(&store.features(), tile)?;
    Ok(build_tile(ctx, tile, &packs)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{serialize_feature, Feature};
    use crate::fixed::{FixedGeometry, FixedPoint, FixedPolygon, FixedPolygonPart};
    use crate::pack::pack_features;

    fn polygon_in(tile: TileCoord) -> FixedGeometry {
        let b = tile.bounds();
        let w = tile.span() / 4;
        FixedGeometry::Polygon(FixedPolygon {
            parts: vec![FixedPolygonPart {
                outer: vec![
                    FixedPoint::new(b.min.x + w, b.min.y + w),
                    FixedPoint::new(b.max.x - w, b.min.y + w),
                    FixedPoint::new(b.max.x - w, b.max.y - w),
                    FixedPoint::new(b.min.x + w, b.max.y - w),
                ],
                inner: vec![],
            }],
        })
    }

    fn ctx() -> RenderCtx {
        RenderCtx {
            coding: MetaCoding::empty(),
            layer_names: vec!["landuse".into()],
            max_prepared_zoom: None,
        }
    }

    fn packed(tile: TileCoord, features: &[Feature]) -> Vec<(TileCoord, IVec)> {
        let coding = MetaCoding::empty();
        let raw: Vec<_> = features
            .iter()
            .map(|f| serialize_feature(f, &coding))
            .collect();
        vec![(tile, IVec::from(pack_features(tile, &coding, &raw).unwrap()))]
    }

    #[test]
    fn test_build_tile_with_one_polygon() {
        let index = TileCoord::new(300, 400, 10);
        let feature = Feature {
            id: 77,
            zoom_levels: (0, 20),
            meta: [
                ("layer".to_owned(), "landuse".to_owned()),
                ("kind".to_owned(), "forest".to_owned()),
            ]
            .into(),
            geometry: polygon_in(index),
            ..Default::default()
        };
        let packs = packed(index, &[feature]);

        let bytes = build_tile(&ctx(), index, &packs).unwrap().unwrap();
        let tile = Tile::decode(bytes.as_slice()).unwrap();
        assert_eq!(tile.layers.len(), 1);
        let layer = &tile.layers[0];
        assert_eq!(layer.name, "landuse");
        assert_eq!(layer.version, 2);
        assert_eq!(layer.extent, Some(4096));
        assert_eq!(layer.features.len(), 1);
        assert_eq!(layer.features[0].id, Some(77));
        assert_eq!(layer.keys, vec!["kind"]);
    }

    #[test]
    fn test_zoom_range_filter() {
        let index = TileCoord::new(300, 400, 10);
        let feature = Feature {
            id: 1,
            zoom_levels: (12, 14),
            meta: [("layer".to_owned(), "landuse".to_owned())].into(),
            geometry: polygon_in(index),
            ..Default::default()
        };
        let packs = packed(index, &[feature]);

        // Below min_z: nothing to draw.
        assert!(build_tile(&ctx(), index, &packs).unwrap().is_none());
        // Within range.
        let inside = TileCoord::new(index.x << 2, index.y << 2, 12);
        assert!(build_tile(&ctx(), inside, &packs).unwrap().is_some());
        // Beyond max_z.
        let beyond = TileCoord::new(index.x << 5, index.y << 5, 15);
        assert!(build_tile(&ctx(), beyond, &packs).unwrap().is_none());
    }

    #[test]
    fn test_feature_without_layer_skipped() {
        let index = TileCoord::new(300, 400, 10);
        let feature = Feature {
            id: 1,
            zoom_levels: (0, 20),
            meta: [("kind".to_owned(), "forest".to_owned())].into(),
            geometry: polygon_in(index),
            ..Default::default()
        };
        let packs = packed(index, &[feature]);
        assert!(build_tile(&ctx(), index, &packs).unwrap().is_none());
    }

    #[test]
    fn test_out_of_tile_geometry_dropped() {
        let index = TileCoord::new(300, 400, 10);
        let feature = Feature {
            id: 1,
            zoom_levels: (0, 20),
            meta: [("layer".to_owned(), "landuse".to_owned())].into(),
            geometry: polygon_in(index),
            ..Default::default()
        };
        let packs = packed(index, &[feature]);
        // A sibling tile at the same zoom shares no geometry with the pack's
        // polygon once clipped.
        let sibling = TileCoord::new(302, 400, 10);
        assert!(build_tile(&ctx(), sibling, &packs).unwrap().is_none());
    }
}
