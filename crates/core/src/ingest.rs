//! Feature insertion and the layer-name registry.
//!
//! The inserter buffers serialized features grouped by index tile and
//! flushes them as raw (unindexed) packs under sequence-suffixed keys. A
//! feature is stored once per index tile its bounding box overlaps, clipped
//! to that tile's insert bounds, so every pack is self-contained: deep tiles
//! near index-tile borders see their share of the geometry and the draw-time
//! clip removes the overlap again.

use std::collections::{BTreeMap, HashMap};

use crate::clip::clip;
use crate::feature::{serialize_feature, Feature};
use crate::fixed::bounding_box;
use crate::pack::pack_raw_features;
use crate::shared_strings::{decode_string_table, encode_string_table, MetaCoding};
use crate::store::{Store, META_KEY_LAYER_NAMES};
use crate::tile::{raw_feature_key, TileCoord, INSERT_BUFFER_PX};
use crate::{Error, Result, INVALID_ZOOM, Z_INDEX_DEFAULT};

/// Flush the insert buffer once it holds this many feature bytes.
pub const INSERT_FLUSH_THRESHOLD: usize = 32 * 1024 * 1024;

/// First-seen registry of layer names, persisted to `meta` in index order.
#[derive(Debug, Default)]
pub struct LayerNamesBuilder {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl LayerNamesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted table so re-imports keep existing indices.
    pub fn load(store: &Store) -> Result<Self> {
        let names = match store.meta_get_raw(META_KEY_LAYER_NAMES)? {
            Some(bytes) => decode_string_table(&bytes)?,
            None => Vec::new(),
        };
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Ok(Self { names, index })
    }

    pub fn layer_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len();
        self.names.push(name.to_owned());
        self.index.insert(name.to_owned(), idx);
        idx
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn save(&self, store: &Store) -> Result<()> {
        store.meta_put_raw(META_KEY_LAYER_NAMES, &encode_string_table(&self.names))
    }
}

/// Buffered writer into the `features` partition.
pub struct FeatureInserter {
    store: Store,
    buffer: BTreeMap<TileCoord, Vec<Vec<u8>>>,
    buffered_bytes: usize,
    seq: u32,
    inserted: u64,
}

impl FeatureInserter {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
            buffer: BTreeMap::new(),
            buffered_bytes: 0,
            seq: 0,
            inserted: 0,
        }
    }

    /// Number of features accepted so far.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Store one feature under every index tile its bounding box overlaps.
    pub fn insert(&mut self, feature: Feature) -> Result<()> {
        if feature.geometry.is_null() {
            return Ok(());
        }
        if feature.min_z() == INVALID_ZOOM {
            return Err(Error::Invariant(format!(
                "feature {} inserted without a zoom range",
                feature.id
            )));
        }

        let bbox = bounding_box(&feature.geometry);
        let margin = INSERT_BUFFER_PX * TileCoord::new(0, 0, Z_INDEX_DEFAULT).pixel();
        let span = TileCoord::new(0, 0, Z_INDEX_DEFAULT).span();
        let max_tile = (1u32 << Z_INDEX_DEFAULT) - 1;
        let tile_of = |v: i64| ((v / span).clamp(0, max_tile as i64)) as u32;

        let (minx, maxx) = (tile_of(bbox.min.x - margin), tile_of(bbox.max.x + margin));
        let (miny, maxy) = (tile_of(bbox.min.y - margin), tile_of(bbox.max.y + margin));

        let coding = MetaCoding::empty();
        let mut stored = false;
        for y in miny..=maxy {
            for x in minx..=maxx {
                let tile = TileCoord::new(x, y, Z_INDEX_DEFAULT);
                let clipped = clip(&feature.geometry, &tile.insert_bounds());
                if clipped.is_null() {
                    continue;
                }
                let bytes = serialize_feature(
                    &Feature {
                        geometry: clipped,
                        ..feature.clone()
                    },
                    &coding,
                );
                self.buffered_bytes += bytes.len();
                self.buffer.entry(tile).or_default().push(bytes);
                stored = true;
            }
        }
        if stored {
            self.inserted += 1;
        }

        if self.buffered_bytes >= INSERT_FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Write all buffered groups as raw packs.
    pub fn flush(&mut self) -> Result<()> {
        let features = self.store.features();
        for (tile, group) in std::mem::take(&mut self.buffer) {
            features.put(&raw_feature_key(tile, self.seq), &pack_raw_features(&group)?)?;
        }
        self.seq += 1;
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Flush remaining groups and make them durable.
    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        self.store.sync()?;
        Ok(self.inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{FixedGeometry, FixedPoint, FixedPolyline};
    use crate::pack::unpack_raw_features;
    use crate::tile::feature_key_to_tile;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn line_feature(id: u64, from: (i64, i64), to: (i64, i64)) -> Feature {
        Feature {
            id,
            zoom_levels: (0, 20),
            meta: [("layer".to_owned(), "road".to_owned())].into(),
            geometry: FixedGeometry::Polyline(FixedPolyline {
                lines: vec![vec![
                    FixedPoint::new(from.0, from.1),
                    FixedPoint::new(to.0, to.1),
                ]],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_layer_names_first_seen_order() {
        let (_dir, store) = open_store();
        let mut builder = LayerNamesBuilder::new();
        assert_eq!(builder.layer_index("water"), 0);
        assert_eq!(builder.layer_index("road"), 1);
        assert_eq!(builder.layer_index("water"), 0);
        builder.save(&store).unwrap();

        let mut reloaded = LayerNamesBuilder::load(&store).unwrap();
        assert_eq!(reloaded.names(), &["water", "road"]);
        assert_eq!(reloaded.layer_index("road"), 1);
        assert_eq!(reloaded.layer_index("rail"), 2);
    }

    #[test]
    fn test_insert_small_feature_lands_in_one_tile() {
        let (_dir, store) = open_store();
        let mut inserter = FeatureInserter::new(&store);

        let tile = TileCoord::new(400, 300, Z_INDEX_DEFAULT);
        let b = tile.bounds();
        let third = tile.span() / 3;
        inserter
            .insert(line_feature(
                1,
                (b.min.x + third, b.min.y + third),
                (b.min.x + third + 4096, b.min.y + third + 4096),
            ))
            .unwrap();
        assert_eq!(inserter.finish().unwrap(), 1);

        let entries: Vec<_> = store
            .features()
            .iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(feature_key_to_tile(&entries[0].0).unwrap(), tile);

        let mut n = 0;
        unpack_raw_features(&entries[0].1, &mut |_| n += 1).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_border_feature_duplicated_and_clipped() {
        let (_dir, store) = open_store();
        let mut inserter = FeatureInserter::new(&store);

        // A line crossing the vertical border between two index tiles.
        let left = TileCoord::new(400, 300, Z_INDEX_DEFAULT);
        let border_x = left.bounds().max.x + 1;
        let cy = (left.bounds().min.y + left.bounds().max.y) / 2;
        inserter
            .insert(line_feature(1, (border_x - 500_000, cy), (border_x + 500_000, cy)))
            .unwrap();
        inserter.finish().unwrap();

        let tiles: Vec<_> = store
            .features()
            .iter()
            .map(|e| feature_key_to_tile(&e.unwrap().0).unwrap())
            .collect();
        assert_eq!(tiles.len(), 2);
        assert!(tiles.contains(&left));
        assert!(tiles.contains(&TileCoord::new(401, 300, Z_INDEX_DEFAULT)));

        // Each copy is clipped into its own tile's insert bounds.
        let coding = MetaCoding::empty();
        for entry in store.features().iter() {
            let (key, value) = entry.unwrap();
            let tile = feature_key_to_tile(&key).unwrap();
            unpack_raw_features(&value, &mut |bytes| {
                let f = crate::feature::deserialize_feature(bytes, &coding).unwrap();
                let bbox = bounding_box(&f.geometry);
                assert!(tile.insert_bounds().contains(bbox.min));
                assert!(tile.insert_bounds().contains(bbox.max));
            })
            .unwrap();
        }
    }

    #[test]
    fn test_null_geometry_ignored() {
        let (_dir, store) = open_store();
        let mut inserter = FeatureInserter::new(&store);
        inserter
            .insert(Feature {
                id: 1,
                zoom_levels: (0, 20),
                geometry: FixedGeometry::Null,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(inserter.finish().unwrap(), 0);
        assert!(store.features().is_empty().unwrap());
    }

    #[test]
    fn test_unclassified_zoom_rejected() {
        let (_dir, store) = open_store();
        let mut inserter = FeatureInserter::new(&store);
        let result = inserter.insert(Feature {
            id: 1,
            zoom_levels: (INVALID_ZOOM, INVALID_ZOOM),
            geometry: FixedGeometry::Point(FixedPoint::new(1 << 30, 1 << 30)),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Invariant(_))));
    }
}
