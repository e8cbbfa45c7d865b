//! Feature pack format.
//!
//! A pack is the binary value stored under one feature-partition key:
//!
//! ```text
//! header: feature_count u32-le, index_offset u32-le (0 until patched)
//! body:   feature spans: varint-length-prefixed feature records,
//!         each span terminated by a zero length
//! index:  per-slot quad trees, then the packed varint array of their
//!         offsets (one per min-zoom slot, 0 for empty slots);
//!         index_offset points at the array
//! ```
//!
//! Raw pre-pack groups use the same header and a single span with
//! `index_offset == 0`. The indexed form buckets features by
//! `max(index_tile.z, min_z) - index_tile.z`, sorts each bucket by
//! `(quad_key, best_tile, bytes)` and records one span per equal-quad-key
//! run in that bucket's quad tree.

use sled::IVec;

use crate::feature::{deserialize_feature, serialize_feature, Feature};
use crate::fixed::bounding_box;
use crate::quad_tree::{make_quad_tree, walk_quad_tree, QuadTreeEntry};
use crate::shared_strings::MetaCoding;
use crate::store::Partition;
use crate::tile::{feature_key, feature_key_to_tile, quad_key, TileCoord, TileRange};
use crate::{Error, Result, INVALID_ZOOM, Z_INDEX_DEFAULT, Z_MAX};

/// Serialized features below this size indicate corrupted input.
pub const MIN_FEATURE_BYTES: usize = 32;

const HEADER_LEN: usize = 8;

/// Incremental pack writer; offsets are byte positions in the final value.
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new(feature_count: u32) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&feature_count.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        Self { buf }
    }

    /// Back-patch the header once the index has been appended.
    pub fn write_index_offset(&mut self, offset: u32) {
        self.buf[4..8].copy_from_slice(&offset.to_le_bytes());
    }

    /// Append one zero-terminated span of length-prefixed features.
    pub fn append_span(&mut self, features: &[impl AsRef<[u8]>]) -> Result<u32> {
        let offset = self.buf.len() as u32;
        for feature in features {
            let bytes = feature.as_ref();
            if bytes.len() < MIN_FEATURE_BYTES {
                return Err(Error::Invariant(format!(
                    "feature of {} bytes below the {MIN_FEATURE_BYTES}-byte minimum",
                    bytes.len()
                )));
            }
            prost::encoding::encode_varint(bytes.len() as u64, &mut self.buf);
            self.buf.extend_from_slice(bytes);
        }
        prost::encoding::encode_varint(0, &mut self.buf);
        Ok(offset)
    }

    /// Append a packed varint array.
    pub fn append_packed(&mut self, values: &[u32]) -> u32 {
        let offset = self.buf.len() as u32;
        for &value in values {
            prost::encoding::encode_varint(value as u64, &mut self.buf);
        }
        offset
    }

    pub fn append(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Pack a group of serialized features without an index (the pre-pack value
/// format written by the inserter).
pub fn pack_raw_features(features: &[impl AsRef<[u8]>]) -> Result<Vec<u8>> {
    let mut packer = Packer::new(features.len() as u32);
    packer.append_span(features)?;
    Ok(packer.into_bytes())
}

/// Iterate the features of a raw group.
pub fn unpack_raw_features(value: &[u8], f: &mut impl FnMut(&[u8])) -> Result<()> {
    let pack = Pack::parse(TileCoord::new(0, 0, 0), value)?;
    pack.span_foreach(HEADER_LEN as u32, f)
}

/// The best-fitting tile for a feature rooted at `root`: descend as long as
/// exactly one child's insert bounds overlap the feature's bounding box.
pub fn find_best_tile(root: TileCoord, feature: &Feature) -> Result<TileCoord> {
    let feature_box = bounding_box(&feature.geometry);

    let mut best = root;
    while best.z < Z_MAX {
        let mut next_best = None;
        for child in best.children() {
            if !child.insert_bounds().overlaps(&feature_box) {
                continue;
            }
            if next_best.is_some() {
                return Ok(best); // two matches -> take prev best
            }
            next_best = Some(child);
        }
        best = next_best.ok_or_else(|| {
            Error::Invariant("feature bounding box outside its index tile".into())
        })?;
    }
    Ok(best)
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct PackableFeature {
    quad_key: Vec<u8>,
    best_tile: TileCoord,
    bytes: Vec<u8>,
}

impl AsRef<[u8]> for PackableFeature {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Build the indexed pack for `tile` from its raw serialized features,
/// recoding them against the shared-string table.
pub fn pack_features(
    tile: TileCoord,
    coding: &MetaCoding,
    raw_features: &[Vec<u8>],
) -> Result<Vec<u8>> {
    let slots = (Z_MAX - tile.z) as usize + 1;
    let mut by_min_z: Vec<Vec<PackableFeature>> = (0..slots).map(|_| Vec::new()).collect();

    for bytes in raw_features {
        let feature = deserialize_feature(bytes, coding)?;
        if feature.min_z() == INVALID_ZOOM {
            return Err(Error::Invariant(format!(
                "feature {} carries the invalid min zoom sentinel",
                feature.id
            )));
        }
        if feature.min_z() > Z_MAX {
            return Err(Error::Invariant(format!(
                "feature {} min zoom {} beyond Z_MAX",
                feature.id,
                feature.min_z()
            )));
        }
        let recoded = serialize_feature(&feature, coding);
        let best_tile = find_best_tile(tile, &feature)?;
        let slot = (tile.z.max(feature.min_z()) - tile.z) as usize;
        by_min_z[slot].push(PackableFeature {
            quad_key: quad_key(tile, best_tile),
            best_tile,
            bytes: recoded,
        });
    }

    let mut packer = Packer::new(raw_features.len() as u32);

    let mut quad_trees = Vec::with_capacity(slots);
    for features in &mut by_min_z {
        if features.is_empty() {
            quad_trees.push(Vec::new());
            continue;
        }
        features.sort_unstable();

        let mut entries = Vec::new();
        let mut run_start = 0;
        for i in 1..=features.len() {
            if i < features.len() && features[i].quad_key == features[run_start].quad_key {
                continue;
            }
            let run = &features[run_start..i];
            entries.push(QuadTreeEntry {
                tile: run[0].best_tile,
                span_offset: packer.append_span(run)?,
            });
            run_start = i;
        }
        quad_trees.push(make_quad_tree(tile, &entries));
    }

    let offsets: Vec<u32> = quad_trees
        .iter()
        .map(|tree| {
            if tree.is_empty() {
                0
            } else {
                packer.append(tree)
            }
        })
        .collect();
    let index_offset = packer.append_packed(&offsets);
    packer.write_index_offset(index_offset);
    Ok(packer.into_bytes())
}

/// A parsed view over one pack value.
pub struct Pack<'a> {
    tile: TileCoord,
    bytes: &'a [u8],
}

impl<'a> Pack<'a> {
    pub fn parse(tile: TileCoord, bytes: &'a [u8]) -> Result<Pack<'a>> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Invariant("pack shorter than its header".into()));
        }
        let pack = Pack { tile, bytes };
        let index_offset = pack.index_offset() as usize;
        if index_offset != 0 && (index_offset < HEADER_LEN || index_offset >= bytes.len()) {
            return Err(Error::Invariant("pack index offset out of bounds".into()));
        }
        Ok(pack)
    }

    pub fn feature_count(&self) -> u32 {
        u32::from_le_bytes(self.bytes[0..4].try_into().unwrap())
    }

    pub fn index_offset(&self) -> u32 {
        u32::from_le_bytes(self.bytes[4..8].try_into().unwrap())
    }

    /// Whether this value carries a quad-tree index (raw groups do not).
    pub fn is_indexed(&self) -> bool {
        self.index_offset() != 0
    }

    /// Invoke `f` for every feature of the span starting at `offset`.
    pub fn span_foreach(&self, offset: u32, f: &mut impl FnMut(&[u8])) -> Result<()> {
        let mut slice = self
            .bytes
            .get(offset as usize..)
            .ok_or_else(|| Error::Invariant("span offset out of bounds".into()))?;
        loop {
            let len = prost::encoding::decode_varint(&mut slice)? as usize;
            if len == 0 {
                return Ok(());
            }
            if len > slice.len() {
                return Err(Error::Invariant("feature span exceeds pack".into()));
            }
            let (feature, rest) = slice.split_at(len);
            f(feature);
            slice = rest;
        }
    }

    /// Invoke `f` with the serialized bytes of every feature relevant to
    /// `request`: slots visible at the request zoom, quad-descended along the
    /// request's path below this pack's tile.
    pub fn records_foreach(&self, request: TileCoord, f: &mut impl FnMut(&[u8])) -> Result<()> {
        if !self.is_indexed() {
            return Err(Error::Invariant("pack carries no index".into()));
        }

        let covered = if request.z >= self.tile.z {
            request.ancestor_at(self.tile.z) == self.tile
        } else {
            self.tile.ancestor_at(request.z) == request
        };
        if !covered {
            return Ok(());
        }

        let slots = (Z_MAX - self.tile.z) as usize + 1;
        let index_offset = self.index_offset() as usize;
        let mut offsets_slice = &self.bytes[index_offset..];
        let mut offsets = Vec::with_capacity(slots);
        for _ in 0..slots {
            offsets.push(prost::encoding::decode_varint(&mut offsets_slice)? as u32);
        }

        // Slot 0 holds everything visible at the index zoom or below; deeper
        // slots only matter once the request zoom reaches them.
        let max_slot = (request.z.max(self.tile.z) - self.tile.z) as usize;

        let path = if request.z > self.tile.z {
            quad_key(self.tile, request)
        } else {
            Vec::new()
        };

        for &tree_offset in offsets.iter().take(max_slot + 1) {
            if tree_offset == 0 {
                continue;
            }
            let tree = self
                .bytes
                .get(tree_offset as usize..index_offset)
                .ok_or_else(|| Error::Invariant("quad tree offset out of bounds".into()))?;
            let mut walk_error = None;
            walk_quad_tree(tree, &path, &mut |span_offset| {
                if walk_error.is_none() {
                    if let Err(e) = self.span_foreach(span_offset, f) {
                        walk_error = Some(e);
                    }
                }
            })?;
            if let Some(e) = walk_error {
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Collect every indexed pack covering `request`: its index-tile ancestor
/// for deep requests, or one contiguous key-range scan over the request's
/// footprint at [`Z_INDEX_DEFAULT`] for shallow ones (the footprint is an
/// aligned power-of-two block, which Morton keys keep contiguous). Raw (not
/// yet packed) groups are skipped with a warning.
pub fn collect_packs(
    features: &Partition,
    request: TileCoord,
) -> Result<Vec<(TileCoord, IVec)>> {
    let mut packs = Vec::new();

    if request.z >= Z_INDEX_DEFAULT {
        let index_tile = request.ancestor_at(Z_INDEX_DEFAULT);
        if let Some(value) = features.get(&feature_key(index_tile))? {
            push_if_indexed(&mut packs, index_tile, value);
        }
        return Ok(packs);
    }

    let footprint =
        TileRange::new(request.x, request.y, request.x, request.y, request.z).on_z(Z_INDEX_DEFAULT);
    let begin = feature_key(TileCoord::new(footprint.minx, footprint.miny, Z_INDEX_DEFAULT));
    let end = block_end_key(footprint.maxx, footprint.maxy);
    for entry in features.range(&begin, &end) {
        let (key, value) = entry?;
        if key.len() != 8 {
            continue; // raw group suffix key
        }
        let tile = feature_key_to_tile(&key)?;
        push_if_indexed(&mut packs, tile, value);
    }
    Ok(packs)
}

fn push_if_indexed(packs: &mut Vec<(TileCoord, IVec)>, tile: TileCoord, value: IVec) {
    match Pack::parse(tile, &value) {
        Ok(pack) if pack.is_indexed() => packs.push((tile, value)),
        Ok(_) => log::warn!("unpacked feature group at {tile:?}; run pack first"),
        Err(e) => log::warn!("skipping corrupt pack at {tile:?}: {e}"),
    }
}

/// Exclusive upper key of a footprint scan: just past the block's last tile,
/// padded so 12-byte raw keys under that tile stay inside the range.
fn block_end_key(maxx: u32, maxy: u32) -> Vec<u8> {
    let mut key = feature_key(TileCoord::new(maxx, maxy, Z_INDEX_DEFAULT)).to_vec();
    key.extend_from_slice(&u32::MAX.to_be_bytes());
    key.push(0);
    key
}

/// Invoke `f(pack_tile, feature_bytes)` for every feature span relevant to
/// `request` across all covering packs.
pub fn pack_records_foreach(
    features: &Partition,
    request: TileCoord,
    f: &mut impl FnMut(TileCoord, &[u8]),
) -> Result<()> {
    for (tile, value) in collect_packs(features, request)? {
        let pack = Pack::parse(tile, &value)?;
        pack.records_foreach(request, &mut |bytes| f(tile, bytes))?;
    }
    Ok(())
}
