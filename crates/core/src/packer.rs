//! Feature packer: rewrites raw per-tile feature groups into indexed packs.
//!
//! The batch loop bounds peak memory and write amplification: it reads the
//! `features` partition in key order, grouping consecutive raw entries that
//! decode to the same index tile, deletes them as it reads, and buffers the
//! built packs. When the buffered pack bytes reach [`PACK_BATCH_THRESHOLD`]
//! at a tile boundary, the loop remembers a resume key, syncs, writes the
//! buffered packs in one atomic batch, and starts over from the resume key.

use crate::pack::{pack_features, unpack_raw_features};
use crate::shared_strings::{
    build_coding, load_meta_coding, save_meta_coding, MetaCoding,
};
use crate::store::{Seek, Store};
use crate::tile::{feature_key, feature_key_to_tile, TileCoord};
use crate::{Error, Result};

/// Pause the collection phase once this many pack bytes are buffered.
pub const PACK_BATCH_THRESHOLD: usize = 64 * 1024 * 1024;

/// Scan the raw feature groups and extend the persisted shared-string table
/// with every frequent metadata string.
pub fn build_shared_strings(store: &Store) -> Result<MetaCoding> {
    let existing = load_meta_coding(store)?;

    let mut corpus: Vec<String> = Vec::new();
    for entry in store.features().iter() {
        let (key, value) = entry?;
        if key.len() != 12 {
            continue; // already packed
        }
        let mut raw = Vec::new();
        unpack_raw_features(&value, &mut |bytes| raw.push(bytes.to_vec()))
            .map_err(|e| Error::decode(&key, e.to_string()))?;
        for bytes in raw {
            let feature = crate::feature::deserialize_feature(&bytes, &existing)
                .map_err(|e| Error::decode(&key, e.to_string()))?;
            for (k, v) in &feature.meta {
                corpus.push(k.clone());
                corpus.push(v.clone());
            }
        }
    }

    let coding = build_coding(&existing, corpus);
    save_meta_coding(store, &coding)?;
    log::info!("shared-string table holds {} strings", coding.len());
    Ok(coding)
}

/// Pack every raw feature group in the store.
pub fn pack_database(store: &Store) -> Result<()> {
    let coding = build_shared_strings(store)?;
    let features = store.features();

    let mut total_groups = 0usize;
    let mut resume_key: Option<Vec<u8>> = None;
    loop {
        let mut packed: Vec<([u8; 8], Vec<u8>)> = Vec::new();
        let mut packed_size = 0usize;

        {
            // Collection phase: group consecutive raw entries per tile.
            let mut cursor = features.cursor();
            let mut entry = match resume_key.take() {
                Some(key) => cursor.seek(Seek::Range(&key))?,
                None => cursor.seek(Seek::First)?,
            };

            let mut tile: Option<TileCoord> = None;
            let mut group: Vec<Vec<u8>> = Vec::new();

            while let Some((key, value)) = entry {
                if key.len() != 12 {
                    entry = cursor.next_entry()?;
                    continue; // already a pack
                }
                let this_tile = feature_key_to_tile(&key)?;

                if tile != Some(this_tile) && packed_size >= PACK_BATCH_THRESHOLD {
                    resume_key = Some(key.to_vec());
                    break;
                }

                let mut these = Vec::new();
                unpack_raw_features(&value, &mut |bytes| these.push(bytes.to_vec()))
                    .map_err(|e| Error::decode(&key, e.to_string()))?;
                cursor.del()?;

                if tile != Some(this_tile) {
                    if let Some(done) = tile.filter(|_| !group.is_empty()) {
                        let bytes = pack_features(done, &coding, &group)?;
                        packed_size += bytes.len();
                        packed.push((feature_key(done), bytes));
                    }
                    tile = Some(this_tile);
                    group = these;
                } else {
                    group.extend(these);
                }

                entry = cursor.next_entry()?;
            }

            if let Some(done) = tile.filter(|_| !group.is_empty()) {
                packed.push((feature_key(done), pack_features(done, &coding, &group)?));
            }
        }

        store.sync()?;

        // Writeback phase: one atomic batch per collection pass.
        let mut batch = sled::Batch::default();
        for (key, value) in &packed {
            batch.insert(key.as_slice(), value.as_slice());
        }
        total_groups += packed.len();
        features.apply_batch(batch)?;
        log::debug!("packed {} tile groups this pass", packed.len());

        if resume_key.is_none() {
            break;
        }
    }

    store.sync()?;
    log::info!("packed {total_groups} tile groups");
    Ok(())
}
