//! Store adapter over the embedded ordered key/value store.
//!
//! Wraps a [`sled`] database with the three partitions the pipeline needs
//! (`features`, `tiles`, `meta`) plus a seekable cursor and atomic batch
//! writes. The original engine sat on LMDB transactions; here a read pass is
//! an ordered tree iteration and a "write transaction" is one atomic
//! [`sled::Batch`] per partition, which preserves the property the pipeline
//! relies on: a batch of puts either lands completely or not at all.
//! [`Store::sync`] flushes durable state.

use std::ops::Bound;
use std::path::Path;

use sled::IVec;

use crate::Result;

/// Meta key holding the deepest prepared zoom as decimal ASCII.
pub const META_KEY_MAX_PREPARED_ZOOM: &str = "max_prepared_zoom";

/// Meta key holding the layer-name table.
pub const META_KEY_LAYER_NAMES: &str = "layer_names";

/// Handle to the opened database and its partitions.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    features: sled::Tree,
    tiles: sled::Tree,
    meta: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            features: db.open_tree("features")?,
            tiles: db.open_tree("tiles")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    pub fn features(&self) -> Partition {
        Partition {
            tree: self.features.clone(),
        }
    }

    pub fn tiles(&self) -> Partition {
        Partition {
            tree: self.tiles.clone(),
        }
    }

    pub fn meta(&self) -> Partition {
        Partition {
            tree: self.meta.clone(),
        }
    }

    /// Flush durable state to disk.
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn meta_get_raw(&self, key: &str) -> Result<Option<IVec>> {
        Ok(self.meta.get(key.as_bytes())?)
    }

    pub fn meta_put_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        self.meta.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn meta_get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .meta_get_raw(key)?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn meta_put_string(&self, key: &str, value: &str) -> Result<()> {
        self.meta_put_raw(key, value.as_bytes())
    }

    /// The deepest prepared zoom, when a prepare run has completed.
    pub fn max_prepared_zoom(&self) -> Result<Option<u8>> {
        Ok(self
            .meta_get_string(META_KEY_MAX_PREPARED_ZOOM)?
            .and_then(|s| s.parse().ok()))
    }
}

/// One named partition of the store.
#[derive(Clone)]
pub struct Partition {
    tree: sled::Tree,
}

impl Partition {
    pub fn get(&self, key: &[u8]) -> Result<Option<IVec>> {
        Ok(self.tree.get(key)?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    /// Apply a batch of writes atomically.
    pub fn apply_batch(&self, batch: sled::Batch) -> Result<()> {
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// Ordered iteration over `[from, to)`.
    pub fn range(&self, from: &[u8], to: &[u8]) -> impl Iterator<Item = Result<(IVec, IVec)>> {
        self.tree
            .range(from.to_vec()..to.to_vec())
            .map(|entry| entry.map_err(Into::into))
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(IVec, IVec)>> {
        self.tree.iter().map(|entry| entry.map_err(Into::into))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.tree.first()?.is_none())
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            tree: self.tree.clone(),
            current: None,
        }
    }
}

/// Cursor positioning modes.
pub enum Seek<'a> {
    First,
    Last,
    Exact(&'a [u8]),
    /// First entry with key `>=` the given key.
    Range(&'a [u8]),
}

/// A seekable cursor over one partition.
///
/// Positioning is re-resolved against the tree on every step, so deleting the
/// current entry (the packer does this as it reads) never invalidates the
/// cursor.
pub struct Cursor {
    tree: sled::Tree,
    current: Option<IVec>,
}

impl Cursor {
    pub fn seek(&mut self, seek: Seek<'_>) -> Result<Option<(IVec, IVec)>> {
        let entry = match seek {
            Seek::First => self.tree.first()?,
            Seek::Last => self.tree.last()?,
            Seek::Exact(key) => self.tree.get(key)?.map(|value| (IVec::from(key), value)),
            Seek::Range(key) => self
                .tree
                .range(key.to_vec()..)
                .next()
                .transpose()?,
        };
        self.current = entry.as_ref().map(|(key, _)| key.clone());
        Ok(entry)
    }

    /// Advance to the next entry in key order.
    pub fn next_entry(&mut self) -> Result<Option<(IVec, IVec)>> {
        let entry = match &self.current {
            None => self.tree.first()?,
            Some(current) => self
                .tree
                .range((Bound::Excluded(current.to_vec()), Bound::Unbounded))
                .next()
                .transpose()?,
        };
        // Stay positioned at the end once exhausted.
        if let Some((key, _)) = &entry {
            self.current = Some(key.clone());
        }
        Ok(entry)
    }

    /// Remove the entry the cursor is positioned on.
    pub fn del(&self) -> Result<()> {
        if let Some(current) = &self.current {
            self.tree.remove(current)?;
        }
        Ok(())
    }
}
