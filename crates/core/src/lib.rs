//! Core library for the tilery vector tile engine.
//!
//! This library ingests geographic features (points, polylines, polygons with
//! string metadata), packs them into a quad-tree indexed feature store backed
//! by an ordered key/value store, pre-renders Mapbox Vector Tiles for a zoom
//! pyramid, and serves them by `(z, x, y)` lookup.
//!
//! # Pipeline
//!
//! 1. `import`: features are serialized and grouped under their index tile
//!    (zoom [`Z_INDEX_DEFAULT`]) in the `features` partition.
//! 2. `pack`: each per-tile group is rewritten as a single pack: features
//!    recoded against the shared-string table and indexed by a per-zoom
//!    quad-tree for spatial sub-queries.
//! 3. `prepare`: worker threads walk the tile pyramid breadth-first,
//!    rendering MVT bytes for every tile up to the requested zoom and storing
//!    them in the `tiles` partition.
//! 4. `serve`/`render_tile`: a prepared tile is a single key lookup; deeper
//!    tiles are rendered on demand from the packs.

use thiserror::Error;

pub mod clip;
pub mod feature;
pub mod fixed;
pub mod ingest;
pub mod mvt;
pub mod osm;
pub mod pack;
pub mod packer;
pub mod prepare;
pub mod quad_tree;
pub mod render;
pub mod shared_strings;
pub mod simplify;
pub mod stats;
pub mod store;
pub mod tile;
pub mod util;
pub mod vector_tile;

/// Internal zoom level at which all geometry coordinates are stored.
///
/// At this zoom the world spans `[0, 2^32)` fixed units per axis
/// (`2^20` tiles of 4096 pixels each).
pub const Z_INTERNAL: u8 = 20;

/// Zoom level at which features are keyed in the `features` partition.
pub const Z_INDEX_DEFAULT: u8 = 10;

/// Deepest zoom for best-tile descent and tile preparation.
pub const Z_MAX: u8 = 20;

/// Sentinel for an invalid/unbounded minimum zoom (6-bit svarint maximum).
/// Features carrying it are rejected by the packer.
pub const INVALID_ZOOM: u8 = 63;

/// Sentinel coordinate marking an absent bounding-box hint in the feature
/// header.
pub const INVALID_BOX_HINT: i64 = i64::MAX;

/// Errors that can occur across the storage and preparation pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed pack, tile key, or feature wire format. Carries the
    /// offending key so the corrupt record can be located.
    #[error("decode failed for key {key}: {reason}")]
    Decode { key: String, reason: String },

    /// Corrupted input discovered mid-operation; always fatal.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("protobuf decode error: {0}")]
    Proto(#[from] prost::DecodeError),

    #[error("OSM read error: {0}")]
    Osm(#[from] osmpbf::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Decode error for a store key.
    pub fn decode(key: &[u8], reason: impl Into<String>) -> Self {
        Error::Decode {
            key: hex(key),
            reason: reason.into(),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

pub type Result<T> = std::result::Result<T, Error>;
