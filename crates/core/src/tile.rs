//! Tile coordinates, fixed-coordinate tile bounds, and store key encoding.
//!
//! # Key encoding
//!
//! Keys interleave the tile's `(x, y)` bits (Morton order, `y` in the high
//! bit of each pair) and store the result big-endian, so that
//!
//! - the four children of a tile occupy one contiguous key block directly
//!   under their parent's prefix, so an aligned tile footprint is scanned
//!   with a single key range,
//! - within one row (fixed `y`) keys are ordered by `x`.
//!
//! The `features` partition uses the [`Z_INDEX_DEFAULT`] variant (8 bytes,
//! no zoom); the `tiles` partition prefixes one zoom byte. Raw pre-pack
//! feature groups append a 4-byte big-endian sequence to the 8-byte key;
//! both forms decode to a tile at exactly `Z_INDEX_DEFAULT`.

use crate::fixed::{FixedBox, FixedCoord, WORLD_SIZE};
use crate::{Error, Result, Z_INDEX_DEFAULT, Z_INTERNAL};

/// Buffer around a tile's drawing bounds, in 4096-extent pixels.
pub const DRAW_BUFFER_PX: i64 = 8;

/// Buffer around a tile's insertion bounds, in 4096-extent pixels.
pub const INSERT_BUFFER_PX: i64 = 64;

/// A tile address: `0 <= x, y < 2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        debug_assert!(z == 32 || (x < (1 << z) && y < (1 << z)));
        Self { x, y, z }
    }

    pub fn parent(&self) -> TileCoord {
        debug_assert!(self.z > 0);
        TileCoord::new(self.x >> 1, self.y >> 1, self.z - 1)
    }

    /// The four direct children, in quad-position order.
    pub fn children(&self) -> [TileCoord; 4] {
        let (x, y, z) = (self.x << 1, self.y << 1, self.z + 1);
        [
            TileCoord::new(x, y, z),
            TileCoord::new(x + 1, y, z),
            TileCoord::new(x, y + 1, z),
            TileCoord::new(x + 1, y + 1, z),
        ]
    }

    /// Position within the parent: `(y & 1) << 1 | (x & 1)`
    /// (NW=0, NE=1, SW=2, SE=3).
    pub fn quad_pos(&self) -> u8 {
        (((self.y & 1) << 1) | (self.x & 1)) as u8
    }

    /// The ancestor of this tile at zoom `z <= self.z`.
    pub fn ancestor_at(&self, z: u8) -> TileCoord {
        debug_assert!(z <= self.z);
        let delta = (self.z - z) as u32;
        TileCoord::new(self.x >> delta, self.y >> delta, z)
    }

    pub fn is_ancestor_of(&self, other: &TileCoord) -> bool {
        self.z <= other.z && other.ancestor_at(self.z) == *self
    }

    /// Width of this tile in fixed units.
    pub fn span(&self) -> FixedCoord {
        WORLD_SIZE >> self.z
    }

    /// One 4096-extent pixel of this tile in fixed units (at least 1).
    pub fn pixel(&self) -> FixedCoord {
        1i64 << Z_INTERNAL.saturating_sub(self.z) as u32
    }

    /// Exact tile bounds in fixed coordinates, inclusive.
    pub fn bounds(&self) -> FixedBox {
        let span = self.span();
        FixedBox::new(
            self.x as i64 * span,
            self.y as i64 * span,
            (self.x as i64 + 1) * span - 1,
            (self.y as i64 + 1) * span - 1,
        )
    }

    /// Bounds used when clipping for rendering: tile plus an 8 px margin so
    /// adjacent tiles share seam geometry.
    pub fn draw_bounds(&self) -> FixedBox {
        self.bounds().grown(DRAW_BUFFER_PX * self.pixel())
    }

    /// Bounds used when deciding which tiles a feature is stored under.
    pub fn insert_bounds(&self) -> FixedBox {
        self.bounds().grown(INSERT_BUFFER_PX * self.pixel())
    }
}

/// Quad key: the quad positions along the path from `root`'s first
/// descendant down to `tile`; empty when `tile == root`.
pub fn quad_key(root: TileCoord, tile: TileCoord) -> Vec<u8> {
    debug_assert!(root.is_ancestor_of(&tile));
    let mut key = vec![0u8; (tile.z - root.z) as usize];
    let mut current = tile;
    for slot in key.iter_mut().rev() {
        *slot = current.quad_pos();
        current = current.parent();
    }
    key
}

// Bit spreading for 2D Morton interleave.
fn spread(v: u32) -> u64 {
    let mut v = v as u64;
    v = (v | (v << 16)) & 0x0000_ffff_0000_ffff;
    v = (v | (v << 8)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v << 2)) & 0x3333_3333_3333_3333;
    v = (v | (v << 1)) & 0x5555_5555_5555_5555;
    v
}

fn compact(v: u64) -> u32 {
    let mut v = v & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v >> 4)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v >> 8)) & 0x0000_ffff_0000_ffff;
    v = (v | (v >> 16)) & 0x0000_0000_ffff_ffff;
    v as u32
}

fn morton(x: u32, y: u32) -> u64 {
    (spread(y) << 1) | spread(x)
}

fn unmorton(m: u64) -> (u32, u32) {
    (compact(m), compact(m >> 1))
}

/// Full-zoom tile key for the `tiles` partition: zoom byte + Morton code.
pub fn tile_key(tile: TileCoord) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = tile.z;
    key[1..].copy_from_slice(&morton(tile.x, tile.y).to_be_bytes());
    key
}

/// Inverse of [`tile_key`].
pub fn tile_of_key(key: &[u8]) -> Result<TileCoord> {
    if key.len() != 9 {
        return Err(Error::decode(key, "tile key must be 9 bytes"));
    }
    let z = key[0];
    let m = u64::from_be_bytes(key[1..9].try_into().unwrap());
    let (x, y) = unmorton(m);
    if z > 32 || (z < 32 && (x >= (1 << z) || y >= (1 << z))) {
        return Err(Error::decode(key, "tile coordinates exceed zoom"));
    }
    Ok(TileCoord::new(x, y, z))
}

/// Feature-partition key of a tile's group at [`Z_INDEX_DEFAULT`].
pub fn feature_key(tile: TileCoord) -> [u8; 8] {
    debug_assert_eq!(tile.z, Z_INDEX_DEFAULT);
    morton(tile.x, tile.y).to_be_bytes()
}

/// Decode a feature-partition key (packed 8-byte or raw 12-byte form) back
/// to its index tile.
pub fn feature_key_to_tile(key: &[u8]) -> Result<TileCoord> {
    if key.len() != 8 && key.len() != 12 {
        return Err(Error::decode(key, "feature key must be 8 or 12 bytes"));
    }
    let m = u64::from_be_bytes(key[..8].try_into().unwrap());
    let (x, y) = unmorton(m);
    if x >= (1 << Z_INDEX_DEFAULT) || y >= (1 << Z_INDEX_DEFAULT) {
        return Err(Error::decode(key, "index tile out of range"));
    }
    Ok(TileCoord::new(x, y, Z_INDEX_DEFAULT))
}

/// Raw-group key: index-tile key plus a big-endian write sequence.
pub fn raw_feature_key(tile: TileCoord, seq: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&feature_key(tile));
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// An inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub minx: u32,
    pub miny: u32,
    pub maxx: u32,
    pub maxy: u32,
    pub z: u8,
}

impl TileRange {
    pub fn new(minx: u32, miny: u32, maxx: u32, maxy: u32, z: u8) -> Self {
        Self { minx, miny, maxx, maxy, z }
    }

    /// Project this range onto another zoom level (covering the same area).
    pub fn on_z(&self, z: u8) -> TileRange {
        if z >= self.z {
            let delta = (z - self.z) as u32;
            TileRange::new(
                self.minx << delta,
                self.miny << delta,
                ((self.maxx + 1) << delta) - 1,
                ((self.maxy + 1) << delta) - 1,
                z,
            )
        } else {
            let delta = (self.z - z) as u32;
            TileRange::new(
                self.minx >> delta,
                self.miny >> delta,
                self.maxx >> delta,
                self.maxy >> delta,
                z,
            )
        }
    }

    pub fn len(&self) -> u64 {
        (self.maxx - self.minx + 1) as u64 * (self.maxy - self.miny + 1) as u64
    }

    /// Row-major iteration over the contained tiles.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let range = *self;
        (range.miny..=range.maxy).flat_map(move |y| {
            (range.minx..=range.maxx).map(move |x| TileCoord::new(x, y, range.z))
        })
    }
}
