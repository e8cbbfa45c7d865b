//! Parallel tile preparation.
//!
//! A mutex-guarded manager hands out batches of tiles, walking the pyramid
//! breadth-first over the feature store's footprint. One worker thread per
//! hardware core runs read → render → write per batch; only `get_batch` and
//! `finish` take the manager lock, rendering runs without it. Tile
//! materialization is idempotent, so no ordering is enforced across batches.

use std::sync::Mutex;
use std::time::Instant;

use sled::IVec;

use crate::pack::collect_packs;
use crate::render::{build_tile, make_render_ctx, RenderCtx};
use crate::store::{Store, META_KEY_MAX_PREPARED_ZOOM};
use crate::tile::{feature_key_to_tile, tile_key, TileCoord, TileRange};
use crate::util::{fmt_bytes, fmt_duration_ns, fmt_num};
use crate::{Error, Result, Z_INDEX_DEFAULT, Z_MAX};

struct PrepareTask {
    tile: TileCoord,
    packs: Vec<(TileCoord, IVec)>,
    result: Option<Vec<u8>>,
}

#[derive(Default, Clone)]
struct PrepareStats {
    n_total: u64,
    n_finished: u64,
    /// Tiles that rendered to zero bytes (no surviving layer).
    n_empty: u64,
    sum_size: u64,
    sum_dur: u64,
}

/// Batch scheduler over the tile pyramid.
pub struct PrepareManager {
    max_zoom: u8,
    curr_zoom: u8,
    base_range: Option<TileRange>,
    curr_range: Option<TileRange>,
    next_index: u64,
    stats: Vec<PrepareStats>,
}

impl PrepareManager {
    /// `base_range` is the feature footprint at [`Z_INDEX_DEFAULT`]; `None`
    /// when the store holds no features.
    pub fn new(base_range: Option<TileRange>, max_zoom: u8) -> Self {
        Self {
            max_zoom,
            curr_zoom: 0,
            base_range,
            curr_range: base_range.map(|r| r.on_z(0)),
            next_index: 0,
            stats: vec![PrepareStats::default(); max_zoom as usize + 1],
        }
    }

    /// Hand out 1..=256 tiles; fewer per batch on the cheap low zoom levels
    /// so workers start in parallel right away.
    pub fn get_batch(&mut self) -> Vec<TileCoord> {
        let mut batch = Vec::new();
        let mut i = 0u32;
        while i < 1 << 8 {
            i += 1 << 8u32.saturating_sub(self.curr_zoom as u32).min(8);
            if self.curr_zoom > self.max_zoom {
                break;
            }
            let Some(range) = self.curr_range else {
                break;
            };

            if self.next_index < range.len() {
                let width = (range.maxx - range.minx + 1) as u64;
                let tile = TileCoord::new(
                    range.minx + (self.next_index % width) as u32,
                    range.miny + (self.next_index / width) as u32,
                    self.curr_zoom,
                );
                self.next_index += 1;
                self.stats[self.curr_zoom as usize].n_total += 1;
                batch.push(tile);
            }

            if self.next_index >= range.len() {
                self.curr_zoom += 1;
                self.next_index = 0;
                if self.curr_zoom <= self.max_zoom {
                    self.curr_range = self.base_range.map(|r| r.on_z(self.curr_zoom));
                }
            }
        }
        batch
    }

    /// Record one finished tile; logs a summary once a level completes.
    pub fn finish(&mut self, tile: TileCoord, size: u64, dur_ns: u64) {
        let stats = &mut self.stats[tile.z as usize];
        stats.sum_size += size;
        stats.sum_dur += dur_ns;
        stats.n_finished += 1;
        if size == 0 {
            stats.n_empty += 1;
        }

        if tile.z == self.curr_zoom || stats.n_finished < stats.n_total {
            return;
        }
        let avg = if stats.n_total == stats.n_empty {
            0.0
        } else {
            stats.sum_size as f64 / (stats.n_total - stats.n_empty) as f64
        };
        log::info!(
            "tiles lvl {:>2} | {} | {} total (avg {} excl. {} empty)",
            tile.z,
            fmt_duration_ns(stats.sum_dur),
            fmt_num(stats.n_total as f64),
            fmt_bytes(avg),
            fmt_num(stats.n_empty as f64),
        );
    }
}

/// Scan the feature partition for its index-tile bounding box and build the
/// manager over it.
pub fn make_prepare_manager(store: &Store, max_zoom: u8) -> Result<PrepareManager> {
    let mut range: Option<TileRange> = None;
    for entry in store.features().iter() {
        let (key, _) = entry?;
        let tile = feature_key_to_tile(&key)?;
        range = Some(match range {
            None => TileRange::new(tile.x, tile.y, tile.x, tile.y, Z_INDEX_DEFAULT),
            Some(r) => TileRange::new(
                r.minx.min(tile.x),
                r.miny.min(tile.y),
                r.maxx.max(tile.x),
                r.maxy.max(tile.y),
                Z_INDEX_DEFAULT,
            ),
        });
    }
    Ok(PrepareManager::new(range, max_zoom))
}

/// Render and store every tile of the pyramid up to `max_zoom`, then record
/// `max_prepared_zoom` in `meta`.
pub fn prepare_tiles(store: &Store, max_zoom: u8) -> Result<()> {
    if max_zoom > Z_MAX {
        return Err(Error::Invariant(format!(
            "max zoom {max_zoom} beyond the supported {Z_MAX}"
        )));
    }

    let manager = Mutex::new(make_prepare_manager(store, max_zoom)?);
    let ctx = make_render_ctx(store)?;

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    std::thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..workers)
            .map(|_| scope.spawn(|| worker_loop(store, &ctx, &manager)))
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::Invariant("prepare worker panicked".into()))??;
        }
        Ok(())
    })?;

    store.meta_put_string(META_KEY_MAX_PREPARED_ZOOM, &max_zoom.to_string())?;
    store.sync()?;
    Ok(())
}

fn worker_loop(store: &Store, ctx: &RenderCtx, manager: &Mutex<PrepareManager>) -> Result<()> {
    let features = store.features();
    let tiles = store.tiles();

    loop {
        let batch = manager.lock().unwrap().get_batch();
        if batch.is_empty() {
            return Ok(());
        }

        let mut tasks: Vec<PrepareTask> = batch
            .into_iter()
            .map(|tile| PrepareTask {
                tile,
                packs: Vec::new(),
                result: None,
            })
            .collect();

        // Read pass: one snapshot of covering packs per batch.
        for task in &mut tasks {
            task.packs = collect_packs(&features, task.tile)?;
        }

        // Render pass, outside the manager lock.
        for task in &mut tasks {
            let start = Instant::now();
            match build_tile(ctx, task.tile, &task.packs) {
                Ok(result) => task.result = result,
                // A corrupt pack fails only this tile, not the run.
                Err(e) => log::warn!("tile {:?} failed to build: {e}", task.tile),
            }
            let size = task.result.as_ref().map_or(0, Vec::len) as u64;
            manager
                .lock()
                .unwrap()
                .finish(task.tile, size, start.elapsed().as_nanos() as u64);
        }

        // Write pass: one atomic batch of rendered tiles.
        let mut write = sled::Batch::default();
        let mut any = false;
        for task in &tasks {
            if let Some(result) = &task.result {
                write.insert(tile_key(task.tile).as_slice(), result.as_slice());
                any = true;
            }
        }
        if any {
            tiles.apply_batch(write)?;
        }
    }
}
