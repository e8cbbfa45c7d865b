//! Database statistics for the `stats` CLI command.

use std::io::Write;

use crate::store::{Partition, Store};
use crate::tile::tile_of_key;
use crate::util::{fmt_bytes, fmt_num};
use crate::{Error, Result};

fn print_sizes(out: &mut impl Write, label: &str, sizes: &mut Vec<usize>) -> Result<()> {
    let sum: usize = sizes.iter().sum();
    sizes.sort_unstable();

    write!(
        out,
        "{label:<14} > cnt: {:>7} sum: {:>9} ",
        fmt_num(sizes.len() as f64),
        fmt_bytes(sum as f64)
    )?;
    if sizes.is_empty() {
        writeln!(out)?;
        return Ok(());
    }
    writeln!(
        out,
        "mean: {:>9} q95: {:>9} max: {:>9}",
        fmt_bytes(sum as f64 / sizes.len() as f64),
        fmt_bytes(sizes[(sizes.len() - 1) * 95 / 100] as f64),
        fmt_bytes(*sizes.last().unwrap() as f64)
    )?;
    Ok(())
}

fn value_sizes(partition: &Partition) -> Result<Vec<usize>> {
    partition
        .iter()
        .map(|entry| entry.map(|(_, value)| value.len()))
        .collect()
}

/// Print per-partition payload statistics and the per-zoom tile size
/// distribution. Finding a tile beyond `max_prepared_zoom` is fatal.
pub fn database_stats(store: &Store, out: &mut impl Write) -> Result<()> {
    writeln!(out, ">> payload stats:")?;
    let mut feature_sizes = value_sizes(&store.features())?;
    print_sizes(out, "features", &mut feature_sizes)?;
    let mut total: usize = feature_sizes.iter().sum();

    let Some(max_prepared) = store.max_prepared_zoom()? else {
        writeln!(out, "no tiles prepared!")?;
        return Ok(());
    };

    let mut tile_sizes: Vec<Vec<usize>> = vec![Vec::new(); max_prepared as usize + 1];
    for entry in store.tiles().iter() {
        let (key, value) = entry?;
        let tile = tile_of_key(&key)?;
        if tile.z > max_prepared {
            return Err(Error::Invariant(format!(
                "tile {tile:?} outside the prepared range (max {max_prepared})"
            )));
        }
        tile_sizes[tile.z as usize].push(value.len());
    }

    for (z, sizes) in tile_sizes.iter_mut().enumerate() {
        total += sizes.iter().sum::<usize>();
        print_sizes(out, &format!("tiles[z={z:0>2}]"), sizes)?;
    }

    writeln!(out, "====")?;
    writeln!(out, "total: {}", fmt_bytes(total as f64))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::META_KEY_MAX_PREPARED_ZOOM;
    use crate::tile::{tile_key, TileCoord};

    #[test]
    fn test_stats_without_prepared_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut out = Vec::new();
        database_stats(&store, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("no tiles prepared!"));
    }

    #[test]
    fn test_stats_reports_per_zoom_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .meta_put_string(META_KEY_MAX_PREPARED_ZOOM, "2")
            .unwrap();
        store
            .tiles()
            .put(&tile_key(TileCoord::new(0, 0, 0)), &[0u8; 100])
            .unwrap();
        store
            .tiles()
            .put(&tile_key(TileCoord::new(1, 1, 2)), &[0u8; 50])
            .unwrap();

        let mut out = Vec::new();
        database_stats(&store, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("tiles[z=00]"));
        assert!(text.contains("tiles[z=02]"));
    }

    #[test]
    fn test_tile_beyond_prepared_range_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store
            .meta_put_string(META_KEY_MAX_PREPARED_ZOOM, "1")
            .unwrap();
        store
            .tiles()
            .put(&tile_key(TileCoord::new(0, 0, 4)), &[0u8; 10])
            .unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            database_stats(&store, &mut out),
            Err(Error::Invariant(_))
        ));
    }
}
