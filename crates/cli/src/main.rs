//! CLI for tilery - import, pack, prepare and serve vector tiles.
//!
//! This is a thin wrapper around the tilery-core library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tilery_core::osm::{import_osm, DefaultProfile};
use tilery_core::packer::pack_database;
use tilery_core::prepare::prepare_tiles;
use tilery_core::stats::database_stats;
use tilery_core::store::Store;

mod server;

#[derive(Parser, Debug)]
#[command(
    name = "tilery",
    about = "Vector tile storage and preparation engine",
    version
)]
struct Args {
    /// Tile database directory
    #[arg(long, default_value = "tiles.db")]
    db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import an OSM PBF extract into the feature store
    Import {
        /// Input .osm.pbf file
        #[arg(value_name = "OSM_PBF")]
        input: PathBuf,
    },
    /// Rewrite raw feature groups into quad-tree indexed packs
    Pack,
    /// Pre-render MVT tiles for the pyramid
    Prepare {
        /// Deepest zoom level to materialize
        #[arg(long, default_value = "14")]
        max_zoom: u8,
    },
    /// Serve tiles over HTTP
    Serve {
        #[arg(long, short, default_value = "8888")]
        port: u16,
    },
    /// Print database statistics
    Stats,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let store = Store::open(&args.db)
        .with_context(|| format!("Failed to open tile database at {}", args.db.display()))?;

    match args.command {
        Command::Import { input } => {
            let inserted = import_osm(&store, &input, &DefaultProfile)
                .with_context(|| format!("Failed to import {}", input.display()))?;
            println!("imported {inserted} features");
        }
        Command::Pack => {
            pack_database(&store).context("Failed to pack features")?;
        }
        Command::Prepare { max_zoom } => {
            prepare_tiles(&store, max_zoom).context("Failed to prepare tiles")?;
            println!("prepared tiles up to zoom {max_zoom}");
        }
        Command::Serve { port } => {
            server::serve(store, port).context("Tile server failed")?;
        }
        Command::Stats => {
            database_stats(&store, &mut std::io::stdout().lock())
                .context("Failed to collect stats")?;
        }
    }

    Ok(())
}
