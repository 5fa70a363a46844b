use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use common::uri;
use library::{LibraryRecord, Scanner, TrackDb};
use metadata::LoftyTagReader;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Scans music directories into a track database without starting the
/// engine.
#[derive(Parser, Debug)]
#[command(name = "import_scan")]
struct Args {
    /// Directories to scan; registered as libraries in the database.
    #[arg(required = true, env = "MUSIC_ROOT")]
    roots: Vec<PathBuf>,

    /// Track database file.
    #[arg(long, env = "TONEARM_DB", default_value = "data/tonearm.redb")]
    db: PathBuf,

    /// Re-read every file and remove missing ones even if enumeration fails.
    #[arg(long)]
    force: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Some(parent) = args.db.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut db = TrackDb::open(&args.db)?;
    let mut roots = Vec::with_capacity(args.roots.len());
    for root in &args.roots {
        let location = uri::from_path(root)?;
        db.add_library(LibraryRecord {
            location: location.clone(),
            monitored: true,
            scan_interval: 0,
        })?;
        roots.push(location);
    }

    let scanner = Scanner::new(Arc::new(LoftyTagReader));
    let summary = scanner.scan_roots_into(
        &mut db,
        &roots,
        args.force,
        &CancellationToken::new(),
        &mut |_| {},
    )?;
    db.save()?;
    info!("Saved {:?}", args.db);

    println!(
        "Indexed {} tracks: {} added, {} updated, {} removed, {} failed",
        db.len(),
        summary.progress.files_added,
        summary.progress.files_updated,
        summary.progress.files_removed,
        summary.failed
    );
    for root in &summary.incomplete_roots {
        println!("warning: {root} could not be fully enumerated");
    }
    Ok(())
}
