//! Upload command: bulk-upload a file or directory once.

use std::path::{Path, PathBuf};

use colored::Colorize;
use serde::Serialize;

use crate::cli::device::{self, Connected};
use crate::config::resolve_sync_root;
use crate::error::{Error, Result};
use crate::sync::{BulkStats, SyncRoot};

#[derive(Serialize)]
struct UploadOutput<'a> {
    root: &'a Path,
    path: &'a Path,
    stats: &'a BulkStats,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(path.canonicalize()?)
}

/// Execute the upload command.
///
/// # Errors
///
/// Returns [`Error::UploadIncomplete`] if any entry failed, after the tally
/// has been printed.
pub fn execute(path: Option<&Path>, folder: Option<&Path>, device: Option<&str>, json: bool) -> Result<()> {
    device::runtime()?.block_on(run(path, folder, device, json))
}

async fn run(path: Option<&Path>, folder: Option<&Path>, device: Option<&str>, json: bool) -> Result<()> {
    let Connected { engine, settings, .. } = device::connect(device).await?;
    let root_path = resolve_sync_root(folder, &settings)?;
    let subtree = match path {
        Some(path) => absolute(path)?,
        None => root_path.clone(),
    };

    let stats = engine.upload(&SyncRoot::new(&root_path), &subtree).await?;
    engine.shutdown().await;

    if json {
        let output = UploadOutput {
            root: &root_path,
            path: &subtree,
            stats: &stats,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Uploaded {}", subtree.display());
        println!("  Directories: {}", stats.directories);
        println!("  Files:       {} ({} unchanged)", stats.files, stats.unchanged);
        if stats.failed > 0 {
            println!("  {}      {}", "Failed:".red(), stats.failed);
            for failure in &stats.failures {
                println!("    {} {}", failure.path, failure.reason.as_str().dimmed());
            }
        }
    }

    if stats.is_clean() {
        Ok(())
    } else {
        Err(Error::UploadIncomplete {
            failed: stats.failed,
            total: stats.total(),
        })
    }
}
