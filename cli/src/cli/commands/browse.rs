//! Device browsing: `ls` and `cat`.
//!
//! Both read through the engine's mirror, which `connect` brings up to date.
//! `cat` falls back to reading the device when the content is not cached.

use std::io::Write;
use std::sync::PoisonError;

use colored::Colorize;
use serde::Serialize;

use crate::cli::device::{self, Connected};
use crate::error::{Error, Result};
use crate::sync::path::{self, is_within};
use crate::sync::DeviceFile;

#[derive(Serialize)]
struct LsOutput<'a> {
    path: &'a str,
    revision: u64,
    entries: &'a [DeviceFile],
}

/// Execute the ls command.
///
/// # Errors
///
/// Returns [`Error::DevicePathNotFound`] for unknown paths, or connection errors.
pub fn execute_ls(device_path: &str, recursive: bool, device: Option<&str>, json: bool) -> Result<()> {
    device::runtime()?.block_on(async {
        let Connected { engine, .. } = device::connect(device).await?;
        let target = path::normalize(device_path);

        let (revision, entries) = {
            let store = engine.store();
            let store = store.read().unwrap_or_else(PoisonError::into_inner);
            let entries: Vec<DeviceFile> = match store.get(target) {
                Some(entry) if !entry.is_dir() => vec![entry.clone()],
                None if !target.is_empty() => {
                    return Err(Error::DevicePathNotFound {
                        path: target.to_string(),
                    });
                }
                _ if recursive => store
                    .iter()
                    .filter(|entry| entry.path != target && is_within(&entry.path, target))
                    .cloned()
                    .collect(),
                _ => store.list(target).into_iter().cloned().collect(),
            };
            (store.revision(), entries)
        };
        engine.shutdown().await;

        if json {
            let output = LsOutput {
                path: target,
                revision,
                entries: &entries,
            };
            println!("{}", serde_json::to_string(&output)?);
            return Ok(());
        }

        if entries.is_empty() {
            println!("{}", "(empty)".dimmed());
        }
        for entry in &entries {
            print_entry(entry, recursive);
        }
        Ok(())
    })
}

fn print_entry(entry: &DeviceFile, full_path: bool) {
    let name = if full_path { entry.path.as_str() } else { entry.name() };
    if entry.is_dir() {
        println!("{:>8}  {:<8}  {}", "-", "", format!("{name}/").as_str().blue().bold());
    } else {
        let hash = entry
            .content_hash
            .as_deref()
            .map_or(String::new(), |h| h.chars().take(8).collect());
        println!("{:>8}  {:<8}  {name}", entry.size, hash.as_str().dimmed());
    }
}

/// Execute the cat command.
///
/// # Errors
///
/// Returns an error if the path is missing, a directory, or unreadable.
pub fn execute_cat(device_path: &str, device: Option<&str>, json: bool) -> Result<()> {
    device::runtime()?.block_on(async {
        let Connected { engine, .. } = device::connect(device).await?;
        let content = engine.open(device_path).await;
        engine.shutdown().await;
        let content = content?;

        if json {
            let output = serde_json::json!({
                "path": path::normalize(device_path),
                "size": content.len(),
                "content": String::from_utf8_lossy(&content),
            });
            println!("{}", serde_json::to_string(&output)?);
        } else {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
        }
        Ok(())
    })
}
