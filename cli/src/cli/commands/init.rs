//! Scaffold a devsync project in the current directory.
//!
//! Creates the sync folder with a starter `main.py` and a project
//! `README.md`. Existing files are never overwritten.

use crate::config::load_settings;
use crate::error::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct InitOutput {
    project: PathBuf,
    sync_folder: PathBuf,
    created: Vec<PathBuf>,
}

fn write_if_absent(path: &Path, content: &str, created: &mut Vec<PathBuf>) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, content)?;
    created.push(path.to_path_buf());
    Ok(())
}

/// Execute the init command.
///
/// # Errors
///
/// Returns an error if the folder or files cannot be created.
pub fn execute(name: Option<&str>, json: bool) -> Result<()> {
    let settings = load_settings()?;
    let project = std::env::current_dir()?;
    let name = match name {
        Some(name) => name.to_string(),
        None => project
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidArgument("cannot derive a project name; pass --name".to_string()))?,
    };

    let folder = project.join(&settings.sync_folder);
    fs::create_dir_all(&folder)?;

    let mut created = Vec::new();
    write_if_absent(
        &folder.join("main.py"),
        &format!("print(\"Hello from {name}!\")"),
        &mut created,
    )?;
    write_if_absent(&project.join("README.md"), &format!("###  {name}"), &mut created)?;

    if json {
        let output = InitOutput {
            project,
            sync_folder: folder,
            created,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Initialized devsync project {name}");
        println!("  Sync folder: {}", folder.display());
        for path in &created {
            println!("  Created:     {}", path.display());
        }
        println!();
        println!("Next: devsync sync --device <host:port>");
    }

    Ok(())
}
