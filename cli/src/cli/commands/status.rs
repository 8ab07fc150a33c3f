//! Status command implementation.
//!
//! Purely local: reports resolved configuration and the session marker
//! without touching the device.

use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

use crate::config::{
    discover_project_root, load_settings, read_session_marker, resolve_device, settings_path, SessionMarker,
};
use crate::error::Result;

#[derive(Serialize)]
struct StatusOutput {
    config_path: Option<PathBuf>,
    device: Option<String>,
    project: Option<PathBuf>,
    sync_folder: Option<PathBuf>,
    operation_timeout_ms: u64,
    session: Option<SessionMarker>,
}

/// Execute status command.
///
/// # Errors
///
/// Returns an error if the settings file is unreadable.
pub fn execute(device: Option<&str>, json: bool) -> Result<()> {
    let settings = load_settings()?;
    let project = discover_project_root(&settings.sync_folder);
    let output = StatusOutput {
        config_path: settings_path(),
        device: resolve_device(device, &settings),
        sync_folder: project.as_ref().map(|p| p.join(&settings.sync_folder)),
        project,
        operation_timeout_ms: settings.operation_timeout_ms,
        session: read_session_marker(),
    };

    if json {
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("{}", "devsync status".bold());
    println!();
    if let Some(path) = &output.config_path {
        println!("Config:  {}", path.display());
    }
    println!(
        "Device:  {}",
        output.device.as_deref().unwrap_or("(not configured)")
    );
    match &output.sync_folder {
        Some(folder) => println!("Folder:  {}", folder.display()),
        None => println!("Folder:  {} not found", settings.sync_folder),
    }
    println!();

    match &output.session {
        Some(session) => {
            println!("{}", "Active sync session".green());
            println!("  ID:      {}", session.session_id);
            println!("  Root:    {}", session.sync_root);
            println!("  Device:  {}", session.device);
            println!("  PID:     {}", session.pid);
            println!("  Since:   {}", session.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        None => {
            println!("No active sync session.");
            println!();
            println!("Start one with: devsync sync");
        }
    }

    Ok(())
}
