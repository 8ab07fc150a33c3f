//! Sync command: mirror the local folder onto the device until stopped.
//!
//! The command connects, starts a session on the resolved sync folder (which
//! refreshes the mirror when it is stale), uploads the folder once, then
//! watches it and streams engine events. It ends on Ctrl-C, or with an error
//! when the link drops. Nothing is retried across a disconnect.

use std::path::Path;

use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::cli::device::{self, Connected};
use crate::config::{clear_session_marker, resolve_sync_root, write_session_marker, SessionMarker};
use crate::error::{Error, Result};
use crate::sync::{EngineEvent, StopReason, SyncRoot};
use crate::transport::TransportError;
use crate::watcher::LocalWatcher;

/// Execute the sync command.
///
/// # Errors
///
/// Returns an error if the device or folder is unavailable, or when the
/// link drops mid-session.
pub fn execute(folder: Option<&Path>, device: Option<&str>, json: bool) -> Result<()> {
    device::runtime()?.block_on(run(folder, device, json))
}

async fn run(folder: Option<&Path>, device: Option<&str>, json: bool) -> Result<()> {
    let Connected {
        engine,
        endpoint,
        settings,
    } = device::connect(device).await?;
    let root_path = resolve_sync_root(folder, &settings)?;
    let root = SyncRoot::new(&root_path);

    let mut events = engine.subscribe();
    let session = engine.start_sync(root.clone()).await?;
    if let Err(e) = write_session_marker(&SessionMarker::for_session(&session, &endpoint.to_string())) {
        warn!(error = %e, "Could not write the session marker");
    }

    let stats = engine.upload(&root, &root_path).await?;
    if json {
        println!("{}", serde_json::json!({ "event": "uploaded", "stats": stats }));
    } else {
        println!(
            "Uploaded {} of {} entries from {}",
            stats.succeeded(),
            stats.total(),
            root_path.display()
        );
    }

    let watcher = LocalWatcher::start(&root_path, engine.change_sender())?;
    if !json {
        println!(
            "Syncing {} -> {} {}",
            watcher.root().display(),
            endpoint,
            "(Ctrl-C to stop)".dimmed()
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            event = events.recv() => match event {
                Ok(event) => {
                    report(&event, json)?;
                    if let EngineEvent::SessionStopped { reason, .. } = event {
                        break match reason {
                            StopReason::Disconnected => Err(Error::Transport(TransportError::Disconnected(
                                "link lost during sync".to_string(),
                            ))),
                            _ => Ok(()),
                        };
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    drop(watcher);
    engine.stop_sync();
    clear_session_marker();
    engine.shutdown().await;
    outcome
}

fn report(event: &EngineEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        EngineEvent::Applied { kind, path, .. } => {
            println!("{} {kind} {path}", "✓".green());
        }
        EngineEvent::Failed { kind, path, error, .. } => {
            println!("{} {kind} {path}: {error}", "✗".red());
        }
        EngineEvent::Refreshed { revision, entries } => {
            println!("{} {entries} entries at revision {revision}", "Refreshed".cyan());
        }
        EngineEvent::SessionStarted { root, .. } => {
            println!("{} {root}", "Session started".cyan());
        }
        EngineEvent::SessionStopped { reason, discarded } => {
            println!(
                "{} ({reason}, {discarded} queued operations discarded)",
                "Session stopped".yellow()
            );
        }
    }
    Ok(())
}
