//! Run command: execute a local script on the device.

use std::path::Path;

use serde::Serialize;

use crate::cli::device::{self, Connected};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct RunOutput<'a> {
    file: &'a Path,
    skipped: bool,
    output: &'a str,
}

/// Execute the run command. An empty script is not sent.
///
/// # Errors
///
/// Returns an error if the file is unreadable, the device is unreachable,
/// or the script raised on the device.
pub fn execute(file: &Path, device: Option<&str>, json: bool) -> Result<()> {
    let code = std::fs::read(file)?;
    let output = if code.is_empty() {
        None
    } else {
        Some(device::runtime()?.block_on(async {
            let Connected { engine, .. } = device::connect(device).await?;
            let output = engine.run(&code).await;
            engine.shutdown().await;
            Ok::<_, Error>(output?)
        })?)
    };

    if json {
        let payload = RunOutput {
            file,
            skipped: output.is_none(),
            output: output.as_deref().unwrap_or_default(),
        };
        println!("{}", serde_json::to_string(&payload)?);
    } else {
        match output {
            Some(output) => print!("{output}"),
            None => println!("Skipped empty file {}", file.display()),
        }
    }
    Ok(())
}
