//! Screen commands.

use std::io::Read;
use std::path::Path;

use crate::cli::ScreenCommands;
use crate::error::Result;
use crate::screen::{parse_shapes, ScreenEditor};

/// Execute screen commands.
pub fn execute(command: &ScreenCommands, json: bool) -> Result<()> {
    match command {
        ScreenCommands::Compile { name, input, output } => compile(name, input.as_deref(), output, json),
    }
}

fn compile(name: &str, input: Option<&Path>, output: &Path, json: bool) -> Result<()> {
    let source = match input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let shapes = parse_shapes(&source)?;

    let mut editor = ScreenEditor::open(name, output)?;
    editor.update(shapes)?;

    if json {
        let payload = serde_json::json!({
            "name": editor.name(),
            "output": editor.target().display().to_string(),
            "shapes": editor.shapes().len(),
        });
        println!("{payload}");
    } else {
        println!(
            "Compiled {} ({} shapes) -> {}",
            editor.name(),
            editor.shapes().len(),
            editor.target().display()
        );
    }
    Ok(())
}
