//! Owned screen editor handles.
//!
//! At most one editor is open per [`EditorSlot`]. Opening another closes the
//! current one first, then constructs the new one.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{compile, ScreenError, Shape};
use crate::sync::atomic_write;

/// Editor bound to one class name and one output file.
#[derive(Debug)]
pub struct ScreenEditor {
    name: String,
    target: PathBuf,
    shapes: Vec<Shape>,
}

impl ScreenEditor {
    /// Open an editor and write the empty class to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is invalid or the file cannot be written.
    pub fn open(name: impl Into<String>, target: impl Into<PathBuf>) -> Result<Self, ScreenError> {
        let mut editor = Self {
            name: name.into(),
            target: target.into(),
            shapes: Vec::new(),
        };
        editor.render()?;
        debug!(name = %editor.name, target = %editor.target.display(), "Screen editor opened");
        Ok(editor)
    }

    /// Replace the shape list and regenerate the whole file.
    ///
    /// On error the previous shapes and file content are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation or the write fails.
    pub fn update(&mut self, shapes: Vec<Shape>) -> Result<(), ScreenError> {
        let previous = std::mem::replace(&mut self.shapes, shapes);
        if let Err(e) = self.render() {
            self.shapes = previous;
            return Err(e);
        }
        Ok(())
    }

    fn render(&mut self) -> Result<(), ScreenError> {
        let source = compile(&self.name, &self.shapes)?;
        atomic_write(&self.target, source)?;
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    #[must_use]
    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }
}

impl Drop for ScreenEditor {
    fn drop(&mut self) {
        debug!(name = %self.name, "Screen editor closed");
    }
}

/// Holder of the single open editor.
#[derive(Debug, Default)]
pub struct EditorSlot {
    current: Option<ScreenEditor>,
}

impl EditorSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the current editor, then open a new one.
    ///
    /// The previous editor is gone even if opening fails.
    ///
    /// # Errors
    ///
    /// Returns the error from [`ScreenEditor::open`].
    pub fn open(
        &mut self,
        name: impl Into<String>,
        target: impl Into<PathBuf>,
    ) -> Result<&mut ScreenEditor, ScreenError> {
        drop(self.current.take());
        let editor = ScreenEditor::open(name, target)?;
        Ok(self.current.insert(editor))
    }

    #[must_use]
    pub fn current(&mut self) -> Option<&mut ScreenEditor> {
        self.current.as_mut()
    }

    /// Close the open editor, if any.
    pub fn close(&mut self) -> bool {
        self.current.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn rect(color: &str) -> Shape {
        Shape::Rect {
            x: 0.0,
            y: 0.0,
            width: 2.0,
            height: 2.0,
            color: color.to_string(),
        }
    }

    #[test]
    fn test_open_writes_empty_class() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("screens/home.py");

        let editor = ScreenEditor::open("Home", &target).unwrap();

        let source = fs::read_to_string(editor.target()).unwrap();
        assert!(source.ends_with("class Home:\n\tpass"));
    }

    #[test]
    fn test_update_rewrites_whole_file() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("home.py");
        let mut editor = ScreenEditor::open("Home", &target).unwrap();

        editor.update(vec![rect("#111111"), rect("#222222")]).unwrap();
        editor.update(vec![rect("#333333")]).unwrap();

        let source = fs::read_to_string(&target).unwrap();
        assert_eq!(source.matches("d.Rectangle").count(), 1);
        assert!(source.contains("333333"));
        assert!(!source.contains("111111"));
    }

    #[test]
    fn test_failed_update_keeps_previous() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("home.py");
        let mut editor = ScreenEditor::open("Home", &target).unwrap();
        editor.update(vec![rect("#abcdef")]).unwrap();

        assert!(editor.update(vec![rect("nope")]).is_err());

        assert_eq!(editor.shapes(), &[rect("#abcdef")]);
        assert!(fs::read_to_string(&target).unwrap().contains("abcdef"));
    }

    #[test]
    fn test_slot_replaces_editor() {
        let temp = TempDir::new().unwrap();
        let mut slot = EditorSlot::new();

        slot.open("Home", temp.path().join("home.py")).unwrap();
        slot.open("Menu", temp.path().join("menu.py")).unwrap();

        let current = slot.current().unwrap();
        assert_eq!(current.name(), "Menu");
        assert!(temp.path().join("home.py").exists());
        assert!(slot.close());
        assert!(slot.current().is_none());
    }

    #[test]
    fn test_slot_is_empty_after_failed_open() {
        let temp = TempDir::new().unwrap();
        let mut slot = EditorSlot::new();
        slot.open("Home", temp.path().join("home.py")).unwrap();

        assert!(slot.open("not valid", temp.path().join("x.py")).is_err());
        assert!(slot.current().is_none());
    }
}
