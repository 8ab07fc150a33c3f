//! Screen compiler: shape descriptors to display-class source.
//!
//! The compiler is a pure function. Given the class name and an ordered
//! list of shapes it regenerates the complete module text:
//!
//! ```text
//! # GENERATED DEVSYNC SCREEN Do not modify this file directly
//! import display as d
//!
//! class Home:
//! 	blocks = [
//! 	d.Rectangle(2, 2, 12, 7, aabb00),
//! 	]
//! ```
//!
//! Coordinates are rounded half-up to integers and colours are written as
//! bare lower-case hex. [`ScreenEditor`] owns an output file and rewrites it
//! wholesale on every edit.

mod editor;

pub use editor::{EditorSlot, ScreenEditor};

use serde::Deserialize;
use thiserror::Error;

const HEADER: &str = "# GENERATED DEVSYNC SCREEN Do not modify this file directly\nimport display as d\n\n";

/// Errors produced while parsing or compiling a screen.
#[derive(Error, Debug)]
pub enum ScreenError {
    #[error("Invalid class name: {0:?}")]
    InvalidName(String),

    #[error("Unknown shape kind: {0}")]
    UnknownKind(String),

    #[error("Shape {index} ({kind}) is missing `{field}`")]
    MissingField {
        index: usize,
        kind: &'static str,
        field: &'static str,
    },

    #[error("Invalid colour: {0:?}")]
    InvalidColor(String),

    #[error("A line needs exactly 4 points, got {0}")]
    InvalidPoints(usize),

    #[error("Invalid shape list: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One display primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Rect {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        color: String,
    },
    Line {
        points: [f64; 4],
        color: String,
        stroke_width: f64,
    },
}

/// Shape as emitted by the drawing surface. Field names vary by kind.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(alias = "name")]
    kind: String,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    width: Option<f64>,
    height: Option<f64>,
    points: Option<Vec<f64>>,
    #[serde(alias = "fill", alias = "stroke")]
    color: Option<String>,
    stroke_width: Option<f64>,
}

impl Descriptor {
    fn into_shape(self, index: usize) -> Result<Shape, ScreenError> {
        match self.kind.as_str() {
            "rect" | "rectangle" => {
                let missing = |field| ScreenError::MissingField { index, kind: "rect", field };
                Ok(Shape::Rect {
                    x: self.x,
                    y: self.y,
                    width: self.width.ok_or_else(|| missing("width"))?,
                    height: self.height.ok_or_else(|| missing("height"))?,
                    color: self.color.ok_or_else(|| missing("color"))?,
                })
            }
            "line" => {
                let missing = |field| ScreenError::MissingField { index, kind: "line", field };
                let points = self.points.ok_or_else(|| missing("points"))?;
                let points: [f64; 4] = points
                    .as_slice()
                    .try_into()
                    .map_err(|_| ScreenError::InvalidPoints(points.len()))?;
                Ok(Shape::Line {
                    points,
                    color: self.color.ok_or_else(|| missing("color"))?,
                    stroke_width: self.stroke_width.unwrap_or(1.0),
                })
            }
            other => Err(ScreenError::UnknownKind(other.to_string())),
        }
    }
}

/// Parse a JSON array of shape descriptors.
///
/// # Errors
///
/// Returns an error for malformed JSON, unknown kinds or missing fields.
pub fn parse_shapes(json: &str) -> Result<Vec<Shape>, ScreenError> {
    let descriptors: Vec<Descriptor> = serde_json::from_str(json)?;
    descriptors
        .into_iter()
        .enumerate()
        .map(|(index, descriptor)| descriptor.into_shape(index))
        .collect()
}

/// Round half-up, the way the drawing surface reports positions.
#[allow(clippy::cast_possible_truncation)]
fn round(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

/// Normalize `#AAbb00` to `aabb00`.
fn hex_color(color: &str) -> Result<String, ScreenError> {
    let hex = color.trim().trim_start_matches('#');
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(hex.to_ascii_lowercase())
    } else {
        Err(ScreenError::InvalidColor(color.to_string()))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Compile shapes into the source of class `name`.
///
/// # Errors
///
/// Returns an error if `name` is not an identifier or a colour is invalid.
pub fn compile(name: &str, shapes: &[Shape]) -> Result<String, ScreenError> {
    if !is_identifier(name) {
        return Err(ScreenError::InvalidName(name.to_string()));
    }

    let mut out = format!("{HEADER}class {name}:");
    if shapes.is_empty() {
        out.push_str("\n\tpass");
        return Ok(out);
    }

    out.push_str("\n\tblocks = [");
    for shape in shapes {
        match shape {
            Shape::Rect {
                x,
                y,
                width,
                height,
                color,
            } => {
                out.push_str(&format!(
                    "\n\td.Rectangle({}, {}, {}, {}, {}),",
                    round(*x),
                    round(*y),
                    round(x + width),
                    round(y + height),
                    hex_color(color)?
                ));
            }
            Shape::Line {
                points: [x1, y1, x2, y2],
                color,
                stroke_width,
            } => {
                out.push_str(&format!(
                    "\n\td.Line({}, {}, {}, {}, {}, thickness={stroke_width}),",
                    round(*x1),
                    round(*y1),
                    round(*x2),
                    round(*y2),
                    hex_color(color)?
                ));
            }
        }
    }
    out.push_str("\n\t]");
    Ok(out)
}
