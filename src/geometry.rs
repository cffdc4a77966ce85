//! Geometry model: prompt points or polygon vertices in image pixels.
//!
//! DESIGN
//! ======
//! The edit mode is the discriminant of [`Geometry`], so a session never holds
//! both shapes at once and callers cannot read the wrong one. Switching mode
//! replaces the shape with an empty one of the other kind; nothing converts.
//!
//! All edit operations are total and return a snapshot of the sequence they
//! touched. A point operation on a polygon (or the reverse) leaves the shape
//! alone and returns an empty snapshot.

use serde::{Deserialize, Serialize};

// =============================================================================
// POINT
// =============================================================================

/// A pixel position in original-image space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Squared euclidean distance to a fractional image-space position.
    #[must_use]
    pub fn distance_sq_to(&self, x: f64, y: f64) -> f64 {
        let dx = f64::from(self.x) - x;
        let dy = f64::from(self.y) - y;
        dx * dx + dy * dy
    }
}

/// Which prompt set a point belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    Points,
    Polygon,
}

// =============================================================================
// GEOMETRY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Geometry {
    PointPrompt { positive: Vec<Point>, negative: Vec<Point> },
    Polygon { vertices: Vec<Point> },
}

impl Geometry {
    /// Empty geometry for the given mode.
    #[must_use]
    pub fn new(mode: EditMode) -> Self {
        match mode {
            EditMode::Points => Self::PointPrompt { positive: Vec::new(), negative: Vec::new() },
            EditMode::Polygon => Self::Polygon { vertices: Vec::new() },
        }
    }

    #[must_use]
    pub fn mode(&self) -> EditMode {
        match self {
            Self::PointPrompt { .. } => EditMode::Points,
            Self::Polygon { .. } => EditMode::Polygon,
        }
    }

    /// Append a prompt point and return the updated set for `kind`.
    pub fn add_point(&mut self, kind: PointKind, p: Point) -> &[Point] {
        match self {
            Self::PointPrompt { positive, negative } => {
                let set = match kind {
                    PointKind::Positive => positive,
                    PointKind::Negative => negative,
                };
                set.push(p);
                set.as_slice()
            }
            Self::Polygon { .. } => &[],
        }
    }

    /// Remove the prompt point at `index` and return the updated set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for the `kind` set.
    pub fn remove_point_at(&mut self, kind: PointKind, index: usize) -> &[Point] {
        match self {
            Self::PointPrompt { positive, negative } => {
                let set = match kind {
                    PointKind::Positive => positive,
                    PointKind::Negative => negative,
                };
                set.remove(index);
                set.as_slice()
            }
            Self::Polygon { .. } => &[],
        }
    }

    /// Append a polygon vertex and return the updated vertex list.
    pub fn add_vertex(&mut self, p: Point) -> &[Point] {
        match self {
            Self::Polygon { vertices } => {
                vertices.push(p);
                vertices.as_slice()
            }
            Self::PointPrompt { .. } => &[],
        }
    }

    /// Remove the vertex at `index` and return the updated vertex list.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn remove_vertex_at(&mut self, index: usize) -> &[Point] {
        match self {
            Self::Polygon { vertices } => {
                vertices.remove(index);
                vertices.as_slice()
            }
            Self::PointPrompt { .. } => &[],
        }
    }

    /// Clear every point of the current mode. The mode itself is kept.
    pub fn reset(&mut self) {
        match self {
            Self::PointPrompt { positive, negative } => {
                positive.clear();
                negative.clear();
            }
            Self::Polygon { vertices } => vertices.clear(),
        }
    }

    /// Total number of points or vertices.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::PointPrompt { positive, negative } => positive.len() + negative.len(),
            Self::Polygon { vertices } => vertices.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the backend can produce a mask from this geometry: at least one
    /// positive prompt, or a polygon with a non-degenerate outline.
    #[must_use]
    pub fn is_previewable(&self) -> bool {
        match self {
            Self::PointPrompt { positive, .. } => !positive.is_empty(),
            Self::Polygon { vertices } => vertices.len() >= 3,
        }
    }

    /// Point or vertex addressed by `target`, if it exists in this shape.
    #[must_use]
    pub fn get(&self, target: PointRef) -> Option<Point> {
        match (self, target) {
            (Self::PointPrompt { positive, .. }, PointRef::Positive(i)) => positive.get(i).copied(),
            (Self::PointPrompt { negative, .. }, PointRef::Negative(i)) => negative.get(i).copied(),
            (Self::Polygon { vertices }, PointRef::Vertex(i)) => vertices.get(i).copied(),
            _ => None,
        }
    }

    /// Remove whatever `target` addresses. Returns `false` when it does not
    /// exist in this shape.
    pub fn remove(&mut self, target: PointRef) -> bool {
        if self.get(target).is_none() {
            return false;
        }
        match target {
            PointRef::Positive(i) => self.remove_point_at(PointKind::Positive, i),
            PointRef::Negative(i) => self.remove_point_at(PointKind::Negative, i),
            PointRef::Vertex(i) => self.remove_vertex_at(i),
        };
        true
    }

    /// Every point with its address, in hit-test order: positive points, then
    /// negative points, then polygon vertices, each in insertion order.
    pub fn iter_refs(&self) -> impl Iterator<Item = (PointRef, Point)> + '_ {
        let (positive, negative, vertices): (&[Point], &[Point], &[Point]) = match self {
            Self::PointPrompt { positive, negative } => (positive.as_slice(), negative.as_slice(), &[][..]),
            Self::Polygon { vertices } => (&[][..], &[][..], vertices.as_slice()),
        };
        positive
            .iter()
            .enumerate()
            .map(|(i, p)| (PointRef::Positive(i), *p))
            .chain(negative.iter().enumerate().map(|(i, p)| (PointRef::Negative(i), *p)))
            .chain(vertices.iter().enumerate().map(|(i, p)| (PointRef::Vertex(i), *p)))
    }
}

/// Address of a single point inside a [`Geometry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "set", content = "index", rename_all = "snake_case")]
pub enum PointRef {
    Positive(usize),
    Negative(usize),
    Vertex(usize),
}

/// A single change to a [`Geometry`], as reported by the canvas controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "edit", content = "target", rename_all = "snake_case")]
pub enum Edit {
    /// A point was appended; the address is where it landed.
    Added(PointRef),
    /// The point at this address (before removal) was deleted.
    Removed(PointRef),
}

#[cfg(test)]
#[path = "geometry_test.rs"]
mod tests;
