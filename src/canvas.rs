//! Canvas interaction controller.
//!
//! DESIGN
//! ======
//! Turns one display-space pointer event into exactly one outcome: a geometry
//! edit, a selection change, or a deletion. The controller owns selection and
//! double-click timing; the geometry itself is borrowed per event so the
//! session stays the single owner of editing state.
//!
//! Time is passed in explicitly (`now`) so click timing is deterministic
//! under test.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CanvasConfig;
use crate::geometry::{Edit, EditMode, Geometry, Point, PointKind, PointRef};
use crate::rle::ImageSize;

// =============================================================================
// TYPES
// =============================================================================

/// Size of the area the image is displayed in, in display pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerButton {
    /// Adds positive prompts.
    Primary,
    /// Adds negative prompts.
    Secondary,
}

/// A click in display coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub x: f64,
    pub y: f64,
    pub button: PointerButton,
}

/// What a pointer event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "target", rename_all = "snake_case")]
pub enum CanvasAction {
    Edited(Edit),
    Selected(PointRef),
    Deselected(PointRef),
}

impl CanvasAction {
    /// The geometry edit, if this action changed the geometry.
    #[must_use]
    pub fn edit(self) -> Option<Edit> {
        match self {
            Self::Edited(edit) => Some(edit),
            Self::Selected(_) | Self::Deselected(_) => None,
        }
    }
}

/// Display scale for an image: fit inside the viewport, never upscale.
#[must_use]
pub fn fit_scale(image: ImageSize, viewport: ViewportSize, max_upscale: f64) -> f64 {
    let scale = (viewport.width / f64::from(image.width))
        .min(viewport.height / f64::from(image.height))
        .min(max_upscale);
    if scale.is_finite() && scale > 0.0 { scale } else { max_upscale }
}

// =============================================================================
// CONTROLLER
// =============================================================================

#[derive(Debug, Clone)]
pub struct CanvasController {
    config: CanvasConfig,
    image: ImageSize,
    scale: f64,
    selected: Option<PointRef>,
    /// Previous interaction's hit: address, the point it held, and when.
    last_hit: Option<(PointRef, Point, Instant)>,
}

impl CanvasController {
    #[must_use]
    pub fn new(config: CanvasConfig, image: ImageSize, viewport: ViewportSize) -> Self {
        Self {
            config,
            image,
            scale: fit_scale(image, viewport, config.max_upscale),
            selected: None,
            last_hit: None,
        }
    }

    /// Recompute the display scale for a new viewport.
    pub fn resize(&mut self, viewport: ViewportSize) {
        self.scale = fit_scale(self.image, viewport, self.config.max_upscale);
    }

    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    #[must_use]
    pub fn selected(&self) -> Option<PointRef> {
        self.selected
    }

    /// Forget selection and click history, e.g. after the geometry is reset.
    pub fn clear(&mut self) {
        self.selected = None;
        self.last_hit = None;
    }

    /// Map a display position to the nearest image pixel inside the image.
    #[must_use]
    pub fn to_image(&self, x: f64, y: f64) -> Point {
        Point::new(
            clamp_to_pixel(x / self.scale, self.image.width),
            clamp_to_pixel(y / self.scale, self.image.height),
        )
    }

    /// First point within the hit tolerance of a display position, in
    /// positive, negative, vertex order.
    #[must_use]
    pub fn hit_test(&self, geometry: &Geometry, x: f64, y: f64) -> Option<PointRef> {
        let (ix, iy) = (x / self.scale, y / self.scale);
        let tolerance = self.config.hit_tolerance_px / self.scale;
        let tolerance_sq = tolerance * tolerance;
        geometry
            .iter_refs()
            .find(|(_, p)| p.distance_sq_to(ix, iy) <= tolerance_sq)
            .map(|(r, _)| r)
    }

    /// Apply one pointer event to `geometry`.
    pub fn handle_pointer(&mut self, geometry: &mut Geometry, event: PointerEvent, now: Instant) -> CanvasAction {
        let Some(hit) = self.hit_test(geometry, event.x, event.y) else {
            self.last_hit = None;
            return CanvasAction::Edited(self.append(geometry, event));
        };

        // Indices shift on removal, so the stored point must match as well.
        let point = geometry.get(hit);
        let is_double_click = match (self.last_hit, point) {
            (Some((prev, prev_point, at)), Some(point)) => {
                prev == hit && prev_point == point && now.duration_since(at) < self.config.double_click
            }
            _ => false,
        };

        if is_double_click {
            geometry.remove(hit);
            self.selected = None;
            self.last_hit = None;
            return CanvasAction::Edited(Edit::Removed(hit));
        }

        self.last_hit = point.map(|p| (hit, p, now));
        if self.selected == Some(hit) {
            self.selected = None;
            CanvasAction::Deselected(hit)
        } else {
            self.selected = Some(hit);
            CanvasAction::Selected(hit)
        }
    }

    /// Keyboard delete: remove the selected point. Click timing is untouched.
    pub fn delete_selected(&mut self, geometry: &mut Geometry) -> Option<Edit> {
        let target = self.selected.take()?;
        geometry.remove(target).then_some(Edit::Removed(target))
    }

    fn append(&self, geometry: &mut Geometry, event: PointerEvent) -> Edit {
        let p = self.to_image(event.x, event.y);
        match geometry.mode() {
            EditMode::Points => match event.button {
                PointerButton::Primary => {
                    let len = geometry.add_point(PointKind::Positive, p).len();
                    Edit::Added(PointRef::Positive(len - 1))
                }
                PointerButton::Secondary => {
                    let len = geometry.add_point(PointKind::Negative, p).len();
                    Edit::Added(PointRef::Negative(len - 1))
                }
            },
            EditMode::Polygon => {
                let len = geometry.add_vertex(p).len();
                Edit::Added(PointRef::Vertex(len - 1))
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_to_pixel(v: f64, extent: u32) -> u32 {
    let max = f64::from(extent.saturating_sub(1));
    v.round().clamp(0.0, max) as u32
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
