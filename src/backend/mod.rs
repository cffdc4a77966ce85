//! Mask backend: the collaborator that generates, renders and stores masks.
//!
//! DESIGN
//! ======
//! The engine never segments images itself. Everything it needs from the
//! backend goes through [`MaskBackend`], so sessions can run against the
//! HTTP service in production and an in-memory mock under test. Generation
//! returns raw JSON on purpose: the RLE canonicalizer, not the transport, is
//! the one place mask data gets validated.
//!
//! Every generation request carries its region id and token so a backend
//! shared by many sessions can attribute responses without conflating them.

pub mod http;

use serde::Serialize;
use serde_json::Value;

use crate::collection::SavedMask;
use crate::error::AnnotatorError;
use crate::geometry::Point;
use crate::rle::Rle;

// =============================================================================
// REQUEST TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointPromptRequest {
    pub image_path: String,
    pub region_id: String,
    pub positive: Vec<Point>,
    pub negative: Vec<Point>,
    /// The active candidate's current mask, used by the model as a prior.
    pub prior_mask: Option<Rle>,
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolygonPromptRequest {
    pub image_path: String,
    pub region_id: String,
    pub vertices: Vec<Point>,
    pub token: u64,
}

/// A ready-to-display image, as a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedImage(pub String);

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Deterministic preview URL templates. `nonce` defeats caching when the
/// same logical preview changes content.
pub trait PreviewUrls {
    fn preview_url(&self, image_path: &str, rle: &Rle, nonce: i64) -> String;

    /// Last-resort visual fallback that depends on the image only.
    fn diagnostic_url(&self, image_path: &str, nonce: i64) -> String;
}

/// Async interface to the mask backend. Enables mocking in tests.
#[async_trait::async_trait]
pub trait MaskBackend: PreviewUrls + Send + Sync {
    /// Run the point-prompt segmentation model.
    ///
    /// # Errors
    ///
    /// Returns [`AnnotatorError::GenerationFailed`] on transport failure or a
    /// non-success response.
    async fn generate_from_points(&self, req: &PointPromptRequest) -> Result<Value, AnnotatorError>;

    /// Rasterize a polygon into a mask.
    ///
    /// # Errors
    ///
    /// Returns [`AnnotatorError::GenerationFailed`] on transport failure or a
    /// non-success response.
    async fn generate_from_polygon(&self, req: &PolygonPromptRequest) -> Result<Value, AnnotatorError>;

    /// Render a mask over its image. `Ok(None)` means the backend answered
    /// but had no image to give.
    ///
    /// # Errors
    ///
    /// Returns [`AnnotatorError::RenderFailed`] if rendering failed.
    async fn render_preview(&self, image_path: &str, rle: &Rle) -> Result<Option<EncodedImage>, AnnotatorError>;

    /// Store every mask of a region.
    ///
    /// # Errors
    ///
    /// Returns [`AnnotatorError::PersistenceFailed`] with the server's detail
    /// text when the save is rejected.
    async fn save_region_masks(
        &self,
        image_path: &str,
        region_id: &str,
        masks: &[SavedMask],
    ) -> Result<(), AnnotatorError>;
}
