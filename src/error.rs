//! Error types surfaced at the collaborator boundary.
//!
//! DESIGN
//! ======
//! Geometry and collection operations are total, so every failure in the
//! engine originates at a collaborator call (generation, render, save) or in
//! mask data handed to us by one. Errors carry owned strings rather than
//! transport errors so they can be cloned into the published session view.

use serde::Serialize;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for operator-facing notices.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// ANNOTATOR ERROR
// =============================================================================

/// Errors produced while talking to the mask backend or handling its data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnotatorError {
    /// Mask payload is missing `counts` or `size` and no image dimensions
    /// were available to synthesize a placeholder.
    #[error("invalid mask data: {0}")]
    InvalidMaskData(String),

    /// The backend failed to produce a mask, returned a non-success status,
    /// or did not answer within the request timeout.
    #[error("mask generation failed: {0}")]
    GenerationFailed(String),

    /// A preview image could not be rendered or loaded.
    #[error("preview render failed: {0}")]
    RenderFailed(String),

    /// The backend rejected a save. `detail` is the server-provided text
    /// when one was present.
    #[error("save failed: {detail}")]
    PersistenceFailed { status: Option<u16>, detail: String },

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The session task has stopped and can no longer take commands.
    #[error("annotation session closed")]
    SessionClosed,
}

impl ErrorCode for AnnotatorError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidMaskData(_) => "E_INVALID_MASK_DATA",
            Self::GenerationFailed(_) => "E_GENERATION_FAILED",
            Self::RenderFailed(_) => "E_RENDER_FAILED",
            Self::PersistenceFailed { .. } => "E_PERSISTENCE_FAILED",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
            Self::SessionClosed => "E_SESSION_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        // Nothing is retried automatically; this tells the operator that
        // re-editing or saving again may succeed.
        matches!(
            self,
            Self::GenerationFailed(_) | Self::PersistenceFailed { status: None | Some(409 | 429 | 500..=599), .. }
        )
    }
}

// =============================================================================
// NOTICE
// =============================================================================

/// Operator-facing description of the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl Notice {
    #[must_use]
    pub fn from_error(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self { code: err.error_code(), message: err.to_string(), retryable: err.retryable() }
    }
}
