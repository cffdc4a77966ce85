//! HTTP client for the mask backend service.
//!
//! Thin `reqwest` wrapper over the backend's JSON endpoints. Status and body
//! interpretation lives in the pure `parse_*` functions for testability.
//!
//! ERROR HANDLING
//! ==============
//! The backend answers `{"success": true, ...}` or `{"success": false,
//! "error": "..."}`; framework-level rejections carry `{"detail": ...}`.
//! Whichever text is present is what the operator sees.

use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{EncodedImage, MaskBackend, PointPromptRequest, PolygonPromptRequest, PreviewUrls};
use crate::collection::SavedMask;
use crate::config::{AnnotatorConfig, BackendTimeouts};
use crate::error::AnnotatorError;
use crate::geometry::Point;
use crate::rle::Rle;

const POINT_PROMPT_PATH: &str = "/sam/point-prompt";
const POLYGON_PROMPT_PATH: &str = "/sam/polygon-prompt";
const RENDER_PREVIEW_PATH: &str = "/mask/render-preview";
const PREVIEW_PATH: &str = "/mask/preview";
const DEBUG_PREVIEW_PATH: &str = "/mask/debug-preview";
const SAVE_REGION_PATH: &str = "/annotate/save-region";

/// Longest slice of a non-JSON error body echoed back to the operator.
const MAX_ERROR_BODY_CHARS: usize = 200;

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpMaskBackend {
    http: reqwest::Client,
    base: Url,
}

impl HttpMaskBackend {
    /// # Errors
    ///
    /// Returns [`AnnotatorError::HttpClientBuild`] if `base_url` is not a
    /// valid absolute URL or the client cannot be built.
    pub fn new(base_url: &str, timeouts: BackendTimeouts) -> Result<Self, AnnotatorError> {
        let base = Url::parse(base_url).map_err(|e| AnnotatorError::HttpClientBuild(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| AnnotatorError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base })
    }

    /// # Errors
    ///
    /// See [`HttpMaskBackend::new`].
    pub fn from_config(config: &AnnotatorConfig) -> Result<Self, AnnotatorError> {
        Self::new(&config.backend_url, config.timeouts)
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!("{}{path}", self.base.path().trim_end_matches('/'));
        url.set_path(&joined);
        url
    }

    /// POST a JSON body and return the status and raw response text.
    async fn post_json(&self, path: &str, body: &impl Serialize) -> Result<(u16, String), reqwest::Error> {
        let response = self.http.post(self.endpoint(path)).json(body).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        debug!(path, status, bytes = text.len(), "backend responded");
        Ok((status, text))
    }
}

#[async_trait::async_trait]
impl MaskBackend for HttpMaskBackend {
    async fn generate_from_points(&self, req: &PointPromptRequest) -> Result<Value, AnnotatorError> {
        let body = PointPromptBody {
            image_path: &req.image_path,
            part_name: &req.region_id,
            positive_points: &req.positive,
            negative_points: &req.negative,
            prior_mask: req.prior_mask.as_ref(),
            request_token: req.token,
        };
        let (status, text) = self
            .post_json(POINT_PROMPT_PATH, &body)
            .await
            .map_err(|e| AnnotatorError::GenerationFailed(e.to_string()))?;
        parse_generation_response(status, &text)
    }

    async fn generate_from_polygon(&self, req: &PolygonPromptRequest) -> Result<Value, AnnotatorError> {
        let body = PolygonPromptBody {
            image_path: &req.image_path,
            part_name: &req.region_id,
            polygon_points: &req.vertices,
            request_token: req.token,
        };
        let (status, text) = self
            .post_json(POLYGON_PROMPT_PATH, &body)
            .await
            .map_err(|e| AnnotatorError::GenerationFailed(e.to_string()))?;
        parse_generation_response(status, &text)
    }

    async fn render_preview(&self, image_path: &str, rle: &Rle) -> Result<Option<EncodedImage>, AnnotatorError> {
        let body = RenderPreviewBody { image_path, rle };
        let (status, text) = self
            .post_json(RENDER_PREVIEW_PATH, &body)
            .await
            .map_err(|e| AnnotatorError::RenderFailed(e.to_string()))?;
        parse_render_response(status, &text)
    }

    async fn save_region_masks(
        &self,
        image_path: &str,
        region_id: &str,
        masks: &[SavedMask],
    ) -> Result<(), AnnotatorError> {
        let body = SaveRegionBody { image_path, part_name: region_id, masks };
        let (status, text) = self
            .post_json(SAVE_REGION_PATH, &body)
            .await
            .map_err(|e| AnnotatorError::PersistenceFailed { status: None, detail: e.to_string() })?;
        parse_save_response(status, &text)
    }
}

impl PreviewUrls for HttpMaskBackend {
    fn preview_url(&self, image_path: &str, rle: &Rle, nonce: i64) -> String {
        // Serializing an Rle cannot fail.
        let rle_json = serde_json::to_string(rle).unwrap_or_default();
        let mut url = self.endpoint(PREVIEW_PATH);
        set_query(&mut url, &[("image_path", image_path), ("rle", &rle_json), ("t", &nonce.to_string())]);
        url.into()
    }

    fn diagnostic_url(&self, image_path: &str, nonce: i64) -> String {
        let mut url = self.endpoint(DEBUG_PREVIEW_PATH);
        set_query(&mut url, &[("image_path", image_path), ("t", &nonce.to_string())]);
        url.into()
    }
}

/// Percent-encode query pairs with spaces as `%20`, never `+`.
fn set_query(url: &mut Url, pairs: &[(&str, &str)]) {
    url.query_pairs_mut().extend_pairs(pairs);
    // Form encoding escapes a literal `+` as `%2B`, so any `+` left is a space.
    let query = url.query().map(|q| q.replace('+', "%20"));
    url.set_query(query.as_deref());
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct PointPromptBody<'a> {
    image_path: &'a str,
    part_name: &'a str,
    positive_points: &'a [Point],
    negative_points: &'a [Point],
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_mask: Option<&'a Rle>,
    request_token: u64,
}

#[derive(Serialize)]
struct PolygonPromptBody<'a> {
    image_path: &'a str,
    part_name: &'a str,
    polygon_points: &'a [Point],
    request_token: u64,
}

#[derive(Serialize)]
struct RenderPreviewBody<'a> {
    image_path: &'a str,
    rle: &'a Rle,
}

#[derive(Serialize)]
struct SaveRegionBody<'a> {
    image_path: &'a str,
    part_name: &'a str,
    masks: &'a [SavedMask],
}

// =============================================================================
// PARSING
// =============================================================================

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Operator-facing text from an error body: `detail`, then `error`, then the
/// raw body itself (truncated).
fn error_detail(status: u16, body: &str) -> String {
    if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "error"] {
            match fields.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(Value::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }
    trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Parse a 2xx body, rejecting `{"success": false}` envelopes with their
/// error text.
fn parse_envelope(status: u16, body: &str) -> Result<Value, String> {
    if !is_success(status) {
        return Err(error_detail(status, body));
    }
    let value: Value = serde_json::from_str(body).map_err(|e| format!("malformed response: {e}"))?;
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(error_detail(status, body));
    }
    Ok(value)
}

/// The raw mask from a generation response. A missing mask comes back as
/// `Null` so the canonicalizer decides what it means.
fn parse_generation_response(status: u16, body: &str) -> Result<Value, AnnotatorError> {
    let mut envelope = parse_envelope(status, body).map_err(AnnotatorError::GenerationFailed)?;
    if let Some(rle) = envelope.get_mut("rle").map(Value::take) {
        return Ok(rle);
    }
    if envelope.get("counts").is_some() {
        return Ok(envelope);
    }
    Ok(envelope.get_mut("mask").map(Value::take).unwrap_or(Value::Null))
}

fn parse_render_response(status: u16, body: &str) -> Result<Option<EncodedImage>, AnnotatorError> {
    let envelope = parse_envelope(status, body).map_err(AnnotatorError::RenderFailed)?;
    let image = match envelope.get("base64_image").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(None),
    };
    if image.starts_with("data:") {
        Ok(Some(EncodedImage(image.to_string())))
    } else {
        Ok(Some(EncodedImage(format!("data:image/png;base64,{image}"))))
    }
}

fn parse_save_response(status: u16, body: &str) -> Result<(), AnnotatorError> {
    if !is_success(status) {
        return Err(AnnotatorError::PersistenceFailed { status: Some(status), detail: error_detail(status, body) });
    }
    // Some deployments answer with an empty 2xx body.
    if body.trim().is_empty() {
        return Ok(());
    }
    parse_envelope(status, body)
        .map(|_| ())
        .map_err(|detail| AnnotatorError::PersistenceFailed { status: Some(status), detail })
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
