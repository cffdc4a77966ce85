//! Preview request orchestrator: keeps the displayed preview in step with
//! the latest edit.
//!
//! DESIGN
//! ======
//! A per-session state machine with no I/O of its own. The session feeds it
//! edits and collaborator results; it answers with the requests to issue and
//! publishes a declarative [`PreviewSource`] for the display surface. Time is
//! passed in explicitly, so the debounce and immediate timers are plain
//! deadlines the session sleeps on.
//!
//! Ordering rests on one counter: every outbound request, and every logical
//! cancellation (mask switch, reset, shape no longer previewable), bumps the
//! token. A result is applied only while its token is still the highest
//! issued.
//!
//! EDGE CASES
//! ==========
//! - The immediate request and the debounce backstop share one snapshot. A
//!   debounced request whose geometry equals the last one issued is skipped,
//!   so a single click produces a single request.
//! - Render stages run one at a time per token: direct render, then the
//!   preview URL, then the diagnostic URL. Only a diagnostic failure is
//!   surfaced as an error.
//! - A URL stage the surface never reports on fails once the request
//!   timeout passes.
//! - A failed generation clears the preview; the previous image belongs to
//!   older geometry.
//! - Placeholder masks are stored but never rendered.

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{EncodedImage, PreviewUrls};
use crate::config::PreviewConfig;
use crate::error::AnnotatorError;
use crate::geometry::{Edit, Geometry, PointRef};
use crate::rle::{self, ImageSize, Rle};

// =============================================================================
// TYPES
// =============================================================================

/// What the display surface should show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreviewSource {
    None,
    /// A `data:` URI produced by the backend's direct render.
    Direct { image: String },
    /// Preview endpoint URL for the surface to fetch.
    Url { url: String },
    /// Image-only debug rendering, the last fallback.
    Diagnostic { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewView {
    /// Highest token issued so far.
    pub token: u64,
    pub source: PreviewSource,
    /// A request or render is still on its way, so `source` may be stale.
    pub pending: bool,
}

/// A generation request the session should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    pub token: u64,
    pub geometry: Geometry,
}

/// A direct render the session should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub token: u64,
    pub rle: Rle,
}

/// Outcome of a generation response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generated {
    /// Superseded by a newer token; ignore.
    Stale,
    /// Surface to the operator. Nothing is stored.
    Failed(AnnotatorError),
    /// Store `rle` on the active candidate, then run `render` if present.
    Apply { rle: Rle, render: Option<RenderRequest> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Direct,
    Url,
    Diagnostic,
}

#[derive(Debug, Clone)]
struct Cascade {
    token: u64,
    rle: Rle,
    stage: Stage,
    /// The current stage produced a visible image.
    settled: bool,
    /// When an unreported URL stage counts as failed. The direct stage is
    /// bounded by the session's call timeout instead.
    deadline: Option<Instant>,
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

#[derive(Debug, Clone)]
pub struct PreviewOrchestrator {
    config: PreviewConfig,
    image_path: String,
    dims: Option<ImageSize>,
    issued: u64,
    debounce_at: Option<Instant>,
    immediate_at: Option<Instant>,
    /// Snapshot both timers send.
    latest: Option<Geometry>,
    last_sent: Option<Geometry>,
    /// A generation request for `issued` has not answered yet.
    generating: bool,
    cascade: Option<Cascade>,
    source: PreviewSource,
}

impl PreviewOrchestrator {
    #[must_use]
    pub fn new(config: PreviewConfig, image_path: impl Into<String>, dims: Option<ImageSize>) -> Self {
        Self {
            config,
            image_path: image_path.into(),
            dims,
            issued: 0,
            debounce_at: None,
            immediate_at: None,
            latest: None,
            last_sent: None,
            generating: false,
            cascade: None,
            source: PreviewSource::None,
        }
    }

    #[must_use]
    pub fn token(&self) -> u64 {
        self.issued
    }

    #[must_use]
    pub fn source(&self) -> &PreviewSource {
        &self.source
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.debounce_at.is_some()
            || self.immediate_at.is_some()
            || self.generating
            || self.cascade.as_ref().is_some_and(|c| !c.settled)
    }

    #[must_use]
    pub fn view(&self) -> PreviewView {
        PreviewView { token: self.issued, source: self.source.clone(), pending: self.is_pending() }
    }

    /// Earliest timer the session must wake up for.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let stage_at = self.cascade.as_ref().filter(|c| !c.settled).and_then(|c| c.deadline);
        [self.immediate_at, self.debounce_at, stage_at].into_iter().flatten().min()
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Record an applied edit. `geometry` is the shape after the edit.
    pub fn on_edit(&mut self, geometry: &Geometry, edit: Edit, now: Instant) {
        if !geometry.is_previewable() {
            self.invalidate();
            return;
        }

        self.latest = Some(geometry.clone());
        // Replace, never stack.
        self.debounce_at = Some(now + self.config.debounce);
        if completes_shape(geometry, edit) {
            self.immediate_at = Some(now + self.config.immediate_delay);
        }
    }

    /// Fire whichever timers are due. Returns at most one request.
    pub fn poll(&mut self, now: Instant) -> Option<PreviewRequest> {
        let immediate_due = self.immediate_at.is_some_and(|at| at <= now);
        let debounce_due = self.debounce_at.is_some_and(|at| at <= now);
        if !immediate_due && !debounce_due {
            return None;
        }
        if immediate_due {
            self.immediate_at = None;
        }
        if debounce_due {
            self.debounce_at = None;
        }

        let geometry = self.latest.clone()?;
        if self.last_sent.as_ref() == Some(&geometry) {
            debug!(token = self.issued, "geometry unchanged since last request; skipping");
            return None;
        }

        self.issued += 1;
        self.generating = true;
        self.cascade = None;
        self.last_sent = Some(geometry.clone());
        info!(token = self.issued, points = geometry.len(), immediate = immediate_due, "preview requested");
        Some(PreviewRequest { token: self.issued, geometry })
    }

    /// Logically cancel everything in flight and clear the preview.
    pub fn invalidate(&mut self) {
        self.issued += 1;
        self.debounce_at = None;
        self.immediate_at = None;
        self.latest = None;
        self.last_sent = None;
        self.generating = false;
        self.cascade = None;
        self.source = PreviewSource::None;
        debug!(token = self.issued, "preview invalidated");
    }

    /// Replace the preview with a candidate's stored mask, e.g. after a mask
    /// switch. Placeholders and `None` clear the preview.
    pub fn show_stored(&mut self, rle: Option<&Rle>) -> Option<RenderRequest> {
        self.invalidate();
        let rle = rle.filter(|r| !r.is_placeholder())?;
        Some(self.begin_cascade(rle.clone()))
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    /// Handle a generation response for `token`.
    pub fn on_generated(&mut self, token: u64, result: Result<serde_json::Value, AnnotatorError>) -> Generated {
        if token != self.issued {
            debug!(token, current = self.issued, "dropping stale generation response");
            return Generated::Stale;
        }
        self.generating = false;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!(token, error = %e, "mask generation failed");
                self.source = PreviewSource::None;
                return Generated::Failed(e);
            }
        };

        let rle = match rle::canonicalize(&raw, self.dims) {
            Ok(rle) => rle,
            Err(e) => {
                warn!(token, error = %e, "generation returned unusable mask");
                self.source = PreviewSource::None;
                return Generated::Failed(e);
            }
        };

        if rle.is_placeholder() {
            info!(token, "generation returned no mask; storing placeholder");
            self.source = PreviewSource::None;
            return Generated::Apply { rle, render: None };
        }

        debug!(token, area = ?rle.foreground_area(), "applying generated mask");
        let render = self.begin_cascade(rle.clone());
        Generated::Apply { rle, render: Some(render) }
    }

    /// Handle the direct render for `token`. Failure, timeout or a missing
    /// image moves on to the preview URL.
    pub fn on_direct_rendered(
        &mut self,
        token: u64,
        result: Result<Option<EncodedImage>, AnnotatorError>,
        urls: &(impl PreviewUrls + ?Sized),
        nonce: i64,
        now: Instant,
    ) {
        if !self.is_current_stage(token, Stage::Direct) {
            debug!(token, "dropping stale render");
            return;
        }
        match result {
            Ok(Some(image)) => {
                self.source = PreviewSource::Direct { image: image.0 };
                self.settle();
            }
            Ok(None) => {
                debug!(token, "direct render returned no image");
                self.advance(urls, nonce, now);
            }
            Err(e) => {
                debug!(token, error = %e, "direct render failed");
                self.advance(urls, nonce, now);
            }
        }
    }

    /// The surface finished loading the current source.
    pub fn on_source_loaded(&mut self, token: u64) {
        if self.cascade.as_ref().is_some_and(|c| c.token == token && token == self.issued) {
            self.settle();
        }
    }

    /// The surface could not load the current source. Returns an error only
    /// once every stage has failed.
    pub fn on_source_failed(
        &mut self,
        token: u64,
        urls: &(impl PreviewUrls + ?Sized),
        nonce: i64,
        now: Instant,
    ) -> Option<AnnotatorError> {
        let stage = match self.cascade.as_ref() {
            Some(c) if c.token == token && token == self.issued => c.stage,
            _ => {
                debug!(token, "ignoring load failure for superseded preview");
                return None;
            }
        };

        if stage == Stage::Diagnostic {
            warn!(token, "diagnostic preview failed to load");
            self.cascade = None;
            self.source = PreviewSource::None;
            return Some(AnnotatorError::RenderFailed("every preview stage failed to load".into()));
        }
        self.advance(urls, nonce, now);
        None
    }

    /// Fail a URL stage the surface has not reported on in time. Returns an
    /// error when that was the last stage.
    pub fn expire_stage(
        &mut self,
        now: Instant,
        urls: &(impl PreviewUrls + ?Sized),
        nonce: i64,
    ) -> Option<AnnotatorError> {
        let cascade = self.cascade.as_ref().filter(|c| !c.settled)?;
        if !cascade.deadline.is_some_and(|at| at <= now) {
            return None;
        }
        let token = cascade.token;
        info!(token, stage = ?cascade.stage, "preview stage not reported in time");
        self.on_source_failed(token, urls, nonce, now)
    }

    fn begin_cascade(&mut self, rle: Rle) -> RenderRequest {
        self.cascade =
            Some(Cascade { token: self.issued, rle: rle.clone(), stage: Stage::Direct, settled: false, deadline: None });
        RenderRequest { token: self.issued, rle }
    }

    fn is_current_stage(&self, token: u64, stage: Stage) -> bool {
        token == self.issued && self.cascade.as_ref().is_some_and(|c| c.token == token && c.stage == stage)
    }

    fn settle(&mut self) {
        if let Some(cascade) = self.cascade.as_mut() {
            cascade.settled = true;
        }
    }

    fn advance(&mut self, urls: &(impl PreviewUrls + ?Sized), nonce: i64, now: Instant) {
        let Some(cascade) = self.cascade.as_mut() else {
            return;
        };
        cascade.settled = false;
        cascade.deadline = Some(now + self.config.request_timeout);
        let (stage, source) = match cascade.stage {
            Stage::Direct => {
                (Stage::Url, PreviewSource::Url { url: urls.preview_url(&self.image_path, &cascade.rle, nonce) })
            }
            Stage::Url | Stage::Diagnostic => {
                (Stage::Diagnostic, PreviewSource::Diagnostic { url: urls.diagnostic_url(&self.image_path, nonce) })
            }
        };
        cascade.stage = stage;
        info!(token = cascade.token, stage = ?stage, "preview fallback stage advanced");
        self.source = source;
    }
}

/// The edit that first makes a shape previewable: the first positive point
/// or the third polygon vertex.
fn completes_shape(geometry: &Geometry, edit: Edit) -> bool {
    match (edit, geometry) {
        (Edit::Added(PointRef::Positive(0)), Geometry::PointPrompt { positive, .. }) => positive.len() == 1,
        (Edit::Added(PointRef::Vertex(2)), Geometry::Polygon { vertices }) => vertices.len() == 3,
        _ => false,
    }
}

#[cfg(test)]
#[path = "preview_test.rs"]
mod tests;
