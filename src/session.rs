//! Annotation session: one editing session for one region of one image.
//!
//! DESIGN
//! ======
//! A single tokio task owns the geometry, canvas controller, mask collection
//! and preview orchestrator, so nothing is ever mutated from two places.
//! Callers talk to it through [`SessionHandle`]: commands go in over an mpsc
//! channel and state comes out as a [`SessionView`] on a watch channel.
//!
//! Collaborator calls run on a `JoinSet` and report back as completions
//! tagged with their token. The task's only suspension point is its
//! `select!`: the next command, the next preview deadline, or the next
//! completion.
//!
//! Selecting, adding, deleting or clearing a mask starts a fresh prompt set
//! and shows the newly active candidate's stored mask without generating.
//!
//! ERROR HANDLING
//! ==============
//! Collaborator failures become the view's `notice`. A failed save also
//! answers the caller with the error and leaves the collection untouched;
//! nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{EncodedImage, MaskBackend, PointPromptRequest, PolygonPromptRequest};
use crate::canvas::{CanvasController, PointerEvent, ViewportSize};
use crate::collection::{MaskCandidate, MaskCollection, now_ms};
use crate::config::AnnotatorConfig;
use crate::error::{AnnotatorError, Notice};
use crate::geometry::{Edit, EditMode, Geometry, PointRef};
use crate::preview::{Generated, PreviewOrchestrator, PreviewRequest, PreviewView, RenderRequest};
use crate::rle::ImageSize;

const COMMAND_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub image_path: String,
    pub image_size: ImageSize,
    pub region_id: String,
    pub viewport: ViewportSize,
    pub mode: EditMode,
    /// Masks already stored for the region, in any accepted RLE shape.
    pub persisted: Vec<Value>,
}

#[derive(Debug)]
pub enum SessionCommand {
    Pointer(PointerEvent),
    /// Keyboard delete of the selected point.
    DeleteSelected,
    SetMode(EditMode),
    ResetGeometry,
    Resize(ViewportSize),
    AddMask,
    DeleteMask(usize),
    ClearMask,
    SelectMask(usize),
    /// The surface displayed the preview for `token`.
    PreviewLoaded { token: u64 },
    /// The surface could not load the preview for `token`.
    PreviewFailed { token: u64 },
    /// Reply with the view once every earlier command has been applied.
    Snapshot(oneshot::Sender<SessionView>),
    Save(oneshot::Sender<Result<(), AnnotatorError>>),
    Close,
}

/// Published session state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub region_id: String,
    pub mode: EditMode,
    pub geometry: Geometry,
    pub selected: Option<PointRef>,
    pub scale: f64,
    pub candidates: Vec<MaskCandidate>,
    pub active_index: usize,
    pub preview: PreviewView,
    pub notice: Option<Notice>,
    /// No mask changed since the last successful save.
    pub saved: bool,
}

enum Completion {
    Generated { token: u64, result: Result<Value, AnnotatorError> },
    Rendered { token: u64, result: Result<Option<EncodedImage>, AnnotatorError> },
    Saved {
        revision: u64,
        ids: Vec<String>,
        result: Result<(), AnnotatorError>,
        reply: oneshot::Sender<Result<(), AnnotatorError>>,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    /// # Errors
    ///
    /// Returns [`AnnotatorError::SessionClosed`] if the session has stopped.
    pub async fn send(&self, cmd: SessionCommand) -> Result<(), AnnotatorError> {
        self.tx.send(cmd).await.map_err(|_| AnnotatorError::SessionClosed)
    }

    /// # Errors
    ///
    /// Returns [`AnnotatorError::SessionClosed`] if the session has stopped.
    pub async fn pointer(&self, event: PointerEvent) -> Result<(), AnnotatorError> {
        self.send(SessionCommand::Pointer(event)).await
    }

    /// The view after every command sent so far has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`AnnotatorError::SessionClosed`] if the session has stopped.
    pub async fn snapshot(&self) -> Result<SessionView, AnnotatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| AnnotatorError::SessionClosed)
    }

    /// Persist every generated mask of the region.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`AnnotatorError::PersistenceFailed`], or
    /// [`AnnotatorError::SessionClosed`] if the session stopped first.
    pub async fn save(&self) -> Result<(), AnnotatorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Save(tx)).await?;
        rx.await.map_err(|_| AnnotatorError::SessionClosed)?
    }

    /// # Errors
    ///
    /// Returns [`AnnotatorError::SessionClosed`] if the session already stopped.
    pub async fn close(&self) -> Result<(), AnnotatorError> {
        self.send(SessionCommand::Close).await
    }

    /// Latest published view.
    #[must_use]
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }
}

/// Start a session task. The join handle resolves when the session closes.
#[must_use]
pub fn spawn_session(
    config: AnnotatorConfig,
    backend: Arc<dyn MaskBackend>,
    init: SessionInit,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let session = Session::new(config, backend, init);
    let (view_tx, view_rx) = watch::channel(session.view());
    let task = tokio::spawn(session.run(rx, view_tx));
    (SessionHandle { tx, view: view_rx }, task)
}

// =============================================================================
// SESSION TASK
// =============================================================================

struct Session {
    config: AnnotatorConfig,
    backend: Arc<dyn MaskBackend>,
    image_path: String,
    geometry: Geometry,
    canvas: CanvasController,
    collection: MaskCollection,
    preview: PreviewOrchestrator,
    notice: Option<Notice>,
    /// Bumped on every collection change; a save only counts for the
    /// revision it sent.
    revision: u64,
    saved_revision: u64,
    tasks: JoinSet<Completion>,
}

impl Session {
    fn new(config: AnnotatorConfig, backend: Arc<dyn MaskBackend>, init: SessionInit) -> Self {
        let collection = MaskCollection::from_persisted(init.region_id, &init.persisted, Some(init.image_size));
        Self {
            canvas: CanvasController::new(config.canvas, init.image_size, init.viewport),
            preview: PreviewOrchestrator::new(config.preview, init.image_path.clone(), Some(init.image_size)),
            geometry: Geometry::new(init.mode),
            image_path: init.image_path,
            collection,
            config,
            backend,
            notice: None,
            revision: 0,
            saved_revision: 0,
            tasks: JoinSet::new(),
        }
    }

    fn view(&self) -> SessionView {
        SessionView {
            region_id: self.collection.region_id().to_string(),
            mode: self.geometry.mode(),
            geometry: self.geometry.clone(),
            selected: self.canvas.selected(),
            scale: self.canvas.scale(),
            candidates: self.collection.candidates().to_vec(),
            active_index: self.collection.active_index(),
            preview: self.preview.view(),
            notice: self.notice.clone(),
            saved: self.revision == self.saved_revision,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>, view_tx: watch::Sender<SessionView>) {
        info!(
            region_id = %self.collection.region_id(),
            image_path = %self.image_path,
            candidates = self.collection.len(),
            "annotation session opened"
        );
        self.show_active();
        publish(&view_tx, self.view());

        loop {
            let deadline = self.preview.next_deadline();
            tokio::select! {
                maybe_cmd = rx.recv() => {
                    let Some(cmd) = maybe_cmd else {
                        break;
                    };
                    if !self.handle_command(cmd) {
                        break;
                    }
                }
                () = sleep_until(deadline) => {
                    let now = Instant::now();
                    if let Some(err) = self.preview.expire_stage(now, &*self.backend, now_ms()) {
                        self.surface(err);
                    }
                    if let Some(request) = self.preview.poll(now) {
                        self.spawn_generate(request);
                    }
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok(completion) => self.handle_completion(completion),
                        Err(e) => warn!(error = %e, "collaborator task failed"),
                    }
                }
            }
            publish(&view_tx, self.view());
        }

        info!(region_id = %self.collection.region_id(), "annotation session closed");
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Apply one command. Returns `false` when the session should stop.
    fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Pointer(event) => {
                let action = self.canvas.handle_pointer(&mut self.geometry, event, Instant::now());
                debug!(?action, "pointer");
                if let Some(edit) = action.edit() {
                    self.edited(edit);
                }
            }
            SessionCommand::DeleteSelected => {
                if let Some(edit) = self.canvas.delete_selected(&mut self.geometry) {
                    self.edited(edit);
                }
            }
            SessionCommand::SetMode(mode) => {
                if mode != self.geometry.mode() {
                    self.geometry = Geometry::new(mode);
                    self.restart_prompts();
                }
            }
            SessionCommand::ResetGeometry => self.restart_prompts(),
            SessionCommand::Resize(viewport) => self.canvas.resize(viewport),
            SessionCommand::AddMask => {
                self.collection.add_empty();
                self.collection_changed();
                self.restart_prompts();
            }
            SessionCommand::DeleteMask(index) => {
                if self.collection.delete(index) {
                    self.collection_changed();
                    self.restart_prompts();
                }
            }
            SessionCommand::ClearMask => {
                self.collection.clear_active();
                self.collection_changed();
                self.restart_prompts();
            }
            SessionCommand::SelectMask(index) => {
                if self.collection.set_active(index).is_some() {
                    self.restart_prompts();
                }
            }
            SessionCommand::PreviewLoaded { token } => self.preview.on_source_loaded(token),
            SessionCommand::PreviewFailed { token } => {
                if let Some(err) = self.preview.on_source_failed(token, &*self.backend, now_ms(), Instant::now()) {
                    self.surface(err);
                }
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.view());
            }
            SessionCommand::Save(reply) => self.spawn_save(reply),
            SessionCommand::Close => return false,
        }
        true
    }

    fn edited(&mut self, edit: Edit) {
        self.preview.on_edit(&self.geometry, edit, Instant::now());
    }

    fn collection_changed(&mut self) {
        self.revision += 1;
    }

    /// Start an empty prompt set in the current mode and show the active
    /// candidate's stored mask.
    fn restart_prompts(&mut self) {
        self.geometry.reset();
        self.canvas.clear();
        self.show_active();
    }

    fn show_active(&mut self) {
        let stored = self.collection.active().rle.clone();
        if let Some(render) = self.preview.show_stored(stored.as_ref()) {
            self.spawn_render(render);
        }
    }

    fn surface(&mut self, err: AnnotatorError) {
        self.notice = Some(Notice::from_error(&err));
    }

    // -------------------------------------------------------------------------
    // Completions
    // -------------------------------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Generated { token, result } => match self.preview.on_generated(token, result) {
                Generated::Stale => {}
                Generated::Failed(err) => self.surface(err),
                Generated::Apply { rle, render } => {
                    info!(
                        token,
                        region_id = %self.collection.region_id(),
                        placeholder = rle.is_placeholder(),
                        "mask applied to active candidate"
                    );
                    self.collection.replace_active(rle);
                    self.collection_changed();
                    self.notice = None;
                    if let Some(render) = render {
                        self.spawn_render(render);
                    }
                }
            },
            Completion::Rendered { token, result } => {
                self.preview.on_direct_rendered(token, result, &*self.backend, now_ms(), Instant::now());
            }
            Completion::Saved { revision, ids, result, reply } => {
                match &result {
                    Ok(()) => {
                        info!(region_id = %self.collection.region_id(), masks = ids.len(), "region masks saved");
                        self.collection.mark_existing(&ids);
                        self.saved_revision = self.saved_revision.max(revision);
                        self.notice = None;
                    }
                    Err(e) => {
                        warn!(region_id = %self.collection.region_id(), error = %e, "saving region masks failed");
                        self.surface(e.clone());
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Collaborator calls
    // -------------------------------------------------------------------------

    fn spawn_generate(&mut self, request: PreviewRequest) {
        let backend = Arc::clone(&self.backend);
        let limit = self.config.preview.request_timeout;
        let token = request.token;
        let image_path = self.image_path.clone();
        let region_id = self.collection.region_id().to_string();

        match request.geometry {
            Geometry::PointPrompt { positive, negative } => {
                let prior_mask = self.collection.active().rle.clone().filter(|r| !r.is_placeholder());
                let req = PointPromptRequest { image_path, region_id, positive, negative, prior_mask, token };
                self.tasks.spawn(async move {
                    let result = tokio::time::timeout(limit, backend.generate_from_points(&req))
                        .await
                        .unwrap_or_else(|_| Err(timed_out(limit)));
                    Completion::Generated { token, result }
                });
            }
            Geometry::Polygon { vertices } => {
                let req = PolygonPromptRequest { image_path, region_id, vertices, token };
                self.tasks.spawn(async move {
                    let result = tokio::time::timeout(limit, backend.generate_from_polygon(&req))
                        .await
                        .unwrap_or_else(|_| Err(timed_out(limit)));
                    Completion::Generated { token, result }
                });
            }
        }
    }

    fn spawn_render(&mut self, render: RenderRequest) {
        let backend = Arc::clone(&self.backend);
        let limit = self.config.preview.request_timeout;
        let image_path = self.image_path.clone();
        let RenderRequest { token, rle } = render;
        self.tasks.spawn(async move {
            let result = tokio::time::timeout(limit, backend.render_preview(&image_path, &rle))
                .await
                .unwrap_or_else(|_| {
                    Err(AnnotatorError::RenderFailed(format!("no image within {}ms", limit.as_millis())))
                });
            Completion::Rendered { token, result }
        });
    }

    fn spawn_save(&mut self, reply: oneshot::Sender<Result<(), AnnotatorError>>) {
        let backend = Arc::clone(&self.backend);
        let image_path = self.image_path.clone();
        let region_id = self.collection.region_id().to_string();
        let masks = self.collection.to_saved();
        let ids: Vec<String> = masks.iter().map(|m| m.id.clone()).collect();
        let revision = self.revision;
        info!(region_id = %region_id, masks = masks.len(), revision, "saving region masks");

        self.tasks.spawn(async move {
            let result = backend.save_region_masks(&image_path, &region_id, &masks).await;
            Completion::Saved { revision, ids, result, reply }
        });
    }
}

fn timed_out(limit: Duration) -> AnnotatorError {
    AnnotatorError::GenerationFailed(format!("no response within {}ms", limit.as_millis()))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Publish only real changes so watchers are not woken for nothing.
fn publish(view_tx: &watch::Sender<SessionView>, next: SessionView) {
    view_tx.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
