use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde_json::json;

use super::*;
use crate::backend::PreviewUrls;
use crate::canvas::PointerButton;
use crate::collection::SavedMask;
use crate::geometry::Point;
use crate::preview::PreviewSource;
use crate::rle::Rle;

// =============================================================================
// Mock backend
// =============================================================================

type Scripted = (Duration, Result<Value, AnnotatorError>);

#[derive(Default)]
struct MockBackend {
    point_calls: Mutex<Vec<PointPromptRequest>>,
    polygon_calls: Mutex<Vec<PolygonPromptRequest>>,
    render_calls: Mutex<Vec<Rle>>,
    saves: Mutex<Vec<Vec<SavedMask>>>,
    generations: AtomicUsize,
    /// Generation answers in call order; unscripted calls answer `m<n>`
    /// after 10 ms.
    script: Mutex<VecDeque<Scripted>>,
    render_fails: AtomicBool,
    save_error: Mutex<Option<AnnotatorError>>,
}

impl MockBackend {
    fn script(&self, delay_ms: u64, result: Result<Value, AnnotatorError>) {
        self.script.lock().unwrap().push_back((Duration::from_millis(delay_ms), result));
    }

    fn point_calls(&self) -> Vec<PointPromptRequest> {
        self.point_calls.lock().unwrap().clone()
    }

    fn polygon_calls(&self) -> Vec<PolygonPromptRequest> {
        self.polygon_calls.lock().unwrap().clone()
    }

    fn render_calls(&self) -> Vec<Rle> {
        self.render_calls.lock().unwrap().clone()
    }

    async fn answer(&self) -> Result<Value, AnnotatorError> {
        let n = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.script.lock().unwrap().pop_front();
        let (delay, result) = scripted.unwrap_or_else(|| (Duration::from_millis(10), Ok(mask(&format!("m{n}")))));
        tokio::time::sleep(delay).await;
        result
    }
}

impl PreviewUrls for MockBackend {
    fn preview_url(&self, image_path: &str, rle: &Rle, nonce: i64) -> String {
        format!("mock://preview/{image_path}/{}?t={nonce}", rle.counts)
    }

    fn diagnostic_url(&self, image_path: &str, nonce: i64) -> String {
        format!("mock://debug/{image_path}?t={nonce}")
    }
}

#[async_trait::async_trait]
impl MaskBackend for MockBackend {
    async fn generate_from_points(&self, req: &PointPromptRequest) -> Result<Value, AnnotatorError> {
        self.point_calls.lock().unwrap().push(req.clone());
        self.answer().await
    }

    async fn generate_from_polygon(&self, req: &PolygonPromptRequest) -> Result<Value, AnnotatorError> {
        self.polygon_calls.lock().unwrap().push(req.clone());
        self.answer().await
    }

    async fn render_preview(&self, _image_path: &str, rle: &Rle) -> Result<Option<EncodedImage>, AnnotatorError> {
        self.render_calls.lock().unwrap().push(rle.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.render_fails.load(Ordering::SeqCst) {
            return Err(AnnotatorError::RenderFailed("renderer offline".into()));
        }
        Ok(Some(EncodedImage(format!("data:{}", rle.counts))))
    }

    async fn save_region_masks(
        &self,
        _image_path: &str,
        _region_id: &str,
        masks: &[SavedMask],
    ) -> Result<(), AnnotatorError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if let Some(err) = self.save_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.saves.lock().unwrap().push(masks.to_vec());
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// 800x600 image in a 400x300 viewport: display scale 0.5.
fn init(mode: EditMode, persisted: Vec<Value>) -> SessionInit {
    SessionInit {
        image_path: "birds/1.jpg".into(),
        image_size: ImageSize::new(800, 600),
        region_id: "wing".into(),
        viewport: ViewportSize { width: 400.0, height: 300.0 },
        mode,
        persisted,
    }
}

fn mask(counts: &str) -> Value {
    json!({ "counts": counts, "size": [600, 800] })
}

fn open(mode: EditMode, persisted: Vec<Value>) -> (Arc<MockBackend>, SessionHandle, JoinHandle<()>) {
    let backend = Arc::new(MockBackend::default());
    let (handle, task) = spawn_session(AnnotatorConfig::default(), backend.clone(), init(mode, persisted));
    (backend, handle, task)
}

fn primary(x: f64, y: f64) -> PointerEvent {
    PointerEvent { x, y, button: PointerButton::Primary }
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}

async fn click(handle: &SessionHandle, x: f64, y: f64) {
    handle.pointer(primary(x, y)).await.unwrap();
}

// =============================================================================
// Opening
// =============================================================================

#[tokio::test(start_paused = true)]
async fn opening_on_stored_mask_renders_it_without_generating() {
    let (backend, handle, _task) = open(EditMode::Points, vec![mask("abc")]);
    settle().await;

    let view = handle.snapshot().await.unwrap();
    assert!(view.candidates[0].is_existing);
    assert_eq!(view.preview.source, PreviewSource::Direct { image: "data:abc".into() });
    assert!(!view.preview.pending);
    assert!(view.saved);
    assert!(backend.point_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fresh_region_shows_nothing() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    settle().await;

    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.candidates.len(), 1);
    assert_eq!(view.preview.source, PreviewSource::None);
    assert!((view.scale - 0.5).abs() < f64::EPSILON);
    assert!(backend.render_calls().is_empty());
}

// =============================================================================
// Preview requests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn single_positive_point_issues_one_request() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;

    let calls = backend.point_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].positive, vec![Point::new(10, 10)]);
    assert!(calls[0].negative.is_empty());
    assert_eq!(calls[0].region_id, "wing");
    assert_eq!(calls[0].prior_mask, None);

    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.candidates[0].rle.as_ref().map(|r| r.counts.as_str()), Some("m1"));
    assert_eq!(view.preview.source, PreviewSource::Direct { image: "data:m1".into() });
    assert!(!view.preview.pending);
    assert!(!view.saved);
}

#[tokio::test(start_paused = true)]
async fn three_quick_vertices_issue_one_request() {
    let (backend, handle, _task) = open(EditMode::Polygon, vec![]);
    for (x, y) in [(10.0, 10.0), (200.0, 10.0), (200.0, 200.0)] {
        click(&handle, x, y).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    settle().await;

    let calls = backend.polygon_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].vertices, vec![Point::new(20, 20), Point::new(400, 20), Point::new(400, 400)]);
    assert!(backend.point_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_older_response_never_replaces_newer() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.script(1000, Ok(mask("old")));
    backend.script(10, Ok(mask("new")));

    click(&handle, 5.0, 5.0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    click(&handle, 100.0, 100.0).await;
    settle().await;

    assert_eq!(backend.point_calls().len(), 2);
    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.candidates[0].rle.as_ref().map(|r| r.counts.as_str()), Some("new"));
    assert_eq!(view.preview.source, PreviewSource::Direct { image: "data:new".into() });
}

#[tokio::test(start_paused = true)]
async fn second_request_sends_active_mask_as_prior() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;
    click(&handle, 100.0, 100.0).await;
    settle().await;

    let calls = backend.point_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].prior_mask.as_ref().map(|r| r.counts.as_str()), Some("m1"));
    assert!(calls[1].token > calls[0].token);
}

#[tokio::test(start_paused = true)]
async fn generation_failure_is_surfaced() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.script(10, Err(AnnotatorError::GenerationFailed("predictor not loaded".into())));
    click(&handle, 5.0, 5.0).await;
    settle().await;

    let view = handle.snapshot().await.unwrap();
    let notice = view.notice.unwrap();
    assert_eq!(notice.code, "E_GENERATION_FAILED");
    assert!(notice.retryable);
    assert!(view.candidates[0].rle.is_none());
}

#[tokio::test(start_paused = true)]
async fn hung_generation_times_out() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.script(60_000, Ok(mask("late")));
    click(&handle, 5.0, 5.0).await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.notice.map(|n| n.code), Some("E_GENERATION_FAILED"));
    assert!(!view.preview.pending);
}

#[tokio::test(start_paused = true)]
async fn failed_regeneration_clears_shown_preview() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;
    let shown = handle.snapshot().await.unwrap();
    assert_eq!(shown.preview.source, PreviewSource::Direct { image: "data:m1".into() });

    backend.script(10, Err(AnnotatorError::GenerationFailed("predictor not loaded".into())));
    click(&handle, 100.0, 100.0).await;
    settle().await;

    let view = handle.snapshot().await.unwrap();
    assert!(view.preview.token > shown.preview.token);
    assert_eq!(view.preview.source, PreviewSource::None);
    assert!(!view.preview.pending);
    assert_eq!(view.geometry.len(), 2);
    assert_eq!(view.notice.map(|n| n.code), Some("E_GENERATION_FAILED"));
    // The last good mask stays stored on the candidate.
    assert_eq!(view.candidates[0].rle.as_ref().map(|r| r.counts.as_str()), Some("m1"));
}

#[tokio::test(start_paused = true)]
async fn timed_out_regeneration_clears_shown_preview() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;

    backend.script(60_000, Ok(mask("late")));
    click(&handle, 100.0, 100.0).await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.preview.source, PreviewSource::None);
    assert!(!view.preview.pending);
    assert_eq!(view.notice.map(|n| n.code), Some("E_GENERATION_FAILED"));
}

#[tokio::test(start_paused = true)]
async fn invalid_generated_mask_stores_placeholder() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.script(10, Ok(json!({ "counts": "abc" })));
    click(&handle, 5.0, 5.0).await;
    settle().await;

    let view = handle.snapshot().await.unwrap();
    let active = &view.candidates[0];
    assert!(active.is_fallback);
    assert_eq!(active.rle, Some(Rle { counts: "0".into(), size: [600, 800] }));
    assert_eq!(view.preview.source, PreviewSource::None);
    assert!(backend.render_calls().is_empty());
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test(start_paused = true)]
async fn double_click_delete_refreshes_preview() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;
    click(&handle, 100.0, 100.0).await;
    settle().await;
    assert_eq!(backend.point_calls().len(), 2);

    click(&handle, 100.0, 100.0).await;
    click(&handle, 100.0, 100.0).await;
    settle().await;

    let calls = backend.point_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].positive, vec![Point::new(10, 10)]);
    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.selected, None);
    assert_eq!(view.geometry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn keyboard_delete_refreshes_preview() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;
    click(&handle, 100.0, 100.0).await;
    settle().await;

    click(&handle, 5.0, 5.0).await;
    handle.send(SessionCommand::DeleteSelected).await.unwrap();
    settle().await;

    let calls = backend.point_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].positive, vec![Point::new(200, 200)]);
}

#[tokio::test(start_paused = true)]
async fn removing_last_positive_point_clears_preview_but_keeps_mask() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;

    click(&handle, 5.0, 5.0).await;
    click(&handle, 5.0, 5.0).await;
    settle().await;

    assert_eq!(backend.point_calls().len(), 1);
    let view = handle.snapshot().await.unwrap();
    assert!(view.geometry.is_empty());
    assert_eq!(view.preview.source, PreviewSource::None);
    assert!(view.candidates[0].rle.is_some());
}

// =============================================================================
// Fallback cascade
// =============================================================================

#[tokio::test(start_paused = true)]
async fn render_failure_walks_fallback_stages() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.render_fails.store(true, Ordering::SeqCst);
    click(&handle, 5.0, 5.0).await;
    settle().await;

    let view = handle.snapshot().await.unwrap();
    let token = view.preview.token;
    let PreviewSource::Url { url } = &view.preview.source else {
        panic!("expected url stage, got {:?}", view.preview.source);
    };
    assert!(url.starts_with("mock://preview/birds/1.jpg/m1?t="));
    assert!(view.notice.is_none());

    handle.send(SessionCommand::PreviewFailed { token }).await.unwrap();
    let view = handle.snapshot().await.unwrap();
    assert!(matches!(view.preview.source, PreviewSource::Diagnostic { .. }));
    assert!(view.notice.is_none());

    handle.send(SessionCommand::PreviewFailed { token }).await.unwrap();
    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.preview.source, PreviewSource::None);
    assert_eq!(view.notice.map(|n| n.code), Some("E_RENDER_FAILED"));
}

#[tokio::test(start_paused = true)]
async fn unreported_fallback_stages_time_out() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.render_fails.store(true, Ordering::SeqCst);
    click(&handle, 5.0, 5.0).await;
    settle().await;
    assert!(matches!(handle.snapshot().await.unwrap().preview.source, PreviewSource::Url { .. }));

    // The surface never reports; each stage gets one request timeout.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let view = handle.snapshot().await.unwrap();
    assert!(matches!(view.preview.source, PreviewSource::Diagnostic { .. }));
    assert!(view.preview.pending);
    assert!(view.notice.is_none());

    tokio::time::sleep(Duration::from_secs(10)).await;
    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.preview.source, PreviewSource::None);
    assert!(!view.preview.pending);
    assert_eq!(view.notice.map(|n| n.code), Some("E_RENDER_FAILED"));
}

#[tokio::test(start_paused = true)]
async fn url_stage_settles_when_surface_loads_it() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.render_fails.store(true, Ordering::SeqCst);
    click(&handle, 5.0, 5.0).await;
    settle().await;

    let token = handle.snapshot().await.unwrap().preview.token;
    assert!(handle.snapshot().await.unwrap().preview.pending);
    handle.send(SessionCommand::PreviewLoaded { token }).await.unwrap();
    assert!(!handle.snapshot().await.unwrap().preview.pending);
}

// =============================================================================
// Mask collection
// =============================================================================

#[tokio::test(start_paused = true)]
async fn switching_masks_uses_stored_mask_and_fresh_prompts() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;

    handle.send(SessionCommand::AddMask).await.unwrap();
    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.active_index, 1);
    assert!(view.geometry.is_empty());
    assert_eq!(view.preview.source, PreviewSource::None);

    handle.send(SessionCommand::SelectMask(0)).await.unwrap();
    settle().await;
    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.preview.source, PreviewSource::Direct { image: "data:m1".into() });
    assert_eq!(backend.point_calls().len(), 1);
    assert_eq!(backend.render_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn mask_switch_discards_in_flight_generation() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    backend.script(500, Ok(mask("late")));
    click(&handle, 5.0, 5.0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.send(SessionCommand::AddMask).await.unwrap();
    settle().await;

    let view = handle.snapshot().await.unwrap();
    assert!(view.candidates.iter().all(|c| c.rle.is_none()));
}

#[tokio::test(start_paused = true)]
async fn deleting_only_mask_leaves_one_empty_candidate() {
    let (_backend, handle, _task) = open(EditMode::Points, vec![mask("abc")]);
    handle.send(SessionCommand::DeleteMask(0)).await.unwrap();

    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.candidates.len(), 1);
    assert_eq!(view.active_index, 0);
    assert!(view.candidates[0].rle.is_none());
    assert!(!view.saved);
}

#[tokio::test(start_paused = true)]
async fn out_of_range_mask_commands_keep_prompts() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;
    handle.save().await.unwrap();
    let before = handle.snapshot().await.unwrap();
    assert!(before.saved);

    handle.send(SessionCommand::DeleteMask(7)).await.unwrap();
    handle.send(SessionCommand::SelectMask(7)).await.unwrap();
    settle().await;

    let view = handle.snapshot().await.unwrap();
    assert!(view.saved);
    assert_eq!(view.geometry.len(), 1);
    assert_eq!(view.candidates, before.candidates);
    assert_eq!(view.preview, before.preview);
    assert_eq!(backend.render_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn mode_switch_starts_empty_shape() {
    let (_backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    handle.send(SessionCommand::SetMode(EditMode::Polygon)).await.unwrap();

    let view = handle.snapshot().await.unwrap();
    assert_eq!(view.mode, EditMode::Polygon);
    assert!(view.geometry.is_empty());
}

// =============================================================================
// Saving
// =============================================================================

#[tokio::test(start_paused = true)]
async fn save_failure_does_not_advance_state() {
    let (backend, handle, _task) = open(EditMode::Points, vec![]);
    click(&handle, 5.0, 5.0).await;
    settle().await;

    *backend.save_error.lock().unwrap() =
        Some(AnnotatorError::PersistenceFailed { status: Some(409), detail: "region locked".into() });
    let err = handle.save().await.unwrap_err();
    assert_eq!(err, AnnotatorError::PersistenceFailed { status: Some(409), detail: "region locked".into() });

    let view = handle.snapshot().await.unwrap();
    assert!(!view.saved);
    assert!(!view.candidates[0].is_existing);
    assert_eq!(view.notice.map(|n| n.message), Some("save failed: region locked".to_string()));

    *backend.save_error.lock().unwrap() = None;
    handle.save().await.unwrap();
    let view = handle.snapshot().await.unwrap();
    assert!(view.saved);
    assert!(view.candidates[0].is_existing);
    assert!(view.notice.is_none());

    let saves = backend.saves.lock().unwrap();
    assert_eq!(saves.len(), 1);
    assert_eq!(saves[0][0].rle.counts, "m1");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn closed_session_rejects_commands() {
    let (_backend, handle, task) = open(EditMode::Points, vec![]);
    handle.close().await.unwrap();
    task.await.unwrap();

    assert_eq!(handle.snapshot().await.unwrap_err(), AnnotatorError::SessionClosed);
}

#[tokio::test(start_paused = true)]
async fn watchers_see_published_view() {
    let (_backend, handle, _task) = open(EditMode::Points, vec![]);
    let mut rx = handle.subscribe();
    click(&handle, 5.0, 5.0).await;
    handle.snapshot().await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().geometry.len(), 1);
    assert_eq!(handle.view().geometry.len(), 1);
}
