use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mask_annotator::backend::http::HttpMaskBackend;
use mask_annotator::canvas::{PointerButton, PointerEvent, ViewportSize};
use mask_annotator::config::{AnnotatorConfig, ConfigError};
use mask_annotator::error::AnnotatorError;
use mask_annotator::geometry::EditMode;
use mask_annotator::preview::PreviewSource;
use mask_annotator::rle::{self, ImageSize};
use mask_annotator::session::{SessionCommand, SessionHandle, SessionInit, spawn_session};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

/// Upper bound on waiting for a preview to settle after each step.
const SETTLE_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Annotator(#[from] AnnotatorError),
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "mask-annotator", about = "Replay and inspect mask annotation sessions")]
struct Cli {
    #[arg(long, env = "ANNOTATOR_BACKEND_URL")]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted session against the backend and print the final view.
    Replay { script: PathBuf },
    /// Print the canonical form of a mask payload.
    Canonicalize {
        mask: PathBuf,
        #[arg(long, requires = "height")]
        width: Option<u32>,
        #[arg(long, requires = "width")]
        height: Option<u32>,
    },
}

// =============================================================================
// REPLAY SCRIPT
// =============================================================================

#[derive(Deserialize, Debug)]
struct ReplayScript {
    image_path: String,
    image_size: ImageSize,
    region_id: String,
    viewport: ViewportSize,
    #[serde(default = "default_mode")]
    mode: EditMode,
    #[serde(default)]
    persisted: Vec<Value>,
    steps: Vec<Step>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    Pointer {
        x: f64,
        y: f64,
        #[serde(default = "default_button")]
        button: PointerButton,
    },
    /// Let timers and collaborator calls run, then settle the preview.
    Wait { ms: u64 },
    DeleteSelected,
    SetMode { mode: EditMode },
    Reset,
    Resize { width: f64, height: f64 },
    AddMask,
    DeleteMask { index: usize },
    ClearMask,
    SelectMask { index: usize },
    Save,
}

fn default_mode() -> EditMode {
    EditMode::Points
}

fn default_button() -> PointerButton {
    PointerButton::Primary
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), CliError> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let mut config = AnnotatorConfig::from_env()?;
    if let Some(url) = cli.backend_url {
        config.backend_url = url.trim_end_matches('/').to_string();
    }

    match cli.command {
        Command::Replay { script } => run_replay(config, &script).await,
        Command::Canonicalize { mask, width, height } => {
            let dims = width.zip(height).map(|(w, h)| ImageSize::new(w, h));
            run_canonicalize(&mask, dims)
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Read { path: path.to_path_buf(), source })?;
    Ok(serde_json::from_str(&text)?)
}

fn run_canonicalize(path: &Path, dims: Option<ImageSize>) -> Result<(), CliError> {
    let raw: Value = read_json(path)?;
    let rle = rle::canonicalize(&raw, dims)?;
    info!(placeholder = rle.is_placeholder(), area = ?rle.foreground_area(), "mask canonicalized");
    println!("{}", serde_json::to_string_pretty(&rle)?);
    Ok(())
}

async fn run_replay(config: AnnotatorConfig, path: &Path) -> Result<(), CliError> {
    let script: ReplayScript = read_json(path)?;
    let backend = Arc::new(HttpMaskBackend::from_config(&config)?);
    let probe = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeouts.request_secs))
        .build()
        .map_err(|e| AnnotatorError::HttpClientBuild(e.to_string()))?;

    info!(backend_url = %config.backend_url, steps = script.steps.len(), "replaying session");
    let init = SessionInit {
        image_path: script.image_path,
        image_size: script.image_size,
        region_id: script.region_id,
        viewport: script.viewport,
        mode: script.mode,
        persisted: script.persisted,
    };
    let (handle, task) = spawn_session(config, backend, init);
    settle(&handle, &probe).await?;

    for step in script.steps {
        let cmd = match step {
            Step::Pointer { x, y, button } => SessionCommand::Pointer(PointerEvent { x, y, button }),
            Step::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                settle(&handle, &probe).await?;
                continue;
            }
            Step::DeleteSelected => SessionCommand::DeleteSelected,
            Step::SetMode { mode } => SessionCommand::SetMode(mode),
            Step::Reset => SessionCommand::ResetGeometry,
            Step::Resize { width, height } => SessionCommand::Resize(ViewportSize { width, height }),
            Step::AddMask => SessionCommand::AddMask,
            Step::DeleteMask { index } => SessionCommand::DeleteMask(index),
            Step::ClearMask => SessionCommand::ClearMask,
            Step::SelectMask { index } => SessionCommand::SelectMask(index),
            Step::Save => {
                // A failed save is reported in the view's notice.
                if let Err(e) = handle.save().await {
                    warn!(error = %e, "save step failed");
                }
                continue;
            }
        };
        handle.send(cmd).await?;
    }

    settle(&handle, &probe).await?;
    let view = handle.snapshot().await?;
    handle.close().await?;
    if let Err(e) = task.await {
        warn!(error = %e, "session task ended abnormally");
    }

    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Stand in for a display surface: wait until the preview stops pending,
/// loading URL-stage sources and reporting whether they loaded.
async fn settle(handle: &SessionHandle, probe: &reqwest::Client) -> Result<(), CliError> {
    let deadline = Instant::now() + SETTLE_LIMIT;
    let mut rx = handle.subscribe();
    let mut probed: Option<String> = None;
    loop {
        let view = handle.snapshot().await?;
        if !view.preview.pending {
            return Ok(());
        }

        if let PreviewSource::Url { url } | PreviewSource::Diagnostic { url } = &view.preview.source {
            // Already reported means it is pending on something else.
            if probed.as_ref() != Some(url) {
                probed = Some(url.clone());
                let token = view.preview.token;
                let loaded = probe.get(url).send().await.is_ok_and(|r| r.status().is_success());
                info!(token, loaded, "preview url probed");
                let cmd = if loaded {
                    SessionCommand::PreviewLoaded { token }
                } else {
                    SessionCommand::PreviewFailed { token }
                };
                handle.send(cmd).await?;
                continue;
            }
        }

        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(AnnotatorError::SessionClosed.into()),
            Err(_) => {
                warn!("preview still pending; continuing");
                return Ok(());
            }
        }
    }
}
