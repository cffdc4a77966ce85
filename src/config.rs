//! Annotator configuration parsed from environment variables.
//!
//! Every knob has a default; missing or unparsable values fall back to it.
//! The only hard failure is a `CANVAS_MAX_UPSCALE` outside `(0, 1)`, since
//! images must never be upscaled.

use std::time::Duration;

use crate::error::ErrorCode;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PREVIEW_DEBOUNCE_MS: u64 = 400;
pub const DEFAULT_PREVIEW_IMMEDIATE_DELAY_MS: u64 = 50;
pub const DEFAULT_PREVIEW_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HIT_TOLERANCE_PX: f64 = 10.0;
pub const DEFAULT_DOUBLE_CLICK_MS: u64 = 300;
pub const DEFAULT_MAX_UPSCALE: f64 = 0.99;
pub const DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CANVAS_MAX_UPSCALE must be in (0, 1), got {0}")]
    InvalidMaxUpscale(f64),
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidMaxUpscale(_) => "E_CONFIG_PARSE",
        }
    }
}

// =============================================================================
// CONFIG TYPES
// =============================================================================

/// Timing for the preview request orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewConfig {
    /// Quiet period after the last edit before the trailing request goes out.
    pub debounce: Duration,
    /// Delay for the low-latency request fired when a shape becomes previewable.
    pub immediate_delay: Duration,
    /// Upper bound on a single generation or direct-render call.
    pub request_timeout: Duration,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_PREVIEW_DEBOUNCE_MS),
            immediate_delay: Duration::from_millis(DEFAULT_PREVIEW_IMMEDIATE_DELAY_MS),
            request_timeout: Duration::from_millis(DEFAULT_PREVIEW_TIMEOUT_MS),
        }
    }
}

/// Hit testing and click timing for the canvas controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasConfig {
    /// Hit radius in display pixels.
    pub hit_tolerance_px: f64,
    /// Two hits on the same point closer than this delete it.
    pub double_click: Duration,
    /// Upper bound on the display scale. Always below 1.
    pub max_upscale: f64,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            hit_tolerance_px: DEFAULT_HIT_TOLERANCE_PX,
            double_click: Duration::from_millis(DEFAULT_DOUBLE_CLICK_MS),
            max_upscale: DEFAULT_MAX_UPSCALE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatorConfig {
    pub backend_url: String,
    pub preview: PreviewConfig,
    pub canvas: CanvasConfig,
    pub timeouts: BackendTimeouts,
}

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            preview: PreviewConfig::default(),
            canvas: CanvasConfig::default(),
            timeouts: BackendTimeouts::default(),
        }
    }
}

impl AnnotatorConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `ANNOTATOR_BACKEND_URL`: default `http://127.0.0.1:8000`
    /// - `PREVIEW_DEBOUNCE_MS`: default 400
    /// - `PREVIEW_IMMEDIATE_DELAY_MS`: default 50
    /// - `PREVIEW_TIMEOUT_MS`: default 10000
    /// - `CANVAS_HIT_TOLERANCE_PX`: default 10
    /// - `CANVAS_DOUBLE_CLICK_MS`: default 300
    /// - `CANVAS_MAX_UPSCALE`: default 0.99
    /// - `BACKEND_REQUEST_TIMEOUT_SECS`: default 30
    /// - `BACKEND_CONNECT_TIMEOUT_SECS`: default 5
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMaxUpscale`] if the upscale bound would
    /// allow images to be enlarged.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_url = std::env::var("ANNOTATOR_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let preview = PreviewConfig {
            debounce: Duration::from_millis(env_parse("PREVIEW_DEBOUNCE_MS", DEFAULT_PREVIEW_DEBOUNCE_MS)),
            immediate_delay: Duration::from_millis(env_parse(
                "PREVIEW_IMMEDIATE_DELAY_MS",
                DEFAULT_PREVIEW_IMMEDIATE_DELAY_MS,
            )),
            request_timeout: Duration::from_millis(env_parse("PREVIEW_TIMEOUT_MS", DEFAULT_PREVIEW_TIMEOUT_MS)),
        };

        let max_upscale = env_parse("CANVAS_MAX_UPSCALE", DEFAULT_MAX_UPSCALE);
        if !(max_upscale > 0.0 && max_upscale < 1.0) {
            return Err(ConfigError::InvalidMaxUpscale(max_upscale));
        }
        let canvas = CanvasConfig {
            hit_tolerance_px: env_parse("CANVAS_HIT_TOLERANCE_PX", DEFAULT_HIT_TOLERANCE_PX),
            double_click: Duration::from_millis(env_parse("CANVAS_DOUBLE_CLICK_MS", DEFAULT_DOUBLE_CLICK_MS)),
            max_upscale,
        };

        let timeouts = BackendTimeouts {
            request_secs: env_parse("BACKEND_REQUEST_TIMEOUT_SECS", DEFAULT_BACKEND_REQUEST_TIMEOUT_SECS),
            connect_secs: env_parse("BACKEND_CONNECT_TIMEOUT_SECS", DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS),
        };

        Ok(Self { backend_url, preview, canvas, timeouts })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
