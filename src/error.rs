//! Error taxonomy for the wake engine.
//! Capture and inference errors stay local to their stage; `EngineError`
//! is what reaches `WakeListener::on_error`.

use std::path::PathBuf;

use thiserror::Error;

/// Failures of a single recording take.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("take produced no audio")]
    NoAudioCaptured,
    #[error("take interrupted: {0}")]
    Interrupted(String),
    #[error("take did not produce an artifact within {waited_ms}ms")]
    Timeout { waited_ms: u64 },
    #[error("take cancelled")]
    Cancelled,
    #[error("unsupported take format: {0}")]
    UnsupportedFormat(String),
    #[error("input device unusable: {0}")]
    UnsupportedDevice(String),
    #[error("artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("take io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Whether the listening loop should retry after this failure.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            CaptureError::PermissionDenied
                | CaptureError::Cancelled
                | CaptureError::UnsupportedDevice(_)
        )
    }
}

/// Failures of a single inference call.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{stage}: expected {expected} output values, got {got}")]
    OutputShape {
        stage: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{stage}: input shape: {source}")]
    InputShape {
        stage: &'static str,
        #[source]
        source: ndarray::ShapeError,
    },
    #[error("{stage}: non-finite score {score}")]
    NonFiniteScore { stage: &'static str, score: f32 },
    #[error("{stage}: empty output")]
    EmptyOutput { stage: &'static str },
    #[error("inference backend: {0}")]
    Backend(String),
}

/// Fatal conditions reported to the host.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("wake models unavailable: {0}")]
    ModelUnavailable(String),
    #[error("microphone cannot be used: {0}")]
    CaptureUnavailable(CaptureError),
    #[error("capture failed {attempts} times in a row: {last}")]
    RetryCeilingExceeded { attempts: u32, last: CaptureError },
    #[error("listening worker lost: {0}")]
    WorkerLost(String),
}

/// Failures loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("sensitivity {0} outside [0, 1]")]
    Sensitivity(f32),
}
