//! Chunked audio source.
//! The platform recorder only supports start / stop-and-save, so continuous
//! capture is approximated by back-to-back fixed-length takes. Every take
//! leaves a file artifact that is deleted as soon as it has been read.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{read_pcm16, AudioFrame};
use crate::error::CaptureError;

/// Identifies one in-flight take. Holding it means the recorder holds the
/// microphone; it is consumed by exactly one of `stop_take` / `abort_take`.
#[derive(Debug)]
pub struct TakeHandle {
    id: Uuid,
    started_at: Instant,
}

impl TakeHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for TakeHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform recorder adapter. All methods may block.
pub trait TakeRecorder: Send + Sync {
    /// Ask for microphone access. `Err(PermissionDenied)` is final.
    fn request_permission(&self) -> Result<(), CaptureError>;

    /// Claim the microphone and begin recording.
    fn start_take(&self) -> Result<TakeHandle, CaptureError>;

    /// Stop recording, release the microphone and return the saved artifact.
    /// The caller owns (and deletes) the artifact.
    fn stop_take(&self, take: TakeHandle) -> Result<PathBuf, CaptureError>;

    /// Stop recording, release the microphone and discard whatever was captured.
    fn abort_take(&self, take: TakeHandle);
}

/// Deletes the artifact when dropped, whatever happened while reading it.
struct TakeArtifact {
    path: PathBuf,
}

impl TakeArtifact {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TakeArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "take_artifact_deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "take_artifact_delete_failed"),
        }
    }
}

/// Records fixed-length takes and turns them into normalized frames.
pub struct ChunkedAudioSource {
    recorder: Arc<dyn TakeRecorder>,
    take_duration: Duration,
    grace: Duration,
}

impl ChunkedAudioSource {
    pub fn new(recorder: Arc<dyn TakeRecorder>, take_duration: Duration, grace: Duration) -> Self {
        Self {
            recorder,
            take_duration,
            grace,
        }
    }

    /// Blocking permission request, forwarded to the recorder.
    pub fn request_permission(&self) -> Result<(), CaptureError> {
        self.recorder.request_permission()
    }

    /// Record one take and decode it.
    ///
    /// Cancelling while the take is recording aborts it and returns
    /// `Cancelled`. Once the recording window has elapsed the take is always
    /// collected to completion, so the artifact is deleted and the microphone
    /// released before this returns. A collect that outlives the grace period
    /// is still awaited but reported as `Timeout`.
    pub async fn record_take(&self, cancel: &CancellationToken) -> Result<AudioFrame, CaptureError> {
        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }

        let recorder = Arc::clone(&self.recorder);
        let take = tokio::task::spawn_blocking(move || recorder.start_take())
            .await
            .map_err(|e| CaptureError::Interrupted(format!("start_take panicked: {e}")))??;
        debug!(take = %take.id(), "take_started");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(take = %take.id(), "take_aborted");
                let recorder = Arc::clone(&self.recorder);
                if let Err(e) = tokio::task::spawn_blocking(move || recorder.abort_take(take)).await {
                    warn!(error = %e, "abort_take_panicked");
                }
                return Err(CaptureError::Cancelled);
            }
            _ = tokio::time::sleep(self.take_duration) => {}
        }

        let recorder = Arc::clone(&self.recorder);
        let mut collect = tokio::task::spawn_blocking(move || {
            let artifact = TakeArtifact {
                path: recorder.stop_take(take)?,
            };
            read_pcm16(artifact.path())
        });

        let pcm = match tokio::time::timeout(self.grace, &mut collect).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(CaptureError::Interrupted(format!("stop_take panicked: {e}")));
            }
            Err(_) => {
                // The next take must not start while this one still holds the microphone.
                warn!(grace_ms = self.grace.as_millis() as u64, "take_collect_overran");
                let _ = collect.await;
                return Err(CaptureError::Timeout {
                    waited_ms: (self.take_duration + self.grace).as_millis() as u64,
                });
            }
        };

        if pcm.is_empty() {
            return Err(CaptureError::NoAudioCaptured);
        }
        Ok(AudioFrame::from_pcm16(&pcm))
    }
}
