//! Lifecycle controller.
//! Owns the pipeline state, the model sessions and the single listening
//! worker. The worker records a take, runs it through the pipeline, then
//! schedules the next take; nothing runs in parallel inside a session.
//!
//! Control operations (start/stop/lifecycle/config) are serialized by an
//! async mutex. Callbacks from the worker are dispatched under `dispatch`,
//! the same lock cancellation takes, so a cancelled session can never
//! deliver a late callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audio::{ChunkedAudioSource, TakeRecorder};
use crate::cancellation::{SessionGeneration, SessionGuard};
use crate::config::{EngineTuning, WakeConfig};
use crate::error::{CaptureError, EngineError};
use crate::inference::ModelProvider;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::pipeline::WakePipeline;
use crate::state_machine::{PipelineState, StateMachine};

/// Host-side receiver of engine outcomes. Called from the worker task;
/// implementations must not block for long.
pub trait WakeListener: Send + Sync {
    fn on_detected(&self, score: f32);
    fn on_error(&self, error: &EngineError);
}

/// Host application visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

struct Shared {
    state: StateMachine,
    config: RwLock<WakeConfig>,
    tuning: EngineTuning,
    source: ChunkedAudioSource,
    provider: Arc<dyn ModelProvider>,
    listener: Arc<dyn WakeListener>,
    generations: SessionGeneration,
    dispatch: Mutex<()>,
    metrics: Arc<MetricsRegistry>,
    models_ready: AtomicBool,
    permission_granted: AtomicBool,
    foreground: AtomicBool,
}

impl Shared {
    /// End the session from inside the worker: release the sessions, report,
    /// and move to `next`. If the controller already cancelled the session the
    /// pipeline is handed back untouched so the controller decides its fate.
    fn end_session(
        &self,
        guard: &SessionGuard,
        pipeline: WakePipeline,
        next: PipelineState,
        error: Option<EngineError>,
    ) -> Option<WakePipeline> {
        let _gate = self.dispatch.lock();
        if !guard.should_continue() {
            return Some(pipeline);
        }
        drop(pipeline);
        self.generations.invalidate();
        self.models_ready.store(false, Ordering::SeqCst);
        if let Some(err) = &error {
            error!(error = %err, "listening_session_failed");
            self.listener.on_error(err);
        }
        let _ = self.state.transition(next);
        None
    }
}

enum Session {
    Running(JoinHandle<Option<WakePipeline>>),
    Parked(WakePipeline),
}

/// The wake-word engine: wraps the chunked source and pipeline in the
/// Idle / Loading / Listening / Suspended / Error lifecycle.
pub struct WakeEngine {
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl WakeEngine {
    pub fn new(
        config: WakeConfig,
        tuning: EngineTuning,
        recorder: Arc<dyn TakeRecorder>,
        provider: Arc<dyn ModelProvider>,
        listener: Arc<dyn WakeListener>,
    ) -> Self {
        let source = ChunkedAudioSource::new(recorder, tuning.take_duration, tuning.take_grace);
        Self {
            shared: Arc::new(Shared {
                state: StateMachine::new(),
                config: RwLock::new(sanitize(config)),
                tuning,
                source,
                provider,
                listener,
                generations: SessionGeneration::new(),
                dispatch: Mutex::new(()),
                metrics: Arc::new(MetricsRegistry::new()),
                models_ready: AtomicBool::new(false),
                permission_granted: AtomicBool::new(false),
                foreground: AtomicBool::new(true),
            }),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.current()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == PipelineState::Listening
    }

    /// True while the three model sessions are held.
    pub fn models_ready(&self) -> bool {
        self.shared.models_ready.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> WakeConfig {
        *self.shared.config.read()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.shared.metrics
    }

    /// Start listening. No-op while already Loading, Listening or Suspended,
    /// or while disabled. From `Error` this is the explicit retry.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        self.start_locked(&mut *session).await
    }

    async fn start_locked(&self, session: &mut Option<Session>) -> Result<(), EngineError> {
        let state = self.shared.state.current();
        if !matches!(state, PipelineState::Idle | PipelineState::Error) {
            debug!(state = %state, "start_ignored");
            return Ok(());
        }
        if !self.shared.config.read().enabled {
            info!("start_ignored_disabled");
            return Ok(());
        }

        // A worker that ended itself (one-shot detection, fatal error) is still parked here.
        self.release(session).await;

        if !self.shared.permission_granted.load(Ordering::SeqCst) {
            let shared = Arc::clone(&self.shared);
            let permission = tokio::task::spawn_blocking(move || shared.source.request_permission()).await;
            match permission {
                Ok(Ok(())) => {
                    self.shared.permission_granted.store(true, Ordering::SeqCst);
                }
                Ok(Err(e @ CaptureError::UnsupportedDevice(_))) => {
                    error!(error = %e, "microphone_unusable");
                    return Err(self.fail_start(PipelineState::Idle, EngineError::CaptureUnavailable(e)));
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "microphone_permission_denied");
                    return Err(self.fail_start(PipelineState::Idle, EngineError::PermissionDenied));
                }
                Err(e) => {
                    error!(error = %e, "permission request panicked");
                    return Err(self.fail_start(PipelineState::Idle, EngineError::PermissionDenied));
                }
            }
        }

        let _ = self.shared.state.transition(PipelineState::Loading);
        let span = self.shared.metrics.span(metric_names::MODEL_LOAD);
        let provider = Arc::clone(&self.shared.provider);
        let models = match tokio::task::spawn_blocking(move || provider.load()).await {
            Ok(Ok(models)) => models,
            Ok(Err(e)) => {
                return Err(self.fail_start(PipelineState::Error, EngineError::ModelUnavailable(e.to_string())));
            }
            Err(e) => {
                return Err(self.fail_start(PipelineState::Error, EngineError::ModelUnavailable(e.to_string())));
            }
        };
        let load_us = span.finish();
        info!(load_us, "models_ready");

        let pipeline = WakePipeline::new(models, &self.shared.tuning, Arc::clone(&self.shared.metrics));
        self.shared.models_ready.store(true, Ordering::SeqCst);

        if !self.shared.foreground.load(Ordering::SeqCst) {
            let _ = self.shared.state.transition(PipelineState::Suspended);
            *session = Some(Session::Parked(pipeline));
            return Ok(());
        }

        let _ = self.shared.state.transition(PipelineState::Listening);
        *session = Some(self.spawn_worker(pipeline));
        Ok(())
    }

    fn fail_start(&self, next: PipelineState, err: EngineError) -> EngineError {
        if self.shared.state.current() != next {
            let _ = self.shared.state.transition(next);
        }
        self.shared.listener.on_error(&err);
        err
    }

    /// Stop listening: abort any in-flight take, release the model sessions
    /// and reset the windows before returning.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        self.stop_locked(&mut *session).await;
    }

    async fn stop_locked(&self, session: &mut Option<Session>) {
        self.release(session).await;
        if self.shared.state.current() != PipelineState::Idle {
            let _ = self.shared.state.transition(PipelineState::Idle);
        }
    }

    /// App teardown. Same guarantees as `stop`.
    pub async fn shutdown(&self) {
        self.stop().await;
        info!("wake_engine_shutdown");
    }

    /// Cancel the worker (if any), wait for it, and drop the model sessions.
    async fn release(&self, session: &mut Option<Session>) {
        {
            let _gate = self.shared.dispatch.lock();
            self.shared.generations.invalidate();
        }
        match session.take() {
            Some(Session::Running(handle)) => match handle.await {
                Ok(pipeline) => drop(pipeline),
                Err(e) => error!(error = %e, "listening worker panicked"),
            },
            Some(Session::Parked(pipeline)) => drop(pipeline),
            None => {}
        }
        self.shared.models_ready.store(false, Ordering::SeqCst);
    }

    /// Host foreground/background signal.
    pub async fn on_lifecycle(&self, event: AppLifecycle) {
        let mut session = self.session.lock().await;
        match event {
            AppLifecycle::Background => {
                self.shared.foreground.store(false, Ordering::SeqCst);
                if self.shared.state.current() != PipelineState::Listening {
                    return;
                }
                {
                    let _gate = self.shared.dispatch.lock();
                    self.shared.generations.invalidate();
                }
                let pipeline = match session.take() {
                    Some(Session::Running(handle)) => handle.await.unwrap_or_else(|e| {
                        error!(error = %e, "listening worker panicked");
                        None
                    }),
                    Some(Session::Parked(pipeline)) => Some(pipeline),
                    None => None,
                };
                match pipeline {
                    Some(mut pipeline) => {
                        pipeline.reset();
                        *session = Some(Session::Parked(pipeline));
                        let _ = self.shared.state.transition(PipelineState::Suspended);
                    }
                    // The worker ended on its own just before; its transition stands
                    // unless it lost the pipeline mid-flight.
                    None => {
                        self.shared.models_ready.store(false, Ordering::SeqCst);
                        if self.shared.state.current() == PipelineState::Listening {
                            let _ = self.shared.state.transition(PipelineState::Idle);
                        }
                    }
                }
            }
            AppLifecycle::Foreground => {
                self.shared.foreground.store(true, Ordering::SeqCst);
                if self.shared.state.current() != PipelineState::Suspended {
                    return;
                }
                let enabled = self.shared.config.read().enabled;
                match session.take() {
                    Some(Session::Parked(pipeline)) if enabled => {
                        let _ = self.shared.state.transition(PipelineState::Listening);
                        *session = Some(self.spawn_worker(pipeline));
                    }
                    other => {
                        *session = other;
                        self.stop_locked(&mut *session).await;
                    }
                }
            }
        }
    }

    /// Replace the configuration. Sensitivity applies from the next chunk;
    /// flipping `enabled` starts or stops the engine.
    pub async fn update_config(&self, config: WakeConfig) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        let config = sanitize(config);
        let previous = std::mem::replace(&mut *self.shared.config.write(), config);
        info!(
            enabled = config.enabled,
            sensitivity = config.sensitivity,
            continuous = config.continuous_mode,
            "config_updated"
        );
        match (previous.enabled, config.enabled) {
            (true, false) => {
                self.stop_locked(&mut *session).await;
                Ok(())
            }
            (false, true) => self.start_locked(&mut *session).await,
            _ => Ok(()),
        }
    }

    fn spawn_worker(&self, pipeline: WakePipeline) -> Session {
        let guard = self.shared.generations.cancel_and_advance();
        let span = info_span!(
            "listening_session",
            session = %Uuid::new_v4(),
            generation = guard.generation()
        );
        let shared = Arc::clone(&self.shared);
        Session::Running(tokio::spawn(
            run_listening_loop(shared, pipeline, guard).instrument(span),
        ))
    }
}

impl Drop for WakeEngine {
    fn drop(&mut self) {
        // The worker sees the cancellation, aborts its take and drops the sessions.
        let _gate = self.shared.dispatch.lock();
        self.shared.generations.invalidate();
    }
}

fn sanitize(mut config: WakeConfig) -> WakeConfig {
    if config.validate().is_err() {
        warn!(sensitivity = config.sensitivity, "sensitivity clamped to [0, 1]");
        config.sensitivity = if config.sensitivity.is_nan() {
            WakeConfig::default().sensitivity
        } else {
            config.sensitivity.clamp(0.0, 1.0)
        };
    }
    config
}

/// One listening session: take → pipeline → next take, until cancelled.
/// Returns the pipeline when cancelled so the controller can park or drop it;
/// `None` when the session ended itself and released the models.
async fn run_listening_loop(
    shared: Arc<Shared>,
    mut pipeline: WakePipeline,
    guard: SessionGuard,
) -> Option<WakePipeline> {
    info!("listening_loop_started");
    let mut failures: u32 = 0;

    loop {
        if !guard.should_continue() {
            break;
        }

        let capture = shared.metrics.span(metric_names::TAKE_CAPTURE);
        let frame = match shared.source.record_take(guard.token()).await {
            Ok(frame) => {
                capture.finish();
                shared.metrics.incr(metric_names::TAKES);
                failures = 0;
                frame
            }
            Err(CaptureError::Cancelled) => break,
            Err(CaptureError::PermissionDenied) => {
                shared.permission_granted.store(false, Ordering::SeqCst);
                return shared.end_session(
                    &guard,
                    pipeline,
                    PipelineState::Idle,
                    Some(EngineError::PermissionDenied),
                );
            }
            Err(err) if !err.is_transient() => {
                error!(error = %err, "take_unrecoverable");
                return shared.end_session(
                    &guard,
                    pipeline,
                    PipelineState::Error,
                    Some(EngineError::CaptureUnavailable(err)),
                );
            }
            Err(err) => {
                failures += 1;
                shared.metrics.incr(metric_names::TAKE_RETRIES);
                warn!(error = %err, attempt = failures, "take_failed");
                if failures > shared.tuning.max_take_retries {
                    return shared.end_session(
                        &guard,
                        pipeline,
                        PipelineState::Error,
                        Some(EngineError::RetryCeilingExceeded {
                            attempts: failures,
                            last: err,
                        }),
                    );
                }
                tokio::select! {
                    _ = guard.token().cancelled() => break,
                    _ = tokio::time::sleep(shared.tuning.retry_backoff) => continue,
                }
            }
        };

        // A take that finished after cancellation is stale.
        if !guard.should_continue() {
            debug!("tail_chunk_dropped");
            break;
        }

        let sensitivity = shared.config.read().sensitivity;
        let chunk = shared.metrics.span(metric_names::CHUNK_TOTAL);
        let processed = tokio::task::spawn_blocking(move || {
            let result = pipeline.process_frame(&frame, sensitivity);
            (pipeline, result)
        })
        .await;
        let result = match processed {
            Ok((returned, result)) => {
                pipeline = returned;
                result
            }
            Err(e) => {
                // The pipeline went down with the blocking task.
                let err = EngineError::WorkerLost(e.to_string());
                let _gate = shared.dispatch.lock();
                if guard.should_continue() {
                    shared.generations.invalidate();
                    shared.models_ready.store(false, Ordering::SeqCst);
                    error!(error = %err, "listening_session_failed");
                    shared.listener.on_error(&err);
                    let _ = shared.state.transition(PipelineState::Error);
                }
                return None;
            }
        };
        chunk.finish();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                shared.metrics.incr(metric_names::CHUNKS_DROPPED);
                warn!(error = %e, "chunk_dropped");
                continue;
            }
        };
        debug!(
            features = outcome.feature_vectors,
            embeddings = outcome.embeddings,
            scores = ?outcome.scores,
            "chunk_processed"
        );

        let Some(score) = outcome.detection else {
            continue;
        };
        {
            let _gate = shared.dispatch.lock();
            if !guard.should_continue() {
                debug!(score, "stale_detection_dropped");
                break;
            }
            shared.metrics.incr(metric_names::DETECTIONS);
            info!(score, sensitivity, "wake_word_detected");
            shared.listener.on_detected(score);
        }

        if !shared.config.read().continuous_mode {
            info!("one_shot_session_complete");
            return shared.end_session(&guard, pipeline, PipelineState::Idle, None);
        }
    }

    info!("listening_loop_stopped");
    pipeline.reset();
    Some(pipeline)
}
