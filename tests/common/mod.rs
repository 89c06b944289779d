#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use parking_lot::Mutex;
use uuid::Uuid;

use wake_engine::audio::{TakeHandle, TakeRecorder};
use wake_engine::error::{CaptureError, InferenceError};
use wake_engine::inference::{InferenceSession, ModelProvider, ModelSet};
use wake_engine::{EngineError, EngineTuning, WakeConfig, WakeEngine, WakeListener, FRAME_SAMPLES};

pub const MEL: usize = 2;
pub const DIM: usize = 3;

/// Sub-frames before the first classification: 76 + 8 * 15.
pub const WARMUP: usize = 196;

pub enum TakeScript {
    Audio(Vec<i16>),
    Fail,
    /// The device cannot deliver a usable stream at all.
    Unusable,
}

pub fn sub_frames(n: usize) -> TakeScript {
    TakeScript::Audio(vec![100; n * FRAME_SAMPLES])
}

/// Recorder fed from a script, one entry per take. Once the script runs out
/// every take yields half a sub-frame of silence, which the pipeline ignores.
pub struct ScriptedRecorder {
    dir: PathBuf,
    script: Mutex<VecDeque<TakeScript>>,
    pending: Mutex<HashMap<Uuid, Vec<i16>>>,
    pub deny_permission: AtomicBool,
    pub unusable_device: AtomicBool,
    pub fail_forever: AtomicBool,
    pub stop_delay: Duration,
    pub permission_requests: AtomicUsize,
    pub started: AtomicUsize,
    pub stopping: AtomicUsize,
    pub aborted: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl ScriptedRecorder {
    pub fn new(script: Vec<TakeScript>) -> Self {
        let dir = std::env::temp_dir().join(format!("wake-engine-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        Self {
            dir,
            script: Mutex::new(script.into()),
            pending: Mutex::new(HashMap::new()),
            deny_permission: AtomicBool::new(false),
            unusable_device: AtomicBool::new(false),
            fail_forever: AtomicBool::new(false),
            stop_delay: Duration::ZERO,
            permission_requests: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            stopping: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn leftover_artifacts(&self) -> usize {
        std::fs::read_dir(&self.dir).unwrap().count()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn write_wav(&self, id: Uuid, samples: &[i16]) -> PathBuf {
        let path = self.dir.join(format!("{id}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: wake_engine::SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }
}

impl Drop for ScriptedRecorder {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

impl TakeRecorder for ScriptedRecorder {
    fn request_permission(&self) -> Result<(), CaptureError> {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny_permission.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied);
        }
        if self.unusable_device.load(Ordering::SeqCst) {
            return Err(CaptureError::UnsupportedDevice("scripted 8-bit device".into()));
        }
        Ok(())
    }

    fn start_take(&self) -> Result<TakeHandle, CaptureError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.fail_forever.load(Ordering::SeqCst) {
            return Err(CaptureError::Interrupted("scripted failure".into()));
        }
        let samples = match self.script.lock().pop_front() {
            Some(TakeScript::Fail) => {
                return Err(CaptureError::Interrupted("scripted failure".into()));
            }
            Some(TakeScript::Unusable) => {
                return Err(CaptureError::UnsupportedDevice("scripted 8-bit device".into()));
            }
            Some(TakeScript::Audio(samples)) => samples,
            None => vec![0; FRAME_SAMPLES / 2],
        };
        let take = TakeHandle::new();
        self.pending.lock().insert(take.id(), samples);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(take)
    }

    fn stop_take(&self, take: TakeHandle) -> Result<PathBuf, CaptureError> {
        self.stopping.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.stop_delay);
        let samples = self.pending.lock().remove(&take.id()).unwrap_or_default();
        let path = self.write_wav(take.id(), &samples);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(path)
    }

    fn abort_take(&self, take: TakeHandle) {
        self.pending.lock().remove(&take.id());
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

struct LiveToken(Arc<AtomicUsize>);

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn tracked<F>(live: &Arc<AtomicUsize>, mut f: F) -> Box<dyn InferenceSession>
where
    F: FnMut(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> + Send + 'static,
{
    live.fetch_add(1, Ordering::SeqCst);
    let token = LiveToken(Arc::clone(live));
    boxed(move |input| {
        let _alive = &token;
        f(input)
    })
}

fn boxed<F>(f: F) -> Box<dyn InferenceSession>
where
    F: FnMut(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> + Send + 'static,
{
    Box::new(f)
}

/// Models with constant features/embeddings and a scripted classifier.
pub struct ScriptedModels {
    pub live: Arc<AtomicUsize>,
    pub loads: AtomicUsize,
    pub fail_load: AtomicBool,
    pub load_delay: Duration,
    scores: Arc<Mutex<VecDeque<f32>>>,
    pub default_score: f32,
    pub classifier_calls: Arc<AtomicUsize>,
    /// Upcoming classifier calls that fail.
    pub classifier_failures: Arc<AtomicUsize>,
}

impl ScriptedModels {
    pub fn new(scores: Vec<f32>) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            loads: AtomicUsize::new(0),
            fail_load: AtomicBool::new(false),
            load_delay: Duration::ZERO,
            scores: Arc::new(Mutex::new(scores.into())),
            default_score: 0.0,
            classifier_calls: Arc::new(AtomicUsize::new(0)),
            classifier_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_default_score(mut self, score: f32) -> Self {
        self.default_score = score;
        self
    }

    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn classifier_calls(&self) -> usize {
        self.classifier_calls.load(Ordering::SeqCst)
    }
}

impl ModelProvider for ScriptedModels {
    fn load(&self) -> Result<ModelSet, InferenceError> {
        std::thread::sleep(self.load_delay);
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(InferenceError::Backend("model file missing".into()));
        }

        let scores = Arc::clone(&self.scores);
        let calls = Arc::clone(&self.classifier_calls);
        let failures = Arc::clone(&self.classifier_failures);
        let default_score = self.default_score;
        Ok(ModelSet {
            features: tracked(&self.live, |_| Ok(ArrayD::from_elem(IxDyn(&[1, 1, MEL]), 0.25))),
            embedding: tracked(&self.live, |_| Ok(ArrayD::from_elem(IxDyn(&[1, DIM]), 0.5))),
            classifier: tracked(&self.live, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let failing = failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(InferenceError::Backend("scripted classifier failure".into()));
                }
                let score = scores.lock().pop_front().unwrap_or(default_score);
                Ok(ArrayD::from_elem(IxDyn(&[1, 1]), score))
            }),
        })
    }
}

/// Captures callbacks, noting how many classifications had run when each
/// detection arrived.
pub struct RecordingListener {
    classifier_calls: Arc<AtomicUsize>,
    pub detections: Mutex<Vec<(f32, usize)>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn detections(&self) -> Vec<(f32, usize)> {
        self.detections.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl WakeListener for RecordingListener {
    fn on_detected(&self, score: f32) {
        let calls = self.classifier_calls.load(Ordering::SeqCst);
        self.detections.lock().push((score, calls));
    }

    fn on_error(&self, error: &EngineError) {
        self.errors.lock().push(error.to_string());
    }
}

pub struct Harness {
    pub engine: WakeEngine,
    pub recorder: Arc<ScriptedRecorder>,
    pub models: Arc<ScriptedModels>,
    pub listener: Arc<RecordingListener>,
}

pub fn tuning() -> EngineTuning {
    EngineTuning {
        take_duration: Duration::from_millis(5),
        take_grace: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(5),
        max_take_retries: 10,
        mel_bins: MEL,
        embedding_dim: DIM,
        multi_row_features: false,
    }
}

pub fn harness(config: WakeConfig, recorder: ScriptedRecorder, models: ScriptedModels) -> Harness {
    harness_with(config, tuning(), recorder, models)
}

pub fn harness_with(
    config: WakeConfig,
    tuning: EngineTuning,
    recorder: ScriptedRecorder,
    models: ScriptedModels,
) -> Harness {
    let recorder = Arc::new(recorder);
    let models = Arc::new(models);
    let listener = Arc::new(RecordingListener {
        classifier_calls: Arc::clone(&models.classifier_calls),
        detections: Mutex::new(Vec::new()),
        errors: Mutex::new(Vec::new()),
    });
    let engine = WakeEngine::new(
        config,
        tuning,
        Arc::clone(&recorder) as Arc<dyn TakeRecorder>,
        Arc::clone(&models) as Arc<dyn ModelProvider>,
        Arc::clone(&listener) as Arc<dyn WakeListener>,
    );
    Harness {
        engine,
        recorder,
        models,
        listener,
    }
}

/// Poll `cond` every few milliseconds until it holds or `within` elapses.
pub async fn wait_for(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}
