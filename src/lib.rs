//! wake-engine: on-device wake-word detection.
//!
//! Audio arrives as short start/stop recording takes, each decoded into one
//! chunk and pushed through a three-stage model cascade:
//! audio → spectral features → embeddings → wake score. The `WakeEngine`
//! wraps that pipeline in a lifecycle (Idle / Loading / Listening /
//! Suspended / Error) driven by host start/stop, foreground/background and
//! configuration changes, and reports detections through a `WakeListener`.

pub mod audio;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod state_machine;

pub use config::{EngineTuning, WakeConfig};
pub use engine::{AppLifecycle, WakeEngine, WakeListener};
pub use error::EngineError;
pub use events::{ChannelListener, EngineEvent};
pub use state_machine::PipelineState;

/// Capture sample rate (mono).
pub const SAMPLE_RATE: u32 = 16_000;
/// Samples per feature-model invocation (80 ms).
pub const FRAME_SAMPLES: usize = 1280;
/// Feature vectors per embedding-model invocation.
pub const FEATURE_WINDOW: usize = 76;
/// Feature vectors dropped after each embedding.
pub const FEATURE_STRIDE: usize = 8;
/// Embeddings per classifier invocation.
pub const EMBEDDING_WINDOW: usize = 16;
/// Default feature vector width.
pub const MEL_BINS: usize = 32;
/// Default embedding width.
pub const EMBEDDING_DIM: usize = 96;
