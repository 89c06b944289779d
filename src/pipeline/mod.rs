//! Wake pipeline: feature → embedding → classification over sliding windows.
//! One `WakePipeline` per listening session; it owns the three model
//! sessions and both windows, and is driven one chunk at a time.

pub mod classifier;
pub mod embedding;
pub mod features;
pub mod window;

use std::ops::Deref;
use std::sync::Arc;

use tracing::debug;

use crate::audio::AudioFrame;
use crate::config::EngineTuning;
use crate::error::InferenceError;
use crate::inference::ModelSet;
use crate::metrics::{metric_names, MetricsRegistry};

use classifier::{is_detection, ClassificationStage};
use embedding::EmbeddingStage;
use features::FeatureStage;
use window::WindowManager;

/// Spectral features of one 80 ms sub-frame. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Arc<[f32]>);

/// Output of one embedding model invocation. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector(Arc<[f32]>);

macro_rules! vector_impls {
    ($name:ident) => {
        impl From<Vec<f32>> for $name {
            fn from(values: Vec<f32>) -> Self {
                Self(values.into())
            }
        }

        impl Deref for $name {
            type Target = [f32];

            fn deref(&self) -> &[f32] {
                &self.0
            }
        }
    };
}

vector_impls!(FeatureVector);
vector_impls!(EmbeddingVector);

/// What one chunk did to the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    pub feature_vectors: usize,
    pub embeddings: usize,
    /// Every score produced, in order.
    pub scores: Vec<f32>,
    /// The score that fired, if any. Windows are empty afterwards.
    pub detection: Option<f32>,
}

pub struct WakePipeline {
    features: FeatureStage,
    embedding: EmbeddingStage,
    classifier: ClassificationStage,
    windows: WindowManager,
    metrics: Arc<MetricsRegistry>,
}

impl WakePipeline {
    pub fn new(models: ModelSet, tuning: &EngineTuning, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            features: FeatureStage::new(models.features, tuning.mel_bins, tuning.multi_row_features),
            embedding: EmbeddingStage::new(models.embedding, tuning.mel_bins, tuning.embedding_dim),
            classifier: ClassificationStage::new(models.classifier, tuning.embedding_dim),
            windows: WindowManager::new(),
            metrics,
        }
    }

    /// Push one chunk through all stages.
    ///
    /// On error the windows are restored to where they were before the chunk,
    /// so a failed chunk contributes nothing. On detection both windows are
    /// cleared and the rest of the chunk is discarded.
    pub fn process_frame(
        &mut self,
        frame: &AudioFrame,
        sensitivity: f32,
    ) -> Result<ChunkOutcome, InferenceError> {
        let snapshot = self.windows.clone();
        let result = self.run_stages(frame, sensitivity);
        if result.is_err() {
            self.windows = snapshot;
        }
        result
    }

    fn run_stages(&mut self, frame: &AudioFrame, sensitivity: f32) -> Result<ChunkOutcome, InferenceError> {
        let mut outcome = ChunkOutcome::default();

        let span = self.metrics.span(metric_names::FEATURE_STAGE);
        let vectors = self.features.extract(frame)?;
        span.finish();
        outcome.feature_vectors = vectors.len();

        for vector in vectors {
            self.windows.features.push(vector);

            let span = self.metrics.span(metric_names::EMBEDDING_STAGE);
            let Some(embedding) = self.embedding.maybe_embed(&self.windows.features)? else {
                continue;
            };
            span.finish();
            self.windows.features.advance();
            self.windows.embeddings.push(embedding);
            outcome.embeddings += 1;

            let span = self.metrics.span(metric_names::CLASSIFY_STAGE);
            let Some(score) = self.classifier.maybe_classify(&self.windows.embeddings)? else {
                continue;
            };
            span.finish();
            outcome.scores.push(score);

            if is_detection(score, sensitivity) {
                debug!(score, sensitivity, "wake_detected");
                self.windows.reset();
                outcome.detection = Some(score);
                break;
            }
        }
        Ok(outcome)
    }

    /// Drop all buffered context.
    pub fn reset(&mut self) {
        self.windows.reset();
    }

    pub fn feature_window_len(&self) -> usize {
        self.windows.features.len()
    }

    pub fn embedding_window_len(&self) -> usize {
        self.windows.embeddings.len()
    }
}
