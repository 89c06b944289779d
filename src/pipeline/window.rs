//! Sliding windows between the inference stages.
//! The feature window fills to 76 vectors, feeds the embedding model, then
//! slides by 8 so consecutive embeddings overlap. The embedding window keeps
//! the 16 most recent embeddings for the classifier.

use std::collections::VecDeque;

use super::{EmbeddingVector, FeatureVector};
use crate::{EMBEDDING_WINDOW, FEATURE_STRIDE, FEATURE_WINDOW};

/// Most recent feature vectors, at most `FEATURE_WINDOW`.
#[derive(Debug, Clone, Default)]
pub struct FeatureWindow {
    frames: VecDeque<FeatureVector>,
}

impl FeatureWindow {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::with_capacity(FEATURE_WINDOW),
        }
    }

    /// Append a vector. A full window drops its oldest vector first, so the
    /// length bound holds even if a caller skips `advance`.
    pub fn push(&mut self, vector: FeatureVector) {
        if self.frames.len() >= FEATURE_WINDOW {
            self.frames.pop_front();
        }
        self.frames.push_back(vector);
    }

    /// True once the window holds exactly enough context for one embedding.
    pub fn is_full(&self) -> bool {
        self.frames.len() == FEATURE_WINDOW
    }

    /// Slide forward by the stride, dropping the oldest vectors.
    pub fn advance(&mut self) {
        let n = FEATURE_STRIDE.min(self.frames.len());
        self.frames.drain(..n);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureVector> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Most recent embeddings, at most `EMBEDDING_WINDOW`.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingWindow {
    embeddings: VecDeque<EmbeddingVector>,
}

impl EmbeddingWindow {
    pub fn new() -> Self {
        Self {
            embeddings: VecDeque::with_capacity(EMBEDDING_WINDOW + 1),
        }
    }

    pub fn push(&mut self, embedding: EmbeddingVector) {
        self.embeddings.push_back(embedding);
        while self.embeddings.len() > EMBEDDING_WINDOW {
            self.embeddings.pop_front();
        }
    }

    /// The last `n` embeddings in temporal order (fewer if not yet available).
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &EmbeddingVector> {
        let skip = self.embeddings.len().saturating_sub(n);
        self.embeddings.iter().skip(skip)
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn clear(&mut self) {
        self.embeddings.clear();
    }
}

/// Both windows of one listening session. Only the pipeline worker mutates
/// them, so no locking is involved.
#[derive(Debug, Clone, Default)]
pub struct WindowManager {
    pub features: FeatureWindow,
    pub embeddings: EmbeddingWindow,
}

impl WindowManager {
    pub fn new() -> Self {
        Self {
            features: FeatureWindow::new(),
            embeddings: EmbeddingWindow::new(),
        }
    }

    /// Full reset: used after a detection and when a session stops.
    pub fn reset(&mut self) {
        self.features.clear();
        self.embeddings.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.embeddings.is_empty()
    }
}
