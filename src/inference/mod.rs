//! Inference seam: opaque, ready-to-run model sessions.
//! Sessions are supplied by a `ModelProvider`; the pipeline only knows their
//! input/output tensor shapes, never where or how the models were loaded.

#[cfg(feature = "onnx")]
pub mod onnx;

use ndarray::{ArrayD, ArrayViewD};

use crate::error::InferenceError;

/// One loaded model. `run` takes a single input tensor and returns a single
/// output tensor that the caller owns outright.
pub trait InferenceSession: Send {
    fn run(&mut self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError>;
}

impl<F> InferenceSession for F
where
    F: FnMut(ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> + Send,
{
    fn run(&mut self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> {
        self(input)
    }
}

/// The three sessions of the wake pipeline.
pub struct ModelSet {
    /// `[1, 1280]` raw audio → spectral features.
    pub features: Box<dyn InferenceSession>,
    /// `[1, 76, mel_bins]` feature window → one embedding.
    pub embedding: Box<dyn InferenceSession>,
    /// `[1, 16, embedding_dim]` embedding window → detection score.
    pub classifier: Box<dyn InferenceSession>,
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet").finish_non_exhaustive()
    }
}

/// Resolves model sessions. Called on the blocking pool each time the
/// engine leaves `Idle`/`Error`; sessions are dropped when it returns there.
pub trait ModelProvider: Send + Sync {
    fn load(&self) -> Result<ModelSet, InferenceError>;
}
