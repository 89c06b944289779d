//! ONNX Runtime model provider for the stock openWakeWord model trio:
//! `melspectrogram.onnx`, `embedding_model.onnx` and a keyword classifier.

use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::info;

use super::{InferenceSession, ModelProvider, ModelSet};
use crate::error::InferenceError;
use crate::{FEATURE_WINDOW, MEL_BINS};

fn backend(stage: &'static str) -> impl Fn(ort::Error) -> InferenceError {
    move |e| InferenceError::Backend(format!("{stage}: {e}"))
}

/// An `ort` session plus the input adaptation its model expects.
pub struct OnnxSession {
    session: Session,
    stage: &'static str,
    input_shape: Option<Vec<usize>>,
    input_scale: f32,
}

impl OnnxSession {
    pub fn from_file(path: &Path, stage: &'static str) -> Result<Self, InferenceError> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| InferenceError::Backend(format!("{}: {e}", path.display())))?;
        Ok(Self {
            session,
            stage,
            input_shape: None,
            input_scale: 1.0,
        })
    }

    /// Feed the model this shape instead of the caller's (same element count).
    pub fn with_input_shape(mut self, shape: Vec<usize>) -> Self {
        self.input_shape = Some(shape);
        self
    }

    /// Multiply every input value before inference.
    pub fn with_input_scale(mut self, scale: f32) -> Self {
        self.input_scale = scale;
        self
    }
}

impl InferenceSession for OnnxSession {
    fn run(&mut self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, InferenceError> {
        let shape = self
            .input_shape
            .clone()
            .unwrap_or_else(|| input.shape().to_vec());
        let expected: usize = shape.iter().product();
        if expected != input.len() {
            return Err(InferenceError::Backend(format!(
                "{}: input has {} values, model shape {:?} needs {}",
                self.stage,
                input.len(),
                shape,
                expected
            )));
        }
        let data: Vec<f32> = input.iter().map(|&v| v * self.input_scale).collect();

        let tensor = Tensor::from_array((shape, data)).map_err(backend(self.stage))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(backend(self.stage))?;
        let (out_shape, out_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(backend(self.stage))?;

        // Copy out of the runtime-owned buffer before the outputs are released.
        let dims: Vec<usize> = out_shape.iter().map(|&d| d as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&dims), out_data.to_vec()).map_err(|source| {
            InferenceError::InputShape {
                stage: self.stage,
                source,
            }
        })
    }
}

/// Loads the three models from one directory.
pub struct OnnxModelProvider {
    model_dir: PathBuf,
    features_file: String,
    embedding_file: String,
    classifier_file: String,
}

impl OnnxModelProvider {
    pub fn new(model_dir: impl Into<PathBuf>, classifier_file: impl Into<String>) -> Self {
        Self {
            model_dir: model_dir.into(),
            features_file: "melspectrogram.onnx".into(),
            embedding_file: "embedding_model.onnx".into(),
            classifier_file: classifier_file.into(),
        }
    }

    fn path(&self, file: &str) -> Result<PathBuf, InferenceError> {
        let path = self.model_dir.join(file);
        if !path.exists() {
            return Err(InferenceError::Backend(format!(
                "model not found: {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

impl ModelProvider for OnnxModelProvider {
    fn load(&self) -> Result<ModelSet, InferenceError> {
        // The stock melspectrogram graph expects int16-range samples.
        let features = OnnxSession::from_file(&self.path(&self.features_file)?, "features")?
            .with_input_scale(32768.0);
        let embedding = OnnxSession::from_file(&self.path(&self.embedding_file)?, "embedding")?
            .with_input_shape(vec![1, FEATURE_WINDOW, MEL_BINS, 1]);
        let classifier = OnnxSession::from_file(&self.path(&self.classifier_file)?, "classifier")?;

        info!(dir = %self.model_dir.display(), classifier = %self.classifier_file, "onnx_models_loaded");
        Ok(ModelSet {
            features: Box::new(features),
            embedding: Box::new(embedding),
            classifier: Box::new(classifier),
        })
    }
}
