//! Classification stage: the latest embeddings → one detection score.

use ndarray::Array3;

use super::window::EmbeddingWindow;
use crate::error::InferenceError;
use crate::inference::InferenceSession;
use crate::EMBEDDING_WINDOW;

/// Strict threshold: a score equal to the sensitivity does not fire.
#[inline]
pub fn is_detection(score: f32, sensitivity: f32) -> bool {
    score > sensitivity
}

pub struct ClassificationStage {
    session: Box<dyn InferenceSession>,
    embedding_dim: usize,
}

impl ClassificationStage {
    pub fn new(session: Box<dyn InferenceSession>, embedding_dim: usize) -> Self {
        Self {
            session,
            embedding_dim,
        }
    }

    /// Score the most recent `EMBEDDING_WINDOW` embeddings, once that many exist.
    pub fn maybe_classify(&mut self, window: &EmbeddingWindow) -> Result<Option<f32>, InferenceError> {
        if window.len() < EMBEDDING_WINDOW {
            return Ok(None);
        }

        let mut flat = Vec::with_capacity(EMBEDDING_WINDOW * self.embedding_dim);
        for embedding in window.recent(EMBEDDING_WINDOW) {
            flat.extend_from_slice(embedding);
        }
        let input = Array3::from_shape_vec((1, EMBEDDING_WINDOW, self.embedding_dim), flat)
            .map_err(|source| InferenceError::InputShape {
                stage: "classifier",
                source,
            })?;

        let output = self.session.run(input.view().into_dyn())?;
        let score = output
            .iter()
            .next()
            .copied()
            .ok_or(InferenceError::EmptyOutput { stage: "classifier" })?;
        if !score.is_finite() {
            return Err(InferenceError::NonFiniteScore {
                stage: "classifier",
                score,
            });
        }
        Ok(Some(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::session;
    use crate::pipeline::EmbeddingVector;
    use ndarray::{ArrayD, IxDyn};

    fn window_of(n: usize) -> EmbeddingWindow {
        let mut window = EmbeddingWindow::new();
        for i in 0..n {
            window.push(EmbeddingVector::from(vec![i as f32, i as f32]));
        }
        window
    }

    fn score_of(value: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(&[1, 1]), value)
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!is_detection(0.5, 0.5));
        assert!(is_detection(0.500_01, 0.5));
        assert!(!is_detection(0.999_99, 1.0));
        assert!(!is_detection(1.0, 1.0));
        assert!(is_detection(0.01, 0.0));
    }

    #[test]
    fn needs_full_embedding_window() {
        let mut stage = ClassificationStage::new(session(|_| panic!("model must not run")), 2);
        assert!(stage.maybe_classify(&window_of(EMBEDDING_WINDOW - 1)).unwrap().is_none());
    }

    #[test]
    fn uses_most_recent_sixteen() {
        let mut window = window_of(EMBEDDING_WINDOW);
        window.push(EmbeddingVector::from(vec![99.0, 99.0]));
        let mut stage = ClassificationStage::new(
            session(|input| {
                assert_eq!(input.shape(), &[1, EMBEDDING_WINDOW, 2]);
                assert_eq!(input[[0, 0, 0]], 1.0);
                assert_eq!(input[[0, EMBEDDING_WINDOW - 1, 0]], 99.0);
                Ok(score_of(0.25))
            }),
            2,
        );
        assert_eq!(stage.maybe_classify(&window).unwrap(), Some(0.25));
    }

    #[test]
    fn nan_score_is_an_error() {
        let mut stage = ClassificationStage::new(session(|_| Ok(score_of(f32::NAN))), 2);
        assert!(matches!(
            stage.maybe_classify(&window_of(EMBEDDING_WINDOW)),
            Err(InferenceError::NonFiniteScore { .. })
        ));
    }

    #[test]
    fn empty_output_is_an_error() {
        let mut stage = ClassificationStage::new(session(|_| Ok(ArrayD::zeros(IxDyn(&[0])))), 2);
        assert!(matches!(
            stage.maybe_classify(&window_of(EMBEDDING_WINDOW)),
            Err(InferenceError::EmptyOutput { .. })
        ));
    }
}
