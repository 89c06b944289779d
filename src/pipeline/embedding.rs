//! Embedding stage: a full feature window → one embedding vector.

use ndarray::Array3;

use super::window::FeatureWindow;
use super::EmbeddingVector;
use crate::error::InferenceError;
use crate::inference::InferenceSession;
use crate::FEATURE_WINDOW;

pub struct EmbeddingStage {
    session: Box<dyn InferenceSession>,
    mel_bins: usize,
    embedding_dim: usize,
}

impl EmbeddingStage {
    pub fn new(session: Box<dyn InferenceSession>, mel_bins: usize, embedding_dim: usize) -> Self {
        Self {
            session,
            mel_bins,
            embedding_dim,
        }
    }

    /// Embed the window once it holds exactly `FEATURE_WINDOW` vectors.
    pub fn maybe_embed(
        &mut self,
        window: &FeatureWindow,
    ) -> Result<Option<EmbeddingVector>, InferenceError> {
        if !window.is_full() {
            return Ok(None);
        }

        let mut flat = Vec::with_capacity(FEATURE_WINDOW * self.mel_bins);
        for vector in window.iter() {
            flat.extend_from_slice(vector);
        }
        let input = Array3::from_shape_vec((1, FEATURE_WINDOW, self.mel_bins), flat).map_err(
            |source| InferenceError::InputShape {
                stage: "embedding",
                source,
            },
        )?;

        let output = self.session.run(input.view().into_dyn())?;
        if output.len() != self.embedding_dim {
            return Err(InferenceError::OutputShape {
                stage: "embedding",
                expected: self.embedding_dim,
                got: output.len(),
            });
        }
        // Owned copy: nothing buffered may alias the session's output.
        Ok(Some(EmbeddingVector::from(
            output.iter().copied().collect::<Vec<f32>>(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::session;
    use crate::pipeline::FeatureVector;
    use ndarray::{ArrayD, IxDyn};

    fn filled(n: usize, mel_bins: usize) -> FeatureWindow {
        let mut window = FeatureWindow::new();
        for i in 0..n {
            window.push(FeatureVector::from(vec![i as f32; mel_bins]));
        }
        window
    }

    #[test]
    fn waits_for_full_window() {
        let mut stage = EmbeddingStage::new(session(|_| panic!("model must not run")), 2, 3);
        assert!(stage.maybe_embed(&filled(FEATURE_WINDOW - 1, 2)).unwrap().is_none());
    }

    #[test]
    fn flattens_in_temporal_order() {
        let mut stage = EmbeddingStage::new(
            session(|input| {
                assert_eq!(input.shape(), &[1, FEATURE_WINDOW, 2]);
                assert_eq!(input[[0, 0, 0]], 0.0);
                assert_eq!(input[[0, FEATURE_WINDOW - 1, 1]], (FEATURE_WINDOW - 1) as f32);
                Ok(ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![1.0, 2.0, 3.0]).unwrap())
            }),
            2,
            3,
        );
        let embedding = stage.maybe_embed(&filled(FEATURE_WINDOW, 2)).unwrap().unwrap();
        assert_eq!(&embedding[..], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn reused_output_buffer_does_not_alias() {
        // A session that mutates and hands back the same buffer every call.
        let mut shared = ArrayD::<f32>::zeros(IxDyn(&[1, 2]));
        let mut stage = EmbeddingStage::new(
            session(move |_| {
                shared += 1.0;
                Ok(shared.clone())
            }),
            2,
            2,
        );
        let window = filled(FEATURE_WINDOW, 2);
        let first = stage.maybe_embed(&window).unwrap().unwrap();
        let second = stage.maybe_embed(&window).unwrap().unwrap();
        assert_eq!(&first[..], &[1.0, 1.0]);
        assert_eq!(&second[..], &[2.0, 2.0]);
    }

    #[test]
    fn wrong_embedding_width_is_an_error() {
        let mut stage = EmbeddingStage::new(session(|_| Ok(ArrayD::zeros(IxDyn(&[1, 4])))), 2, 3);
        assert!(matches!(
            stage.maybe_embed(&filled(FEATURE_WINDOW, 2)),
            Err(InferenceError::OutputShape { expected: 3, got: 4, .. })
        ));
    }
}
