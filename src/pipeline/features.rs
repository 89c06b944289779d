//! Feature stage: raw audio sub-frames → spectral feature vectors.

use ndarray::ArrayView2;

use super::FeatureVector;
use crate::audio::AudioFrame;
use crate::error::InferenceError;
use crate::inference::InferenceSession;
use crate::FRAME_SAMPLES;

/// Post-processing the feature model was trained with: `value / 10 + 2`.
/// Belongs to the model; change it only together with the model.
pub const FEATURE_DIVISOR: f32 = 10.0;
pub const FEATURE_OFFSET: f32 = 2.0;

pub struct FeatureStage {
    session: Box<dyn InferenceSession>,
    mel_bins: usize,
    multi_row: bool,
}

impl FeatureStage {
    pub fn new(session: Box<dyn InferenceSession>, mel_bins: usize, multi_row: bool) -> Self {
        Self {
            session,
            mel_bins,
            multi_row,
        }
    }

    fn accepts(&self, len: usize) -> bool {
        if self.multi_row {
            len != 0 && len % self.mel_bins == 0
        } else {
            len == self.mel_bins
        }
    }

    /// Run the feature model over every complete 1280-sample sub-frame.
    /// Each sub-frame yields exactly one vector unless multi-row output is
    /// enabled, in which case every `mel_bins`-wide row is kept, in order.
    pub fn extract(&mut self, frame: &AudioFrame) -> Result<Vec<FeatureVector>, InferenceError> {
        let mut vectors = Vec::with_capacity(frame.len() / FRAME_SAMPLES);
        for sub_frame in frame.sub_frames() {
            let input = ArrayView2::from_shape((1, FRAME_SAMPLES), sub_frame).map_err(|source| {
                InferenceError::InputShape {
                    stage: "features",
                    source,
                }
            })?;
            let output = self.session.run(input.into_dyn())?;

            if !self.accepts(output.len()) {
                return Err(InferenceError::OutputShape {
                    stage: "features",
                    expected: self.mel_bins,
                    got: output.len(),
                });
            }
            let scaled: Vec<f32> = output
                .iter()
                .map(|&v| v / FEATURE_DIVISOR + FEATURE_OFFSET)
                .collect();
            vectors.extend(
                scaled
                    .chunks_exact(self.mel_bins)
                    .map(|row| FeatureVector::from(row.to_vec())),
            );
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::session;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn one_vector_per_sub_frame_remainder_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut stage = FeatureStage::new(
            session(move |input| {
                assert_eq!(input.shape(), &[1, FRAME_SAMPLES]);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(ArrayD::zeros(IxDyn(&[1, 1, 4])))
            }),
            4,
            false,
        );
        let frame = AudioFrame::from_pcm16(&vec![0; FRAME_SAMPLES * 3 + 1000]);

        let vectors = stage.extract(&frame).unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn scale_and_shift_applied() {
        let mut stage = FeatureStage::new(
            session(|_| Ok(ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![-20.0, 10.0]).unwrap())),
            2,
            false,
        );
        let frame = AudioFrame::from_pcm16(&vec![0; FRAME_SAMPLES]);
        let vectors = stage.extract(&frame).unwrap();
        assert_eq!(&vectors[0][..], &[0.0, 3.0]);
    }

    fn three_rows() -> Box<dyn InferenceSession> {
        session(|_| {
            Ok(ArrayD::from_shape_vec(IxDyn(&[1, 3, 2]), vec![0.0, 0.0, 10.0, 10.0, 20.0, 20.0]).unwrap())
        })
    }

    #[test]
    fn multi_row_output_rejected_by_default() {
        let mut stage = FeatureStage::new(three_rows(), 2, false);
        let frame = AudioFrame::from_pcm16(&vec![0; FRAME_SAMPLES]);
        assert!(matches!(
            stage.extract(&frame),
            Err(InferenceError::OutputShape { expected: 2, got: 6, .. })
        ));
    }

    #[test]
    fn multi_row_output_yields_rows_in_order_when_enabled() {
        let mut stage = FeatureStage::new(three_rows(), 2, true);
        let frame = AudioFrame::from_pcm16(&vec![0; FRAME_SAMPLES]);
        let vectors = stage.extract(&frame).unwrap();
        let firsts: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        assert_eq!(firsts, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn ragged_output_is_an_error() {
        let mut stage = FeatureStage::new(session(|_| Ok(ArrayD::zeros(IxDyn(&[1, 5])))), 4, true);
        let frame = AudioFrame::from_pcm16(&vec![0; FRAME_SAMPLES]);
        assert!(matches!(
            stage.extract(&frame),
            Err(InferenceError::OutputShape { got: 5, .. })
        ));
    }

    #[test]
    fn short_frame_yields_nothing() {
        let mut stage = FeatureStage::new(session(|_| panic!("model must not run")), 4, false);
        let frame = AudioFrame::from_pcm16(&vec![0; FRAME_SAMPLES - 1]);
        assert!(stage.extract(&frame).unwrap().is_empty());
    }
}
