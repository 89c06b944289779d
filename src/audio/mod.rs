//! Audio capture: chunked takes from a start/stop-only recorder, decoded
//! into normalized frames for the wake pipeline.
//! Each take is recorded to a temporary 16-bit WAV artifact, read back in
//! full, and deleted before the frame moves on.

#[cfg(feature = "mic")]
pub mod mic;
pub mod take;

use std::path::Path;
use std::time::Duration;

use crate::error::CaptureError;
use crate::{FRAME_SAMPLES, SAMPLE_RATE};

pub use take::{ChunkedAudioSource, TakeHandle, TakeRecorder};

/// One take's worth of mono 16 kHz audio, normalized to [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
}

impl AudioFrame {
    /// Normalize signed 16-bit PCM.
    pub fn from_pcm16(pcm: &[i16]) -> Self {
        Self {
            samples: pcm.iter().map(|&s| s as f32 / 32768.0).collect(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / SAMPLE_RATE as f64)
    }

    /// Non-overlapping 80 ms sub-frames. A trailing partial sub-frame is skipped.
    pub fn sub_frames(&self) -> std::slice::ChunksExact<'_, f32> {
        self.samples.chunks_exact(FRAME_SAMPLES)
    }
}

/// Read every sample of a 16-bit integer WAV artifact.
/// Multi-channel artifacts keep only the first channel.
pub fn read_pcm16(path: &Path) -> Result<Vec<i16>, CaptureError> {
    let artifact_err = |source| CaptureError::Artifact {
        path: path.to_path_buf(),
        source,
    };
    let reader = hound::WavReader::open(path).map_err(artifact_err)?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "{:?} {}-bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }
    if spec.sample_rate != SAMPLE_RATE {
        return Err(CaptureError::UnsupportedFormat(format!(
            "{} Hz",
            spec.sample_rate
        )));
    }
    let channels = spec.channels.max(1) as usize;
    reader
        .into_samples::<i16>()
        .step_by(channels)
        .collect::<Result<Vec<_>, _>>()
        .map_err(artifact_err)
}
