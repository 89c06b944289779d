//! cpal-backed take recorder.
//! Each take runs on its own thread: the input stream is built, played and
//! dropped there (cpal streams are not `Send`). The device is opened in
//! whatever rate, channel count and sample format it supports closest to
//! 16 kHz mono; samples are downmixed on arrival and resampled once the take
//! ends, then written as a 16 kHz 16-bit mono WAV artifact. The microphone
//! is only open between `start_take` and `stop_take` / `abort_take`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig, SupportedStreamConfigRange};
use crossbeam_channel as cb;
use hound::{WavSpec, WavWriter};
use parking_lot::Mutex;
use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::take::{TakeHandle, TakeRecorder};
use crate::error::CaptureError;
use crate::SAMPLE_RATE;

type MonoBuffer = Arc<Mutex<Vec<f32>>>;

enum TakeCommand {
    Finish,
    Discard,
}

struct ActiveTake {
    command_tx: cb::Sender<TakeCommand>,
    done_rx: cb::Receiver<Result<PathBuf, CaptureError>>,
    thread: JoinHandle<()>,
}

/// Records takes from the default input device, delivered as 16 kHz mono.
pub struct CpalTakeRecorder {
    artifact_dir: PathBuf,
    takes: Mutex<HashMap<Uuid, ActiveTake>>,
}

impl CpalTakeRecorder {
    /// Artifacts go to the system temp directory.
    pub fn new() -> Self {
        Self::with_artifact_dir(std::env::temp_dir())
    }

    pub fn with_artifact_dir(artifact_dir: PathBuf) -> Self {
        Self {
            artifact_dir,
            takes: Mutex::new(HashMap::new()),
        }
    }

    fn finish(&self, take: TakeHandle, command: TakeCommand) -> Result<PathBuf, CaptureError> {
        let active = self
            .takes
            .lock()
            .remove(&take.id())
            .ok_or_else(|| CaptureError::Interrupted(format!("unknown take {}", take.id())))?;
        // The thread may already have exited on a stream error; its result is still queued.
        let _ = active.command_tx.send(command);
        let result = active
            .done_rx
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::Interrupted("take thread exited".into())));
        if active.thread.join().is_err() {
            error!(take = %take.id(), "take thread panicked");
        }
        result
    }
}

impl Default for CpalTakeRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TakeRecorder for CpalTakeRecorder {
    fn request_permission(&self) -> Result<(), CaptureError> {
        // Desktop hosts have no permission prompt; an unreachable input device is the denial.
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::PermissionDenied)?;
        let config = negotiate(&device)?;
        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            format = ?config.sample_format(),
            "microphone_available"
        );
        Ok(())
    }

    fn start_take(&self) -> Result<TakeHandle, CaptureError> {
        let take = TakeHandle::new();
        let path = self.artifact_dir.join(format!("wake-take-{}.wav", take.id()));

        let (ready_tx, ready_rx) = cb::bounded::<Result<(), CaptureError>>(1);
        let (command_tx, command_rx) = cb::bounded::<TakeCommand>(1);
        let (done_tx, done_rx) = cb::bounded::<Result<PathBuf, CaptureError>>(1);

        let thread = std::thread::Builder::new()
            .name("wake-take".into())
            .spawn(move || run_take(path, ready_tx, command_rx, done_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CaptureError::Interrupted("take thread exited before start".into()));
            }
        }

        self.takes.lock().insert(
            take.id(),
            ActiveTake {
                command_tx,
                done_rx,
                thread,
            },
        );
        Ok(take)
    }

    fn stop_take(&self, take: TakeHandle) -> Result<PathBuf, CaptureError> {
        self.finish(take, TakeCommand::Finish)
    }

    fn abort_take(&self, take: TakeHandle) {
        let id = take.id();
        match self.finish(take, TakeCommand::Discard) {
            Err(CaptureError::Cancelled) => {}
            Ok(path) => {
                let _ = std::fs::remove_file(path);
            }
            Err(e) => warn!(take = %id, error = %e, "abort_take"),
        }
    }
}

/// Body of a take thread: open the stream, wait for a command, close it and
/// write whatever was captured.
fn run_take(
    path: PathBuf,
    ready_tx: cb::Sender<Result<(), CaptureError>>,
    command_rx: cb::Receiver<TakeCommand>,
    done_tx: cb::Sender<Result<PathBuf, CaptureError>>,
) {
    let buffer: MonoBuffer = Arc::new(Mutex::new(Vec::new()));
    let stream_failed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let (stream, device_rate) = match open_stream(Arc::clone(&buffer), Arc::clone(&stream_failed)) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let command = command_rx.recv().unwrap_or(TakeCommand::Discard);
    drop(stream);

    let captured = std::mem::take(&mut *buffer.lock());
    let failure = stream_failed.lock().take();

    let result = match (command, failure) {
        (TakeCommand::Discard, _) => Err(CaptureError::Cancelled),
        (TakeCommand::Finish, Some(reason)) => Err(CaptureError::Interrupted(reason)),
        (TakeCommand::Finish, None) => resample(captured, device_rate)
            .and_then(|samples| write_artifact(&path, &samples))
            .map(|()| path),
    };
    let _ = done_tx.send(result);
}

/// Writes the 16 kHz mono artifact; a partial file is removed on failure.
fn write_artifact(path: &std::path::Path, samples: &[f32]) -> Result<(), CaptureError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let written = (|| {
        let mut writer = WavWriter::create(path, spec)?;
        for &sample in samples {
            writer.write_sample(to_pcm16(sample))?;
        }
        writer.finalize()
    })();
    written.map_err(|source| {
        let _ = std::fs::remove_file(path);
        CaptureError::Artifact {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn open_stream(
    buffer: MonoBuffer,
    stream_failed: Arc<Mutex<Option<String>>>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::PermissionDenied)?;

    let supported = negotiate(&device)?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    debug!(
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        format = ?format,
        "take_stream_config"
    );

    let stream = match format {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, buffer, stream_failed),
        SampleFormat::F32 => build_stream::<f32>(&device, &config, buffer, stream_failed),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, buffer, stream_failed),
        other => Err(CaptureError::UnsupportedDevice(format!("sample format {other:?}"))),
    }?;

    stream
        .play()
        .map_err(|e| CaptureError::Interrupted(format!("failed to start audio stream: {e}")))?;
    Ok((stream, config.sample_rate.0))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    buffer: MonoBuffer,
    stream_failed: Arc<Mutex<Option<String>>>,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                downmix_into(&mut buffer.lock(), data, channels);
            },
            move |err| {
                error!(error = %err, "audio capture error");
                *stream_failed.lock() = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| CaptureError::Interrupted(format!("failed to build input stream: {e}")))
}

/// Pick the device config closest to 16 kHz mono, falling back to the
/// device default when the supported ranges cannot be listed.
fn negotiate(device: &cpal::Device) -> Result<SupportedStreamConfig, CaptureError> {
    match device.supported_input_configs() {
        Ok(ranges) => {
            let ranges: Vec<_> = ranges.collect();
            choose_config(&ranges).ok_or_else(|| {
                let offered: Vec<String> = ranges
                    .iter()
                    .map(|r| format!("{:?}x{}", r.sample_format(), r.channels()))
                    .collect();
                CaptureError::UnsupportedDevice(format!("no usable input config in [{}]", offered.join(", ")))
            })
        }
        Err(e) => {
            warn!(error = %e, "supported_input_configs_unavailable");
            let fallback = device
                .default_input_config()
                .map_err(|e| CaptureError::UnsupportedDevice(e.to_string()))?;
            match format_rank(fallback.sample_format()) {
                Some(_) if fallback.channels() > 0 => Ok(fallback),
                _ => Err(CaptureError::UnsupportedDevice(format!(
                    "default config {:?}x{} cannot be converted",
                    fallback.sample_format(),
                    fallback.channels()
                ))),
            }
        }
    }
}

/// Sample formats the capture callback can convert, best first.
fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

/// Nearest rate to 16 kHz the range can run at.
fn nearest_rate(range: &SupportedStreamConfigRange) -> u32 {
    SAMPLE_RATE.clamp(range.min_sample_rate().0, range.max_sample_rate().0)
}

/// Rate closest to 16 kHz wins, then fewer channels, then the cheaper format.
fn choose_config(ranges: &[SupportedStreamConfigRange]) -> Option<SupportedStreamConfig> {
    ranges
        .iter()
        .filter(|r| r.channels() > 0)
        .filter_map(|r| format_rank(r.sample_format()).map(|rank| (r, rank)))
        .min_by_key(|(r, rank)| (nearest_rate(r).abs_diff(SAMPLE_RATE), r.channels(), *rank))
        .map(|(r, _)| r.clone().with_sample_rate(cpal::SampleRate(nearest_rate(r))))
}

/// Average interleaved frames down to mono; a trailing partial frame is dropped.
fn downmix_into<T>(out: &mut Vec<f32>, data: &[T], channels: usize)
where
    T: Sample,
    f32: FromSample<T>,
{
    if channels == 1 {
        out.extend(data.iter().map(|&s| f32::from_sample(s)));
        return;
    }
    out.extend(data.chunks_exact(channels).map(|frame| {
        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32
    }));
}

/// Inverse of the decoder's `/ 32768` normalization, saturating.
fn to_pcm16(sample: f32) -> i16 {
    (sample * 32_768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn resample_error(e: impl std::fmt::Display) -> CaptureError {
    CaptureError::Interrupted(format!("resample: {e}"))
}

/// Convert a whole take from the device rate to 16 kHz.
fn resample(samples: Vec<f32>, from_rate: u32) -> Result<Vec<f32>, CaptureError> {
    if from_rate == SAMPLE_RATE || samples.is_empty() {
        return Ok(samples);
    }
    let ratio = SAMPLE_RATE as f64 / from_rate as f64;
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1).map_err(resample_error)?;
    let delay = resampler.output_delay();

    let waves_in = vec![samples];
    let mut out = resampler
        .process(&waves_in, None)
        .map_err(resample_error)?
        .swap_remove(0);
    // Flush the filter delay with one chunk of silence.
    let tail = resampler
        .process_partial::<Vec<f32>>(None, None)
        .map_err(resample_error)?;
    out.extend_from_slice(&tail[0]);

    Ok(out.into_iter().skip(delay).take(expected).collect())
}
