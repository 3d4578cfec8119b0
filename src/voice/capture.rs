//! Audio capture from a named input device
//!
//! cpal streams are not `Send`, so each capture owns a dedicated thread that
//! builds the stream, holds it while running, and drops it on stop. The
//! input callback slices the device signal into fixed frames and pushes them
//! into the frame queue without blocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};

use super::frame::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};
use super::queue::FrameSender;
use crate::{Error, Result};

/// Running capture; stops when dropped
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    guard: Option<Box<dyn Send>>,
}

impl CaptureHandle {
    /// Wrap a capture thread that exits once `stop` is set
    #[must_use]
    pub fn from_thread(stop: Arc<AtomicBool>, worker: JoinHandle<()>) -> Self {
        Self {
            stop,
            worker: Some(worker),
            guard: None,
        }
    }

    /// Wrap any value whose lifetime is the capture's lifetime
    ///
    /// Used by frame sources that are not thread-backed (files, test
    /// fixtures): dropping the handle drops the value.
    #[must_use]
    pub fn from_guard(guard: impl Send + 'static) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            guard: Some(Box::new(guard)),
        }
    }

    /// Stop capturing
    ///
    /// Inside a tokio runtime the capture thread is joined on the blocking
    /// pool, so the caller never waits on the device.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.guard.take();
        if let Some(worker) = self.worker.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || join_worker(worker));
                }
                Err(_) => join_worker(worker),
            }
        }
    }
}

fn join_worker(worker: JoinHandle<()>) {
    if worker.join().is_err() {
        tracing::warn!("audio capture thread panicked");
    }
    tracing::debug!("audio capture stopped");
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Find an input device by case-insensitive name substring
///
/// An empty name selects the system default input.
fn find_input_device(name: &str) -> Result<Device> {
    let host = cpal::default_host();
    let needle = name.trim().to_lowercase();

    if needle.is_empty() {
        return host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()));
    }

    host.input_devices()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|d| {
            d.name()
                .is_ok_and(|n| n.to_lowercase().contains(&needle))
        })
        .ok_or_else(|| Error::DeviceUnavailable(format!("input device not found: {name}")))
}

/// Pick a stream config at the capture rate, preferring mono
fn input_config(device: &Device) -> Result<StreamConfig> {
    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
                && c.sample_format() == cpal::SampleFormat::F32
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| {
            Error::DeviceUnavailable(format!("input device does not support {SAMPLE_RATE} Hz"))
        })?;

    Ok(supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
}

/// Accumulates callback samples into whole frames
struct Framer {
    channels: usize,
    pending: Vec<f32>,
    seq: u64,
    sender: FrameSender,
}

impl Framer {
    fn feed(&mut self, data: &[f32]) {
        for chunk in data.chunks(self.channels) {
            #[allow(clippy::cast_precision_loss)]
            let mono = chunk.iter().sum::<f32>() / chunk.len() as f32;
            self.pending.push(mono);

            if self.pending.len() == FRAME_SAMPLES {
                let frame = AudioFrame::from_f32(&self.pending, SAMPLE_RATE, self.seq);
                self.seq += 1;
                self.pending.clear();
                if !self.sender.push(frame) {
                    tracing::trace!("frame queue full, dropped oldest frame");
                }
            }
        }
    }
}

/// Start capturing from the named input device
///
/// Returns as soon as the capture thread is running. Frames of
/// [`FRAME_SAMPLES`] samples at [`SAMPLE_RATE`] are pushed into `sender`; a
/// device that cannot be opened, or a stream error after start, is reported
/// through [`FrameSender::fault`].
///
/// # Errors
///
/// Returns `Error::DeviceUnavailable` if the capture thread cannot be spawned
pub fn start_capture(device_name: &str, sender: FrameSender) -> Result<CaptureHandle> {
    let name = device_name.to_string();
    spawn_capture(move |sender| open_stream(&name, sender), sender)
}

/// Run `open` on a dedicated thread and hold what it returns until stopped
fn spawn_capture<S, F>(open: F, sender: FrameSender) -> Result<CaptureHandle>
where
    F: FnOnce(FrameSender) -> Result<S> + Send + 'static,
    S: 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let worker = std::thread::Builder::new()
        .name("homevoice-capture".to_string())
        .spawn(move || {
            let faults = sender.clone();
            let stream = match open(sender) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "failed to open audio capture");
                    faults.fault(match e {
                        Error::DeviceUnavailable(message) => message,
                        other => other.to_string(),
                    });
                    return;
                }
            };
            drop(faults);

            while !thread_stop.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(20));
            }
            drop(stream);
        })
        .map_err(|e| Error::DeviceUnavailable(format!("failed to spawn capture thread: {e}")))?;

    Ok(CaptureHandle::from_thread(stop, worker))
}

fn open_stream(name: &str, sender: FrameSender) -> Result<cpal::Stream> {
    let device = find_input_device(name)?;
    let config = input_config(&device)?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let fault_sender = sender.clone();
    let mut framer = Framer {
        channels: usize::from(config.channels.max(1)),
        pending: Vec::with_capacity(FRAME_SAMPLES),
        seq: 0,
        sender,
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| framer.feed(data),
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                fault_sender.fault(err.to_string());
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    tracing::debug!("audio capture started");
    Ok(stream)
}

/// Read a WAV file into capture-rate frames
///
/// Multi-channel files are downmixed; the sample rate must match
/// [`SAMPLE_RATE`]. A trailing partial frame is zero-padded.
///
/// # Errors
///
/// Returns `Error::Audio` if the file cannot be decoded
#[allow(clippy::cast_precision_loss)]
pub fn frames_from_wav(path: &std::path::Path) -> Result<Vec<AudioFrame>> {
    let mut reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    if spec.sample_rate != SAMPLE_RATE {
        return Err(Error::Audio(format!(
            "expected {SAMPLE_RATE} Hz audio, got {} Hz",
            spec.sample_rate
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let mono: Vec<f32> = samples
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect();

    Ok(mono
        .chunks(FRAME_SAMPLES)
        .enumerate()
        .map(|(seq, chunk)| {
            let mut padded = chunk.to_vec();
            padded.resize(FRAME_SAMPLES, 0.0);
            AudioFrame::from_f32(&padded, SAMPLE_RATE, seq as u64)
        })
        .collect())
}

/// Encode frames as a 16-bit mono WAV file
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn frames_to_wav(frames: &[AudioFrame]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in frames.iter().flat_map(AudioFrame::samples) {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
