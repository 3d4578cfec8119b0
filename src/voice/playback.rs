//! Audio playback to a named output device

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};

use super::frame::i16_to_f32;
use super::tts::{TextToSpeech, decode_mp3};
use crate::playback::OutputSink;
use crate::{Error, Result};

/// Output device sink driven by cpal
pub struct DeviceSink {
    device_name: String,
    stop: Arc<AtomicBool>,
    tts: Option<Arc<TextToSpeech>>,
}

impl DeviceSink {
    /// Open the named output device
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if no matching device exists
    pub fn open(device_name: &str, tts: Option<Arc<TextToSpeech>>) -> Result<Self> {
        let device = find_output_device(device_name)?;
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            tts = tts.is_some(),
            "audio playback initialized"
        );

        Ok(Self {
            device_name: device_name.to_string(),
            stop: Arc::new(AtomicBool::new(false)),
            tts,
        })
    }

    async fn play_samples(&self, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        self.stop.store(false, Ordering::Release);
        let name = self.device_name.clone();
        let stop = Arc::clone(&self.stop);

        tokio::task::spawn_blocking(move || play_blocking(&name, samples, sample_rate, &stop))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

#[async_trait]
impl OutputSink for DeviceSink {
    async fn play_audio(&mut self, pcm: &[i16], sample_rate: u32) -> Result<()> {
        let samples = pcm.iter().map(|&s| i16_to_f32(s)).collect();
        self.play_samples(samples, sample_rate).await
    }

    async fn speak(&mut self, text: &str, tts_service: &str) -> Result<()> {
        let Some(tts) = self.tts.clone() else {
            return Err(Error::Playback(format!(
                "no speech synthesizer configured for {tts_service}"
            )));
        };

        let mp3 = tts.synthesize(text).await?;
        let decoded = decode_mp3(&mp3)?;
        let samples = decoded.samples.iter().map(|&s| i16_to_f32(s)).collect();
        self.play_samples(samples, decoded.sample_rate).await
    }

    fn interrupt(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Find an output device by case-insensitive name substring
///
/// An empty name selects the system default output.
fn find_output_device(name: &str) -> Result<Device> {
    let host = cpal::default_host();
    let needle = name.trim().to_lowercase();

    if needle.is_empty() {
        return host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()));
    }

    host.output_devices()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|d| d.name().is_ok_and(|n| n.to_lowercase().contains(&needle)))
        .ok_or_else(|| Error::DeviceUnavailable(format!("output device not found: {name}")))
}

fn output_config(device: &Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
                && c.sample_format() == cpal::SampleFormat::F32
        })
        // Prefer mono, fall back to stereo and beyond
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Playback(format!("no output config for {sample_rate} Hz")))?;

    Ok(supported.with_sample_rate(rate).config())
}

/// Play samples, returning early if `stop` is raised
fn play_blocking(name: &str, samples: Vec<f32>, sample_rate: u32, stop: &AtomicBool) -> Result<()> {
    let device = find_output_device(name)?;
    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels.max(1));

    let sample_count = samples.len();
    let samples: Arc<[f32]> = samples.into();
    let position = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let failed = Arc::clone(&failed);

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position.load(Ordering::Acquire);
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(pos).copied().unwrap_or(0.0);
                        frame.fill(sample);
                        pos = (pos + 1).min(samples.len());
                    }
                    position.store(pos, Ordering::Release);
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(sample_rate.max(1));
    let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

    let outcome = loop {
        if stop.load(Ordering::Acquire) {
            tracing::debug!(
                played = position.load(Ordering::Acquire),
                samples = sample_count,
                "playback interrupted"
            );
            break Ok(());
        }
        if failed.load(Ordering::Acquire) {
            break Err(Error::Playback("output stream failed".to_string()));
        }
        if position.load(Ordering::Acquire) >= sample_count {
            // Let the device drain its last buffer
            std::thread::sleep(Duration::from_millis(100));
            tracing::debug!(samples = sample_count, "playback complete");
            break Ok(());
        }
        if Instant::now() > deadline {
            break Err(Error::Playback("playback stalled".to_string()));
        }
        std::thread::sleep(Duration::from_millis(20));
    };

    drop(stream);
    outcome
}
