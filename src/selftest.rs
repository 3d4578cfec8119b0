//! Component self-tests
//!
//! One-shot checks of a single component, run outside the control loop with
//! their own device and session handles. Invalid parameters are errors; a
//! component that does not work is a report with `success: false`.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::{PipelineConfig, normalize_wake_word, validate_sensitivity};
use crate::pipeline::PipelineDeps;
use crate::session::ConnectParams;
use crate::voice::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE, frame_queue};
use crate::wake_word::WakeWordScorer;
use crate::{Error, Result};

/// How long the capture test waits for a frame
const CAPTURE_WAIT: Duration = Duration::from_secs(1);

/// Test tone
const TONE_HZ: f32 = 440.0;
const TONE_RATE: u32 = 24_000;
const TONE_SECS: f32 = 0.3;

/// Which component to exercise, with optional overrides of the current config
#[derive(Clone)]
pub enum SelfTestRequest {
    /// Score a sample through the wake word model
    ///
    /// With a recorded sample the test passes only on a detection. Without
    /// one a synthetic burst is scored and the test passes once the model
    /// loads and runs, since a tone is not a spoken phrase.
    WakeWord {
        wake_word: Option<String>,
        sensitivity: Option<f32>,
        /// Frames to score
        sample: Option<Vec<AudioFrame>>,
    },
    /// Open the input device and wait for audio
    AudioCapture { input_device: Option<String> },
    /// Open and close a session with the remote API
    GeminiApi { api_key: Option<SecretString> },
    /// Play a short tone on the output device
    Tts {
        output_device: Option<String>,
        tts_service: Option<String>,
    },
}

impl SelfTestRequest {
    /// Component under test, as named by the HTTP routes
    #[must_use]
    pub const fn component(&self) -> &'static str {
        match self {
            Self::WakeWord { .. } => "wake_word",
            Self::AudioCapture { .. } => "audio_capture",
            Self::GeminiApi { .. } => "gemini_api",
            Self::Tts { .. } => "tts",
        }
    }
}

// Samples and keys stay out of logs
impl std::fmt::Debug for SelfTestRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SelfTestRequest")
            .field(&self.component())
            .finish()
    }
}

/// Self-test outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfTestReport {
    pub success: bool,
    pub message: String,
}

impl SelfTestReport {
    fn passed(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Run one self-test against `config` with the given collaborators
///
/// # Errors
///
/// Returns `Error::Config` for invalid request parameters
pub async fn run(
    request: SelfTestRequest,
    deps: &PipelineDeps,
    config: &PipelineConfig,
) -> Result<SelfTestReport> {
    let report = match request {
        SelfTestRequest::WakeWord {
            wake_word,
            sensitivity,
            sample,
        } => test_wake_word(deps, config, wake_word, sensitivity, sample)?,
        SelfTestRequest::AudioCapture { input_device } => {
            let device = input_device.unwrap_or_else(|| config.input_device.clone());
            test_audio_capture(deps, &device).await
        }
        SelfTestRequest::GeminiApi { api_key } => {
            let api_key = api_key.unwrap_or_else(|| config.api_key.clone());
            test_gemini_api(deps, config, api_key).await
        }
        SelfTestRequest::Tts {
            output_device,
            tts_service,
        } => {
            let device = output_device.unwrap_or_else(|| config.output_device.clone());
            let service = tts_service.unwrap_or_else(|| config.tts_service.clone());
            test_output(deps, &device, &service).await
        }
    };

    tracing::info!(success = report.success, message = %report.message, "self-test finished");
    Ok(report)
}

fn test_wake_word(
    deps: &PipelineDeps,
    config: &PipelineConfig,
    wake_word: Option<String>,
    sensitivity: Option<f32>,
    sample: Option<Vec<AudioFrame>>,
) -> Result<SelfTestReport> {
    let wake_word = wake_word.map_or_else(|| config.wake_word.clone(), |w| normalize_wake_word(&w));
    if wake_word.is_empty() {
        return Err(Error::Config("wake_word must not be empty".to_string()));
    }
    let threshold = sensitivity.unwrap_or(config.wake_word_sensitivity);
    validate_sensitivity(threshold)?;

    let mut scorer =
        match WakeWordScorer::load(deps.models.as_ref(), &wake_word, threshold, &config.wake) {
            Ok(scorer) => scorer,
            Err(e) => return Ok(SelfTestReport::failed(e.to_string())),
        };

    let recorded = sample.is_some();
    let frames = sample.unwrap_or_else(synthetic_wake_sample);
    let mut peak = 0.0_f32;
    for frame in &frames {
        match scorer.score(frame) {
            Ok(Some(event)) => {
                return Ok(SelfTestReport::passed(format!(
                    "detected '{}' with confidence {:.2} (threshold {threshold:.2}, model {})",
                    event.wake_word,
                    event.confidence,
                    scorer.model_name()
                )));
            }
            Ok(None) => peak = peak.max(scorer.confidence()),
            Err(e) => return Ok(SelfTestReport::failed(e.to_string())),
        }
    }

    if !recorded {
        return Ok(SelfTestReport::passed(format!(
            "model {} loaded and scored {} frames; peak confidence {peak:.2} (threshold {threshold:.2})",
            scorer.model_name(),
            frames.len()
        )));
    }

    Ok(SelfTestReport::failed(format!(
        "no detection in {} frames; peak confidence {peak:.2} below threshold {threshold:.2}",
        frames.len()
    )))
}

async fn test_audio_capture(deps: &PipelineDeps, device: &str) -> SelfTestReport {
    let (sender, receiver) = frame_queue(16, Arc::new(AtomicU64::new(0)));
    let handle = match deps.devices.open_input(device, sender) {
        Ok(handle) => handle,
        Err(e) => return SelfTestReport::failed(e.to_string()),
    };

    let result = tokio::time::timeout(CAPTURE_WAIT, receiver.recv()).await;
    handle.stop();

    let name = device_label(device);
    match result {
        Ok(Ok(frame)) => SelfTestReport::passed(format!(
            "capturing from {name}: level {:.4}",
            frame.rms()
        )),
        Ok(Err(e)) => SelfTestReport::failed(e.to_string()),
        Err(_) => SelfTestReport::failed(format!(
            "no audio from {name} within {}ms",
            CAPTURE_WAIT.as_millis()
        )),
    }
}

async fn test_gemini_api(
    deps: &PipelineDeps,
    config: &PipelineConfig,
    api_key: SecretString,
) -> SelfTestReport {
    if api_key.expose_secret().trim().is_empty() {
        return SelfTestReport::failed("API key not configured");
    }

    let params = ConnectParams {
        api_key,
        config: config.session.clone(),
    };
    let deadline = config.session.deadline;
    match tokio::time::timeout(deadline, deps.connector.connect(&params)).await {
        Ok(Ok(mut transport)) => {
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "self-test session close failed");
            }
            SelfTestReport::passed(format!("connected to {}", config.session.model))
        }
        Ok(Err(e)) => SelfTestReport::failed(e.to_string()),
        Err(_) => SelfTestReport::failed(Error::SessionTimeout(deadline).to_string()),
    }
}

async fn test_output(deps: &PipelineDeps, device: &str, tts_service: &str) -> SelfTestReport {
    let mut sink = match deps.devices.open_output(device) {
        Ok(sink) => sink,
        Err(e) => return SelfTestReport::failed(e.to_string()),
    };

    match sink.play_audio(&test_tone(), TONE_RATE).await {
        Ok(()) => SelfTestReport::passed(format!(
            "played test tone on {} (tts service {tts_service})",
            device_label(device)
        )),
        Err(e) => SelfTestReport::failed(e.to_string()),
    }
}

fn device_label(device: &str) -> String {
    if device.is_empty() {
        "default device".to_string()
    } else {
        format!("'{device}'")
    }
}

/// 440 Hz at 30% volume
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn test_tone() -> Vec<i16> {
    let count = (TONE_RATE as f32 * TONE_SECS) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / TONE_RATE as f32;
            let sample = (2.0 * std::f32::consts::PI * TONE_HZ * t).sin() * 0.3;
            (sample * f32::from(i16::MAX)) as i16
        })
        .collect()
}

/// Leading silence, a 0.6s voiced burst, then closing silence
///
/// Shaped like a spoken wake phrase for the built-in burst model.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn synthetic_wake_sample() -> Vec<AudioFrame> {
    let mut frames = Vec::with_capacity(40);
    let mut seq = 0;
    for _ in 0..10 {
        frames.push(AudioFrame::silence(seq));
        seq += 1;
    }
    for _ in 0..20 {
        let samples: Vec<f32> = (0..FRAME_SAMPLES)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * TONE_HZ * t).sin() * 0.3
            })
            .collect();
        frames.push(AudioFrame::from_f32(&samples, SAMPLE_RATE, seq));
        seq += 1;
    }
    for _ in 0..10 {
        frames.push(AudioFrame::silence(seq));
        seq += 1;
    }
    frames
}
