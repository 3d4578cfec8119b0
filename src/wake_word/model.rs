//! Wake word models and the loader seam

use crate::voice::AudioFrame;
use crate::{Error, Result};

/// Normalized RMS above which a frame counts toward a burst
const ENERGY_THRESHOLD: f32 = 0.03;

/// Shortest plausible wake phrase (0.3s)
const MIN_BURST_FRAMES: usize = 10;

/// Longest plausible wake phrase (1.5s)
const MAX_BURST_FRAMES: usize = 50;

/// Trailing silence that closes a burst (150ms)
const CLOSING_SILENCE_FRAMES: usize = 5;

/// Mean burst RMS that maps to full confidence
const FULL_CONFIDENCE_RMS: f32 = 0.1;

/// Supported wake phrases and the model each one loads
pub const AVAILABLE_WAKE_WORDS: &[(&str, &str)] = &[
    ("alexa", "alexa"),
    ("hey computer", "hey_computer"),
    ("ok google", "ok_google"),
    ("hey google", "hey_google"),
    ("hey jarvis", "jarvis"),
    ("jarvis", "jarvis"),
    ("hey snapdragon", "snapdragon"),
    ("computer", "computer"),
];

/// Model used for phrases without a dedicated model
pub const FALLBACK_MODEL: &str = "hey_computer";

/// Per-frame wake phrase classifier
///
/// Implementations keep whatever feature history they need; the scorer only
/// sees one normalized output per frame.
pub trait WakeWordModel: Send {
    /// Model identifier
    fn name(&self) -> &str;

    /// Score one frame, returning a confidence in [0, 1]
    ///
    /// # Errors
    ///
    /// Returns `Error::DetectionFault` if inference fails
    fn predict(&mut self, frame: &AudioFrame) -> Result<f32>;

    /// Forget all history
    fn reset(&mut self);
}

/// Loads a model for a wake phrase
pub trait ModelLoader: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::DetectionFault` if no model can be loaded
    fn load(&self, wake_word: &str) -> Result<Box<dyn WakeWordModel>>;
}

/// Map a wake phrase to its model name
#[must_use]
pub fn model_name_for(wake_word: &str) -> Option<&'static str> {
    let normalized = wake_word.trim().to_lowercase();
    AVAILABLE_WAKE_WORDS
        .iter()
        .find(|(phrase, _)| *phrase == normalized)
        .map(|(_, model)| *model)
}

/// Energy burst models for every phrase, named through [`AVAILABLE_WAKE_WORDS`]
///
/// Needs no model files; also what `OnnxModels` falls back to.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinModels;

impl ModelLoader for BuiltinModels {
    fn load(&self, wake_word: &str) -> Result<Box<dyn WakeWordModel>> {
        if wake_word.trim().is_empty() {
            return Err(Error::DetectionFault("wake word is empty".to_string()));
        }

        let model = model_name_for(wake_word).unwrap_or_else(|| {
            tracing::warn!(
                wake_word,
                fallback = FALLBACK_MODEL,
                "no model for wake word, using fallback"
            );
            FALLBACK_MODEL
        });

        tracing::debug!(wake_word, model, "wake word model loaded");
        Ok(Box::new(BurstModel::new(model)))
    }
}

/// Energy burst classifier
///
/// Scores phrase-shaped bursts of speech: voiced audio lasting between 0.3s
/// and 1.5s, closed by a short silence. While that closing silence runs the
/// model reports a confidence proportional to the burst's mean energy; at all
/// other times it reports zero. Runs in constant time per frame.
#[derive(Debug)]
pub struct BurstModel {
    name: String,
    voiced_frames: usize,
    energy_sum: f32,
    silence_frames: usize,
}

impl BurstModel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            voiced_frames: 0,
            energy_sum: 0.0,
            silence_frames: 0,
        }
    }

    fn burst_confidence(&self) -> f32 {
        if !(MIN_BURST_FRAMES..=MAX_BURST_FRAMES).contains(&self.voiced_frames) {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = self.energy_sum / self.voiced_frames as f32;
        (mean / FULL_CONFIDENCE_RMS).clamp(0.0, 1.0)
    }
}

impl WakeWordModel for BurstModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&mut self, frame: &AudioFrame) -> Result<f32> {
        let energy = frame.rms();

        if energy > ENERGY_THRESHOLD {
            // A pause shorter than the closing silence belongs to the burst
            self.voiced_frames += 1;
            self.energy_sum += energy;
            self.silence_frames = 0;
            return Ok(0.0);
        }

        if self.voiced_frames == 0 {
            return Ok(0.0);
        }

        self.silence_frames += 1;
        if self.silence_frames > CLOSING_SILENCE_FRAMES {
            tracing::trace!(frames = self.voiced_frames, "burst closed");
            self.reset();
            return Ok(0.0);
        }

        Ok(self.burst_confidence())
    }

    fn reset(&mut self) {
        self.voiced_frames = 0;
        self.energy_sum = 0.0;
        self.silence_frames = 0;
    }
}
