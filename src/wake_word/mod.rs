//! Wake word scoring
//!
//! The scorer wraps a per-frame model with a fixed-size rolling window of its
//! outputs. The window mean is the confidence; a detection fires when it
//! strictly exceeds the sensitivity threshold and no detection fired within
//! the cool-down. Every step is constant time per frame.

mod model;
mod onnx;

use std::collections::VecDeque;

use serde::Serialize;

pub use model::{
    AVAILABLE_WAKE_WORDS, BuiltinModels, BurstModel, FALLBACK_MODEL, ModelLoader, WakeWordModel,
    model_name_for,
};
pub use onnx::{EMBEDDING_FILE, MELSPECTROGRAM_FILE, OnnxModels, OpenWakeWordModel};

use crate::Result;
use crate::config::WakeConfig;
use crate::voice::{AudioFrame, frames_for};

/// A wake phrase was heard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    /// Wake phrase that fired
    pub wake_word: String,
    /// Smoothed confidence in [0, 1]
    pub confidence: f32,
    /// Sequence number of the frame that completed the detection
    pub seq: u64,
}

/// Rolling-window wake word scorer
pub struct WakeWordScorer {
    model: Box<dyn WakeWordModel>,
    wake_word: String,
    threshold: f32,
    window: VecDeque<f32>,
    window_len: usize,
    window_sum: f32,
    cooldown_frames: usize,
    cooldown_remaining: usize,
}

impl WakeWordScorer {
    /// Create a scorer around a loaded model
    #[must_use]
    pub fn new(
        model: Box<dyn WakeWordModel>,
        wake_word: impl Into<String>,
        threshold: f32,
        config: &WakeConfig,
    ) -> Self {
        let window_len = config.smoothing_frames.max(1);
        Self {
            model,
            wake_word: wake_word.into(),
            threshold,
            window: VecDeque::with_capacity(window_len),
            window_len,
            window_sum: 0.0,
            cooldown_frames: frames_for(config.cooldown),
            cooldown_remaining: 0,
        }
    }

    /// Load the model for `wake_word` and build a scorer
    ///
    /// # Errors
    ///
    /// Returns `Error::DetectionFault` if the model cannot be loaded
    pub fn load(
        loader: &dyn ModelLoader,
        wake_word: &str,
        threshold: f32,
        config: &WakeConfig,
    ) -> Result<Self> {
        let model = loader.load(wake_word)?;
        Ok(Self::new(model, wake_word, threshold, config))
    }

    /// Score one frame
    ///
    /// # Errors
    ///
    /// Returns `Error::DetectionFault` if the model fails
    pub fn score(&mut self, frame: &AudioFrame) -> Result<Option<DetectionEvent>> {
        let output = self.model.predict(frame)?.clamp(0.0, 1.0);

        if self.window.len() == self.window_len {
            self.window_sum -= self.window.pop_front().unwrap_or(0.0);
        }
        self.window.push_back(output);
        self.window_sum += output;

        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            return Ok(None);
        }

        let confidence = self.confidence();
        if self.window.len() < self.window_len || confidence <= self.threshold {
            return Ok(None);
        }

        self.cooldown_remaining = self.cooldown_frames;
        tracing::debug!(
            wake_word = %self.wake_word,
            confidence,
            seq = frame.seq(),
            "wake word detected"
        );

        Ok(Some(DetectionEvent {
            wake_word: self.wake_word.clone(),
            confidence,
            seq: frame.seq(),
        }))
    }

    /// Current smoothed confidence
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn confidence(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        (self.window_sum / self.window.len() as f32).clamp(0.0, 1.0)
    }

    /// Change the detection threshold without disturbing the window
    pub const fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Clear the window, the cool-down and the model's history
    pub fn reset(&mut self) {
        self.window.clear();
        self.window_sum = 0.0;
        self.cooldown_remaining = 0;
        self.model.reset();
    }
}
