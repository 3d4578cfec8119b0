//! Utterance accumulation

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::voice::AudioFrame;

/// Why an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Contiguous silence reached the configured timeout
    SilenceTimeout,
    /// Hard cap on utterance length reached
    MaxDuration,
    /// Capture ended by a control signal
    ExplicitStop,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SilenceTimeout => "silence-timeout",
            Self::MaxDuration => "max-duration",
            Self::ExplicitStop => "explicit-stop",
        })
    }
}

/// One captured segment of speech
///
/// Frames are in capture order. Shared as `Arc<Utterance>` once handed to the
/// session client so a retry reuses the same audio.
#[derive(Debug, Clone)]
pub struct Utterance {
    frames: Vec<AudioFrame>,
    duration: Duration,
    end_reason: EndReason,
}

impl Utterance {
    /// Build an utterance from frames
    #[must_use]
    pub fn new(frames: Vec<AudioFrame>, end_reason: EndReason) -> Self {
        let duration = frames.iter().map(AudioFrame::duration).sum();
        Self {
            frames,
            duration,
            end_reason,
        }
    }

    #[must_use]
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub const fn end_reason(&self) -> EndReason {
        self.end_reason
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Sample rate of the captured audio
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.frames
            .first()
            .map_or(crate::voice::SAMPLE_RATE, AudioFrame::sample_rate)
    }

    /// Little-endian PCM chunks of up to `frames_per_chunk` frames each
    pub fn pcm_chunks(&self, frames_per_chunk: usize) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.frames
            .chunks(frames_per_chunk.max(1))
            .map(|chunk| chunk.iter().flat_map(AudioFrame::to_le_bytes).collect())
    }
}

/// Bounded accumulator for the utterance being captured
#[derive(Debug)]
pub struct UtteranceBuffer {
    frames: Vec<AudioFrame>,
    capacity: usize,
}

impl UtteranceBuffer {
    /// Create a buffer holding at most `capacity` frames
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame; returns `false` if the buffer is already full
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        if self.is_full() {
            return false;
        }
        self.frames.push(frame);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Hand the buffered frames off as an utterance, leaving the buffer empty
    pub fn take(&mut self, end_reason: EndReason) -> Utterance {
        let frames = std::mem::replace(&mut self.frames, Vec::with_capacity(self.capacity));
        Utterance::new(frames, end_reason)
    }

    /// Drop buffered frames
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
