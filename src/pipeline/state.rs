//! Pipeline states

use std::fmt;

use serde::{Deserialize, Serialize};

/// Interaction lifecycle state
///
/// Exactly one is current. `Detecting` is the steady state; `Failed` is a
/// cleanup stop on the way back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Capture not running
    Idle,
    /// Listening for the wake word
    Detecting,
    /// Endpointing an utterance
    Capturing,
    /// Session open, utterance sent or response awaited
    Streaming,
    /// Response handed to playback
    Playing,
    /// Cleaning up after an unrecoverable interaction error
    Failed,
}

impl PipelineState {
    /// Whether an interaction is in progress
    #[must_use]
    pub const fn in_interaction(self) -> bool {
        matches!(
            self,
            Self::Capturing | Self::Streaming | Self::Playing | Self::Failed
        )
    }

    /// Whether configuration changes and self-tests may run now
    #[must_use]
    pub const fn is_quiescent(self) -> bool {
        matches!(self, Self::Idle | Self::Detecting)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::Capturing => "capturing",
            Self::Streaming => "streaming",
            Self::Playing => "playing",
            Self::Failed => "failed",
        })
    }
}
