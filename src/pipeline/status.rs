//! Status snapshot reported to the host

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PipelineState;
use crate::Error;
use crate::error::ErrorKind;

/// Readiness of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Readiness {
    Running,
    Ready,
    Connected,
    NotConfigured,
    Stopped,
    Error { message: String },
}

impl Readiness {
    /// Whether this is one of the ready variants
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Running | Self::Ready | Self::Connected)
    }

    pub(crate) fn error(err: &Error) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

/// Per-component readiness
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub wake_word_detector: Readiness,
    pub audio_capture: Readiness,
    pub gemini_api: Readiness,
    pub tts_output: Readiness,
}

impl Default for ComponentStatus {
    fn default() -> Self {
        Self {
            wake_word_detector: Readiness::Stopped,
            audio_capture: Readiness::Stopped,
            gemini_api: Readiness::NotConfigured,
            tts_output: Readiness::Stopped,
        }
    }
}

/// Pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    /// Interactions that opened a session
    pub total_interactions: u64,
    pub successful_interactions: u64,
    pub failed_interactions: u64,
    pub detections: u64,
    pub false_triggers: u64,
    pub sessions_opened: u64,
    pub playbacks_started: u64,
    pub playbacks_completed: u64,
    pub playbacks_interrupted: u64,
    pub playback_errors: u64,
    pub dropped_frames: u64,
    pub reconfigurations: u64,
    pub aborts: u64,
}

/// Most recent error surfaced to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LastError {
    pub(crate) fn from_error(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// Atomic view of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: PipelineState,
    pub wake_word: String,
    pub wake_word_sensitivity: f32,
    /// A configuration change is waiting for the next `detecting` entry
    pub reconfiguration_pending: bool,
    /// A component self-test holds the pipeline in `detecting`
    pub self_test_running: bool,
    pub components: ComponentStatus,
    pub metrics: Metrics,
    pub last_error: Option<LastError>,
}

impl StatusSnapshot {
    /// Snapshot before the control loop has started
    #[must_use]
    pub fn initial(name: &str, wake_word: &str, sensitivity: f32) -> Self {
        Self {
            name: name.to_string(),
            state: PipelineState::Idle,
            wake_word: wake_word.to_string(),
            wake_word_sensitivity: sensitivity,
            reconfiguration_pending: false,
            self_test_running: false,
            components: ComponentStatus::default(),
            metrics: Metrics::default(),
            last_error: None,
        }
    }
}
