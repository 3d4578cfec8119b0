//! Error types for the HomeVoice pipeline

use serde::Serialize;
use thiserror::Error;

/// Result type alias for HomeVoice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the HomeVoice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Input or output device missing or busy
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Wake word model could not be loaded or failed while scoring
    #[error("wake word detection fault: {0}")]
    DetectionFault(String),

    /// Utterance discarded because no speech followed the detection
    #[error("false trigger: {0}")]
    FalseTrigger(String),

    /// Streaming session exceeded its deadline
    #[error("session timed out after {0:?}")]
    SessionTimeout(std::time::Duration),

    /// Remote endpoint rejected the credentials
    #[error("session authentication failed: {0}")]
    SessionAuth(String),

    /// Transport dropped or produced garbage
    #[error("session transport error: {0}")]
    SessionTransport(String),

    /// Output device failed while playing a response
    #[error("playback error: {0}")]
    Playback(String),

    /// Operation rejected because an interaction is in progress
    #[error("pipeline busy: {0}")]
    Busy(String),

    /// Pipeline control loop is gone
    #[error("pipeline stopped")]
    PipelineStopped,

    /// HTTP API server failed to bind or stopped serving
    #[error("API server error: {0}")]
    Server(String),

    /// Audio conversion error
    #[error("audio error: {0}")]
    Audio(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse error classification reported through the status surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    DeviceUnavailable,
    DetectionFault,
    FalseTrigger,
    SessionTimeout,
    SessionAuthError,
    SessionTransportError,
    PlaybackError,
    Busy,
    Internal,
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Toml(_) => ErrorKind::Config,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::DetectionFault(_) => ErrorKind::DetectionFault,
            Self::FalseTrigger(_) => ErrorKind::FalseTrigger,
            Self::SessionTimeout(_) => ErrorKind::SessionTimeout,
            Self::SessionAuth(_) => ErrorKind::SessionAuthError,
            Self::SessionTransport(_) => ErrorKind::SessionTransportError,
            Self::Playback(_) | Self::Tts(_) => ErrorKind::PlaybackError,
            Self::Busy(_) => ErrorKind::Busy,
            Self::PipelineStopped
            | Self::Server(_)
            | Self::Audio(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error ends the current pipeline run until `restart()`
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceUnavailable(_) | Self::DetectionFault(_))
    }

    /// Whether a fresh session may be opened for the same utterance
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::SessionTimeout(_) | Self::SessionTransport(_))
    }
}
