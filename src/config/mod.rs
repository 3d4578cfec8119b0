//! Configuration management for the HomeVoice pipeline

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{Error, Result};

pub use file::HomeVoiceConfigFile;

/// Default display name
pub const DEFAULT_NAME: &str = "HomeVoice Connect";

/// Default wake phrase
pub const DEFAULT_WAKE_WORD: &str = "hey computer";

/// Default detection threshold
pub const DEFAULT_WAKE_WORD_SENSITIVITY: f32 = 0.5;

/// Default host TTS service
pub const DEFAULT_TTS_SERVICE: &str = "tts.google_translate_say";

/// Default Gemini Live model
pub const DEFAULT_SESSION_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Default Gemini Live websocket endpoint
pub const DEFAULT_SESSION_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Full daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Pipeline snapshot handed to the orchestrator
    pub pipeline: PipelineConfig,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Text-to-speech fallback for text-only responses
    pub tts: TtsConfig,

    /// Wake word model files
    pub models: ModelsConfig,
}

/// Where wake word models are loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelsConfig {
    /// Directory holding the openWakeWord `.onnx` files
    pub dir: PathBuf,

    /// Substitute energy detection when a model cannot be loaded
    pub fallback: bool,
}

/// Immutable pipeline configuration snapshot
///
/// Swapped only through an explicit reconfiguration, which the orchestrator
/// applies on entry to `Detecting`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Display name
    pub name: String,

    /// Gemini API key
    pub api_key: SecretString,

    /// Wake phrase
    pub wake_word: String,

    /// Detection threshold on normalized confidence, in [0, 1]
    pub wake_word_sensitivity: f32,

    /// Input device name; empty selects the system default
    pub input_device: String,

    /// Output device name; empty selects the system default
    pub output_device: String,

    /// Host TTS service for text-only responses
    pub tts_service: String,

    /// Utterance end-pointing
    pub endpoint: EndpointConfig,

    /// Wake word scorer tuning
    pub wake: WakeConfig,

    /// Remote session settings
    pub session: SessionConfig,

    /// Capacity of the capture → control loop queue, in frames
    pub frame_queue_capacity: usize,
}

/// Utterance end-pointing configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointConfig {
    /// Contiguous silence that ends an utterance
    pub silence_timeout: Duration,

    /// Hard cap on utterance length
    pub max_utterance: Duration,

    /// Speech must start within this lead time after a detection
    pub onset_timeout: Duration,

    /// Normalized RMS above which a frame is speech
    pub speech_threshold: f32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(2),
            max_utterance: Duration::from_secs(15),
            onset_timeout: Duration::from_secs(2),
            speech_threshold: 0.03,
        }
    }
}

/// Wake word scorer configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeConfig {
    /// Suppression window after a detection
    pub cooldown: Duration,

    /// Number of model outputs averaged into one confidence
    pub smoothing_frames: usize,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(1500),
            smoothing_frames: 3,
        }
    }
}

/// Remote conversational session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Model identifier sent during session setup
    pub model: String,

    /// Websocket endpoint
    pub endpoint: String,

    /// Overall deadline for one session
    pub deadline: Duration,

    /// Pause before the single retry
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_SESSION_MODEL.to_string(),
            endpoint: DEFAULT_SESSION_ENDPOINT.to_string(),
            deadline: Duration::from_secs(30),
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,
}

/// Text-to-speech fallback configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// `OpenAI`-compatible speech API key
    pub api_key: Option<SecretString>,

    /// TTS model (e.g. "tts-1")
    pub model: String,

    /// Voice identifier
    pub voice: String,
}

/// Partial update of the host-facing configuration fields
///
/// Mirrors the configuration form the host exposes; absent fields keep
/// their current value.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigUpdate {
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub wake_word: Option<String>,
    pub wake_word_sensitivity: Option<f32>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub tts_service: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            api_key: SecretString::from(String::new()),
            wake_word: DEFAULT_WAKE_WORD.to_string(),
            wake_word_sensitivity: DEFAULT_WAKE_WORD_SENSITIVITY,
            input_device: String::new(),
            output_device: String::new(),
            tts_service: DEFAULT_TTS_SERVICE.to_string(),
            endpoint: EndpointConfig::default(),
            wake: WakeConfig::default(),
            session: SessionConfig::default(),
            frame_queue_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Whether an API key is present
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
    }

    /// Validate ranges and relationships between fields
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        validate_sensitivity(self.wake_word_sensitivity)?;

        if self.wake_word.trim().is_empty() {
            return Err(Error::Config("wake_word must not be empty".to_string()));
        }
        if self.endpoint.silence_timeout.is_zero() {
            return Err(Error::Config("silence_timeout must be positive".to_string()));
        }
        if self.endpoint.onset_timeout.is_zero() {
            return Err(Error::Config("onset_timeout must be positive".to_string()));
        }
        if self.endpoint.max_utterance <= self.endpoint.onset_timeout {
            return Err(Error::Config(
                "max_utterance must exceed onset_timeout".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.endpoint.speech_threshold) {
            return Err(Error::Config(
                "speech_threshold must be in [0, 1)".to_string(),
            ));
        }
        if self.wake.smoothing_frames == 0 {
            return Err(Error::Config("smoothing_frames must be at least 1".to_string()));
        }
        if self.session.deadline.is_zero() {
            return Err(Error::Config("session deadline must be positive".to_string()));
        }
        if self.frame_queue_capacity == 0 {
            return Err(Error::Config(
                "frame_queue_capacity must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.session.endpoint)
            .map_err(|e| Error::Config(format!("invalid session endpoint: {e}")))?;

        Ok(())
    }

    /// Apply a partial update, returning the new snapshot
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the resulting snapshot is invalid
    pub fn with_update(&self, update: ConfigUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(name) = update.name {
            next.name = name;
        }
        if let Some(key) = update.api_key {
            next.api_key = SecretString::from(key);
        }
        if let Some(word) = update.wake_word {
            next.wake_word = normalize_wake_word(&word);
        }
        if let Some(sensitivity) = update.wake_word_sensitivity {
            next.wake_word_sensitivity = sensitivity;
        }
        if let Some(device) = update.input_device {
            next.input_device = device;
        }
        if let Some(device) = update.output_device {
            next.output_device = device;
        }
        if let Some(service) = update.tts_service {
            next.tts_service = service;
        }
        next.validate()?;
        Ok(next)
    }

    /// Whether the two snapshots would configure the pipeline identically
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn same_as(&self, other: &Self) -> bool {
        self.name == other.name
            && self.api_key.expose_secret() == other.api_key.expose_secret()
            && self.wake_word == other.wake_word
            && self.wake_word_sensitivity == other.wake_word_sensitivity
            && self.input_device == other.input_device
            && self.output_device == other.output_device
            && self.tts_service == other.tts_service
            && self.endpoint == other.endpoint
            && self.wake == other.wake
            && self.session == other.session
            && self.frame_queue_capacity == other.frame_queue_capacity
    }

    /// Whether switching to `other` requires reopening audio devices
    #[must_use]
    pub fn devices_differ(&self, other: &Self) -> bool {
        self.input_device != other.input_device || self.output_device != other.output_device
    }
}

/// Check a sensitivity value
///
/// # Errors
///
/// Returns `Error::Config` if the value is outside [0, 1] or not finite
pub fn validate_sensitivity(value: f32) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "wake_word_sensitivity must be in [0, 1], got {value}"
        )))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Lowercase and trim a wake phrase
#[must_use]
pub fn normalize_wake_word(word: &str) -> String {
    word.trim().to_lowercase()
}

impl Config {
    /// Load configuration from the standard TOML file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// Priority is env > toml > default.
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_sources(
        fc: HomeVoiceConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = PipelineConfig::default();
        let secs = |v: f64| Duration::try_from_secs_f64(v).ok();

        let api_key = env("GEMINI_API_KEY")
            .or_else(|| env("HOMEVOICE_API_KEY"))
            .or(fc.api_key)
            .unwrap_or_default();

        let wake_word_sensitivity = match env("HOMEVOICE_WAKE_WORD_SENSITIVITY") {
            Some(raw) => raw.trim().parse::<f32>().map_err(|e| {
                Error::Config(format!("HOMEVOICE_WAKE_WORD_SENSITIVITY: {e}"))
            })?,
            None => fc
                .wake_word_sensitivity
                .unwrap_or(defaults.wake_word_sensitivity),
        };

        let endpoint = EndpointConfig {
            silence_timeout: fc
                .endpoint
                .silence_timeout_secs
                .and_then(secs)
                .unwrap_or(defaults.endpoint.silence_timeout),
            max_utterance: fc
                .endpoint
                .max_utterance_secs
                .and_then(secs)
                .unwrap_or(defaults.endpoint.max_utterance),
            onset_timeout: fc
                .endpoint
                .onset_timeout_secs
                .and_then(secs)
                .unwrap_or(defaults.endpoint.onset_timeout),
            speech_threshold: fc
                .endpoint
                .speech_threshold
                .unwrap_or(defaults.endpoint.speech_threshold),
        };

        let wake = WakeConfig {
            cooldown: fc
                .wake
                .cooldown_secs
                .and_then(secs)
                .unwrap_or(defaults.wake.cooldown),
            smoothing_frames: fc
                .wake
                .smoothing_frames
                .unwrap_or(defaults.wake.smoothing_frames),
        };

        let session = SessionConfig {
            model: env("HOMEVOICE_SESSION_MODEL")
                .or(fc.session.model)
                .unwrap_or(defaults.session.model),
            endpoint: env("HOMEVOICE_SESSION_ENDPOINT")
                .or(fc.session.endpoint)
                .unwrap_or(defaults.session.endpoint),
            deadline: fc
                .session
                .deadline_secs
                .and_then(secs)
                .unwrap_or(defaults.session.deadline),
            retry_delay: fc
                .session
                .retry_delay_ms
                .map_or(defaults.session.retry_delay, Duration::from_millis),
        };

        let pipeline = PipelineConfig {
            name: env("HOMEVOICE_NAME").or(fc.name).unwrap_or(defaults.name),
            api_key: SecretString::from(api_key),
            wake_word: normalize_wake_word(
                &env("HOMEVOICE_WAKE_WORD")
                    .or(fc.wake_word)
                    .unwrap_or(defaults.wake_word),
            ),
            wake_word_sensitivity,
            input_device: env("HOMEVOICE_INPUT_DEVICE")
                .or(fc.input_device)
                .unwrap_or_default(),
            output_device: env("HOMEVOICE_OUTPUT_DEVICE")
                .or(fc.output_device)
                .unwrap_or_default(),
            tts_service: env("HOMEVOICE_TTS_SERVICE")
                .or(fc.tts_service)
                .unwrap_or(defaults.tts_service),
            endpoint,
            wake,
            session,
            frame_queue_capacity: fc
                .server
                .frame_queue_capacity
                .unwrap_or(defaults.frame_queue_capacity),
        };
        pipeline.validate()?;

        if !pipeline.has_api_key() {
            tracing::warn!("no API key configured - remote sessions will be unavailable");
        }

        // API server config (env > toml > default)
        let api_server = ApiServerConfig {
            port: env("HOMEVOICE_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(18790),
        };

        let tts = TtsConfig {
            api_key: env("OPENAI_API_KEY")
                .or(fc.tts.api_key)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: fc.tts.model.unwrap_or_else(|| "tts-1".to_string()),
            voice: fc.tts.voice.unwrap_or_else(|| "alloy".to_string()),
        };

        let models = ModelsConfig {
            dir: env("HOMEVOICE_MODELS_DIR")
                .map(PathBuf::from)
                .or(fc.models.dir)
                .or_else(file::models_dir_path)
                .unwrap_or_else(|| PathBuf::from("models")),
            fallback: match env("HOMEVOICE_MODELS_FALLBACK") {
                Some(raw) => parse_flag(&raw)
                    .ok_or_else(|| Error::Config(format!("HOMEVOICE_MODELS_FALLBACK: {raw}")))?,
                None => fc.models.fallback.unwrap_or(false),
            },
        };

        Ok(Self {
            pipeline,
            api_server,
            tts,
            models,
        })
    }
}
