//! TOML configuration file loading
//!
//! Supports `~/.config/homevoice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HomeVoiceConfigFile {
    /// Display name of this pipeline instance
    #[serde(default)]
    pub name: Option<String>,

    /// Gemini API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Wake word / wake phrase (e.g. "hey computer")
    #[serde(default)]
    pub wake_word: Option<String>,

    /// Detection threshold in [0, 1]
    #[serde(default)]
    pub wake_word_sensitivity: Option<f32>,

    /// Input device name (substring match)
    #[serde(default)]
    pub input_device: Option<String>,

    /// Output device name (substring match)
    #[serde(default)]
    pub output_device: Option<String>,

    /// Host TTS service used for text-only responses
    #[serde(default)]
    pub tts_service: Option<String>,

    /// Utterance end-pointing
    #[serde(default)]
    pub endpoint: EndpointFileConfig,

    /// Wake word scorer tuning
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Wake word model files
    #[serde(default)]
    pub models: ModelsFileConfig,

    /// Remote session configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Text-to-speech fallback
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// End-pointing configuration
#[derive(Debug, Default, Deserialize)]
pub struct EndpointFileConfig {
    pub silence_timeout_secs: Option<f64>,
    pub max_utterance_secs: Option<f64>,
    pub onset_timeout_secs: Option<f64>,
    pub speech_threshold: Option<f32>,
}

/// Wake word scorer configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Suppression window after a detection
    pub cooldown_secs: Option<f64>,
    /// Frames averaged into one confidence value
    pub smoothing_frames: Option<usize>,
}

/// Wake word model files
#[derive(Debug, Default, Deserialize)]
pub struct ModelsFileConfig {
    /// Directory holding the openWakeWord `.onnx` files
    pub dir: Option<PathBuf>,
    /// Use energy detection when a model cannot be loaded
    pub fallback: Option<bool>,
}

/// Remote session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub deadline_secs: Option<f64>,
    pub retry_delay_ms: Option<u64>,
}

/// Text-to-speech fallback configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Capacity of the capture → control loop frame queue
    pub frame_queue_capacity: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `HomeVoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HomeVoiceConfigFile {
    config_file_path().map_or_else(HomeVoiceConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or malformed files fall back to defaults with a warning.
pub fn load_from(path: &Path) -> HomeVoiceConfigFile {
    if !path.exists() {
        return HomeVoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HomeVoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HomeVoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/homevoice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("homevoice").join("config.toml"))
}

/// Return the default model directory: `~/.local/share/homevoice/models`
pub fn models_dir_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.data_dir().join("homevoice").join("models"))
}
