//! Daemon - the main voice service
//!
//! Wires configuration, audio devices, the wake word models and the session
//! connector into a running pipeline, serves the HTTP surface next to it, and
//! shuts both down on Ctrl-C.

use std::sync::Arc;

use crate::api::ApiServerBuilder;
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::session::GeminiLiveConnector;
use crate::voice::{CpalDevices, TextToSpeech};
use crate::wake_word::OnnxModels;
use crate::{Config, Error, Result};

/// The HomeVoice daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Production collaborators: system audio, openWakeWord models, Gemini Live
    #[must_use]
    pub fn deps(&self) -> PipelineDeps {
        let tts = TextToSpeech::from_config(&self.config.tts);
        if tts.is_none() {
            tracing::info!("no TTS key configured, text-only responses cannot be spoken");
        }

        let models = &self.config.models;
        tracing::info!(
            dir = %models.dir.display(),
            fallback = models.fallback,
            "wake word models"
        );

        PipelineDeps {
            devices: Arc::new(CpalDevices::new(tts)),
            models: Arc::new(OnnxModels::new(&models.dir).with_fallback(models.fallback)),
            connector: Arc::new(GeminiLiveConnector),
        }
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the API server fails
    pub async fn run(self) -> Result<()> {
        let deps = self.deps();
        let port = self.config.api_server.port;
        let (handle, pipeline) = Pipeline::new(self.config.pipeline, deps)?.spawn();
        let mut server = ApiServerBuilder::new(handle.clone(), port).build().spawn();

        let result = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                signal.map_err(Error::Io)
            }
            served = &mut server => match served {
                Ok(result) => result,
                Err(e) => Err(Error::Server(format!("task failed: {e}"))),
            },
        };

        if let Err(e) = handle.shutdown().await {
            tracing::debug!(error = %e, "pipeline already stopped");
        }
        if let Err(e) = pipeline.await {
            tracing::warn!(error = %e, "pipeline task failed");
        }
        server.abort();

        tracing::info!("homevoice stopped");
        result
    }
}
