//! Pipeline orchestration
//!
//! Owns the interaction state machine:
//!
//! ```text
//! idle ──start──▶ detecting ──wake word──▶ capturing ──utterance──▶ streaming
//!                     ▲  ▲                    │                       │
//!                     │  └───false trigger────┘                       ▼
//!                     └──────────── done / aborted ───────────────  playing
//! ```
//!
//! A single control loop task drives every transition. The host talks to it
//! through a [`PipelineHandle`].

mod control;
mod orchestrator;
mod state;
mod status;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use control::{ControlSignal, PipelineHandle};
pub use state::PipelineState;
pub use status::{ComponentStatus, LastError, Metrics, Readiness, StatusSnapshot};

use crate::Result;
use crate::config::PipelineConfig;
use crate::history::{DEFAULT_CAPACITY, InteractionLog};
use crate::session::Connector;
use crate::voice::AudioDevices;
use crate::wake_word::ModelLoader;
use orchestrator::Orchestrator;

/// Control signals buffered before senders wait
const CONTROL_QUEUE: usize = 64;

/// External collaborators, injected so tests can script them
#[derive(Clone)]
pub struct PipelineDeps {
    pub devices: Arc<dyn AudioDevices>,
    pub models: Arc<dyn ModelLoader>,
    pub connector: Arc<dyn Connector>,
}

/// A configured pipeline that has not started yet
pub struct Pipeline {
    orchestrator: Orchestrator,
    handle: PipelineHandle,
}

impl Pipeline {
    /// Build a pipeline from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Result<Self> {
        Self::with_history(config, deps, DEFAULT_CAPACITY)
    }

    /// Like [`Pipeline::new`] with a custom interaction log size
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn with_history(
        config: PipelineConfig,
        deps: PipelineDeps,
        history_capacity: usize,
    ) -> Result<Self> {
        config.validate()?;

        let (controls_tx, controls_rx) = mpsc::channel(CONTROL_QUEUE);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::initial(
            &config.name,
            &config.wake_word,
            config.wake_word_sensitivity,
        ));
        let (config_tx, config_rx) = watch::channel(config.clone());
        let history = Arc::new(InteractionLog::new(history_capacity));

        let handle =
            PipelineHandle::new(controls_tx, status_rx, config_rx, Arc::clone(&history));
        let orchestrator =
            Orchestrator::new(config, deps, history, controls_rx, status_tx, config_tx);

        Ok(Self {
            orchestrator,
            handle,
        })
    }

    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Run the control loop on the current task
    ///
    /// Starts capture immediately and returns after shutdown.
    pub async fn run(self) {
        self.orchestrator.run().await;
    }

    /// Spawn the control loop
    #[must_use]
    pub fn spawn(self) -> (PipelineHandle, JoinHandle<()>) {
        let handle = self.handle;
        let task = tokio::spawn(self.orchestrator.run());
        (handle, task)
    }
}
