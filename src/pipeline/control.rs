//! Control surface for the running pipeline
//!
//! Every change is a message into the control loop; nothing here mutates
//! pipeline state directly. Arguments are validated before they are sent.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use super::{PipelineState, StatusSnapshot};
use crate::config::{ConfigUpdate, PipelineConfig, normalize_wake_word, validate_sensitivity};
use crate::history::InteractionLog;
use crate::selftest::{SelfTestReport, SelfTestRequest};
use crate::{Error, Result};

/// Messages consumed by the control loop
#[derive(Debug)]
pub enum ControlSignal {
    /// Stop everything and start capture again with the current config
    Restart,
    /// Start capturing an utterance without a wake word
    StartListening,
    /// End the current capture now
    StopListening,
    /// Tear down the current interaction and return to detecting
    Abort,
    SetWakeWord(String),
    SetSensitivity(f32),
    /// Replace the configuration snapshot
    Reconfigure(Box<PipelineConfig>),
    /// Run a component self-test while holding `detecting`
    SelfTest {
        request: SelfTestRequest,
        reply: oneshot::Sender<Result<SelfTestReport>>,
    },
    /// Stop the control loop
    Shutdown,
}

/// Cloneable handle held by the host
#[derive(Clone)]
pub struct PipelineHandle {
    controls: mpsc::Sender<ControlSignal>,
    status: watch::Receiver<StatusSnapshot>,
    config: watch::Receiver<PipelineConfig>,
    history: Arc<InteractionLog>,
}

impl PipelineHandle {
    pub(crate) fn new(
        controls: mpsc::Sender<ControlSignal>,
        status: watch::Receiver<StatusSnapshot>,
        config: watch::Receiver<PipelineConfig>,
        history: Arc<InteractionLog>,
    ) -> Self {
        Self {
            controls,
            status,
            config,
            history,
        }
    }

    async fn send(&self, signal: ControlSignal) -> Result<()> {
        self.controls
            .send(signal)
            .await
            .map_err(|_| Error::PipelineStopped)
    }

    /// Restart capture, leaving `Idle` after a fatal error
    ///
    /// # Errors
    ///
    /// Returns `Error::PipelineStopped` if the control loop has exited
    pub async fn restart(&self) -> Result<()> {
        self.send(ControlSignal::Restart).await
    }

    /// Capture an utterance now, bypassing the wake word
    ///
    /// # Errors
    ///
    /// Returns `Error::PipelineStopped` if the control loop has exited
    pub async fn start_listening(&self) -> Result<()> {
        self.send(ControlSignal::StartListening).await
    }

    /// End the current capture, sending what was heard
    ///
    /// # Errors
    ///
    /// Returns `Error::PipelineStopped` if the control loop has exited
    pub async fn stop_listening(&self) -> Result<()> {
        self.send(ControlSignal::StopListening).await
    }

    /// Abort the current interaction
    ///
    /// # Errors
    ///
    /// Returns `Error::PipelineStopped` if the control loop has exited
    pub async fn abort(&self) -> Result<()> {
        self.send(ControlSignal::Abort).await
    }

    /// Stop the control loop
    ///
    /// # Errors
    ///
    /// Returns `Error::PipelineStopped` if the control loop has already exited
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControlSignal::Shutdown).await
    }

    /// Change the wake phrase
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty phrase
    pub async fn set_wake_word(&self, word: &str) -> Result<()> {
        let word = normalize_wake_word(word);
        if word.is_empty() {
            return Err(Error::Config("wake_word must not be empty".to_string()));
        }
        self.send(ControlSignal::SetWakeWord(word)).await
    }

    /// Change the detection threshold
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `value` is outside [0, 1]
    pub async fn set_sensitivity(&self, value: f32) -> Result<()> {
        validate_sensitivity(value)?;
        self.send(ControlSignal::SetSensitivity(value)).await
    }

    /// Replace the configuration snapshot
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the snapshot is invalid
    pub async fn reconfigure(&self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        self.send(ControlSignal::Reconfigure(Box::new(config))).await
    }

    /// Apply a partial update to the effective configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the result is invalid
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<()> {
        let next = self.config().with_update(update)?;
        self.send(ControlSignal::Reconfigure(Box::new(next))).await
    }

    /// Current status snapshot
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.status.borrow().state
    }

    /// Effective configuration, including a queued change
    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        self.config.borrow().clone()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Wait until the status satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns `Error::PipelineStopped` if the control loop exits first
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> Result<StatusSnapshot> {
        let mut rx = self.status.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| Error::PipelineStopped)?;
        Ok(snapshot.clone())
    }

    #[must_use]
    pub fn history(&self) -> &InteractionLog {
        &self.history
    }

    /// Run a component self-test
    ///
    /// The control loop starts the test only while quiescent and keeps the
    /// pipeline in `detecting` until it finishes: detections are counted but
    /// start no capture.
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` while an interaction or another self-test is in
    /// progress, or if the test is cancelled by a restart, and
    /// `Error::Config` for invalid request parameters
    pub async fn self_test(&self, request: SelfTestRequest) -> Result<SelfTestReport> {
        let (reply, response) = oneshot::channel();
        self.send(ControlSignal::SelfTest { request, reply }).await?;
        match response.await {
            Ok(result) => result,
            Err(_) if self.controls.is_closed() => Err(Error::PipelineStopped),
            Err(_) => Err(Error::Busy("self-test cancelled".to_string())),
        }
    }
}
