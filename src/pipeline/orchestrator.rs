//! The control loop
//!
//! One task owns every piece of interaction state. Frames, control signals,
//! session results and playback completions are each turned into an `Event`
//! by a single `select!` and handled one at a time, so transitions never
//! race. Network and device work runs on other tasks behind handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use uuid::Uuid;

use super::control::ControlSignal;
use super::status::{ComponentStatus, LastError, Metrics, Readiness, StatusSnapshot};
use super::{PipelineDeps, PipelineState};
use crate::config::PipelineConfig;
use crate::endpoint::{EndReason, EndpointDecision, Endpointer, Utterance};
use crate::error::ErrorKind;
use crate::history::{InteractionLog, InteractionOutcome, InteractionRecord, Trigger};
use crate::playback::{PlaybackCoordinator, PlaybackHandle, PlaybackOutcome};
use crate::selftest::{self, SelfTestReport, SelfTestRequest};
use crate::session::{ConnectParams, ResponsePayload, SessionClient};
use crate::voice::{AudioFrame, CaptureHandle, FrameReceiver, frame_queue};
use crate::wake_word::WakeWordScorer;
use crate::{Error, Result};

/// How long an aborted playback may take to acknowledge
const ABORT_GRACE: Duration = Duration::from_secs(1);

enum Event {
    Control(Option<ControlSignal>),
    Frame(Result<AudioFrame>),
    Session(std::result::Result<Result<ResponsePayload>, JoinError>),
    Playback(PlaybackOutcome),
    SelfTestDone,
}

/// Component blamed for a fatal error
#[derive(Debug, Clone, Copy)]
enum Component {
    Detector,
    Capture,
    Output,
}

/// Bookkeeping for the interaction in progress
struct Interaction {
    trigger: Trigger,
    confidence: Option<f32>,
    end_reason: Option<EndReason>,
    utterance: Duration,
    streaming_since: Option<Instant>,
    sessions_before: u64,
    counted: bool,
}

impl Interaction {
    const fn new(trigger: Trigger, confidence: Option<f32>) -> Self {
        Self {
            trigger,
            confidence,
            end_reason: None,
            utterance: Duration::ZERO,
            streaming_since: None,
            sessions_before: 0,
            counted: false,
        }
    }
}

pub(crate) struct Orchestrator {
    config: PipelineConfig,
    pending: Option<PipelineConfig>,
    deps: PipelineDeps,
    history: Arc<InteractionLog>,
    controls: mpsc::Receiver<ControlSignal>,
    status_tx: watch::Sender<StatusSnapshot>,
    config_tx: watch::Sender<PipelineConfig>,

    state: PipelineState,
    capture: Option<CaptureHandle>,
    frames: Option<FrameReceiver>,
    scorer: Option<WakeWordScorer>,
    endpointer: Endpointer,
    playback: Option<PlaybackCoordinator>,
    session: Option<JoinHandle<Result<ResponsePayload>>>,
    playing: Option<PlaybackHandle>,
    interaction: Option<Interaction>,
    self_test: Option<JoinHandle<()>>,

    metrics: Metrics,
    dropped: Arc<AtomicU64>,
    opened: Arc<AtomicU64>,
    components: ComponentStatus,
    last_error: Option<LastError>,
}

impl Orchestrator {
    pub(crate) fn new(
        config: PipelineConfig,
        deps: PipelineDeps,
        history: Arc<InteractionLog>,
        controls: mpsc::Receiver<ControlSignal>,
        status_tx: watch::Sender<StatusSnapshot>,
        config_tx: watch::Sender<PipelineConfig>,
    ) -> Self {
        let endpointer = Endpointer::new(&config.endpoint);
        Self {
            config,
            pending: None,
            deps,
            history,
            controls,
            status_tx,
            config_tx,
            state: PipelineState::Idle,
            capture: None,
            frames: None,
            scorer: None,
            endpointer,
            playback: None,
            session: None,
            playing: None,
            interaction: None,
            self_test: None,
            metrics: Metrics::default(),
            dropped: Arc::new(AtomicU64::new(0)),
            opened: Arc::new(AtomicU64::new(0)),
            components: ComponentStatus::default(),
            last_error: None,
        }
    }

    /// Run until shutdown or until every handle is dropped
    pub(crate) async fn run(mut self) {
        tracing::info!(
            name = %self.config.name,
            wake_word = %self.config.wake_word,
            sensitivity = self.config.wake_word_sensitivity,
            "pipeline starting"
        );
        self.start_capture();

        loop {
            let event = tokio::select! {
                biased;
                signal = self.controls.recv() => Event::Control(signal),
                outcome = next_playback(self.playing.as_mut()) => Event::Playback(outcome),
                joined = next_session(self.session.as_mut()) => Event::Session(joined),
                () = next_self_test(self.self_test.as_mut()) => Event::SelfTestDone,
                frame = next_frame(self.frames.as_ref()) => Event::Frame(frame),
            };

            match event {
                Event::Control(None | Some(ControlSignal::Shutdown)) => break,
                Event::Control(Some(signal)) => self.on_control(signal).await,
                Event::Playback(outcome) => self.on_playback(outcome),
                Event::Session(joined) => self.on_session(joined),
                Event::SelfTestDone => {
                    self.self_test = None;
                    tracing::debug!("self-test released the pipeline");
                }
                Event::Frame(frame) => self.on_frame(frame),
            }
            self.publish();
        }

        self.cancel_self_test();
        self.teardown_interaction();
        self.stop_capture();
        self.transition(PipelineState::Idle);
        tracing::info!("pipeline stopped");
    }

    // -- Events ---------------------------------------------------------------

    async fn on_control(&mut self, signal: ControlSignal) {
        tracing::debug!(signal = ?signal, state = %self.state, "control signal");
        match signal {
            ControlSignal::Restart => self.restart().await,
            ControlSignal::StartListening => match self.state {
                PipelineState::Idle => {
                    tracing::warn!("start_listening ignored: capture is not running");
                }
                PipelineState::Detecting if self.self_test.is_some() => {
                    tracing::warn!("start_listening ignored: self-test in progress");
                }
                PipelineState::Detecting => self.begin_capture(Trigger::Manual, None),
                _ => {
                    self.abort_interaction("pre-empted by start_listening").await;
                    if self.state == PipelineState::Detecting {
                        self.begin_capture(Trigger::Manual, None);
                    }
                }
            },
            ControlSignal::StopListening => {
                if self.state == PipelineState::Capturing {
                    match self.endpointer.stop() {
                        Some(utterance) => self.start_streaming(utterance),
                        None => {
                            tracing::debug!("capture stopped before any speech");
                            self.interaction = None;
                            self.enter_detecting();
                        }
                    }
                }
            }
            ControlSignal::Abort => self.abort_interaction("aborted").await,
            ControlSignal::SetWakeWord(word) => {
                let mut next = self.effective_config().clone();
                next.wake_word = word;
                self.request_reconfig(next);
            }
            ControlSignal::SetSensitivity(value) => {
                let mut next = self.effective_config().clone();
                next.wake_word_sensitivity = value;
                self.request_reconfig(next);
            }
            ControlSignal::Reconfigure(next) => self.request_reconfig(*next),
            ControlSignal::SelfTest { request, reply } => self.start_self_test(request, reply),
            ControlSignal::Shutdown => {}
        }
    }

    /// Run a self-test on its own task, holding `detecting` until it ends
    fn start_self_test(
        &mut self,
        request: SelfTestRequest,
        reply: oneshot::Sender<Result<SelfTestReport>>,
    ) {
        let refusal = if !self.state.is_quiescent() {
            Some(format!("pipeline is {}", self.state))
        } else if self.self_test.is_some() {
            Some("a self-test is already running".to_string())
        } else {
            None
        };
        if let Some(reason) = refusal {
            tracing::debug!(reason = %reason, "self-test refused");
            let _ = reply.send(Err(Error::Busy(reason)));
            return;
        }

        tracing::info!(component = request.component(), "self-test started");
        let deps = self.deps.clone();
        let config = self.effective_config().clone();
        self.self_test = Some(tokio::spawn(async move {
            let result = selftest::run(request, &deps, &config).await;
            let _ = reply.send(result);
        }));
    }

    fn cancel_self_test(&mut self) {
        if let Some(task) = self.self_test.take() {
            tracing::info!("self-test cancelled");
            task.abort();
        }
    }

    fn on_frame(&mut self, frame: Result<AudioFrame>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return self.fatal(Component::Capture, e),
        };

        // Scored in every state to keep the window warm
        let detection = match self.scorer.as_mut().map(|s| s.score(&frame)) {
            Some(Ok(detection)) => detection,
            Some(Err(e)) => return self.fatal(Component::Detector, e),
            None => None,
        };

        if let Some(event) = detection {
            self.metrics.detections += 1;
            if self.state == PipelineState::Detecting && self.self_test.is_some() {
                tracing::debug!(seq = event.seq, "detection held during self-test");
                return;
            }
            if self.state == PipelineState::Detecting {
                tracing::info!(
                    wake_word = %event.wake_word,
                    confidence = event.confidence,
                    seq = event.seq,
                    "wake word detected"
                );
                self.begin_capture(Trigger::WakeWord, Some(event.confidence));
                return;
            }
            tracing::debug!(state = %self.state, seq = event.seq, "detection ignored");
        }

        if self.state != PipelineState::Capturing {
            return;
        }

        match self.endpointer.push(frame) {
            EndpointDecision::Continue => {}
            EndpointDecision::FalseTrigger => {
                self.metrics.false_triggers += 1;
                tracing::info!(
                    false_triggers = self.metrics.false_triggers,
                    "no speech after detection, discarded"
                );
                self.interaction = None;
                self.enter_detecting();
            }
            EndpointDecision::Complete(utterance) => self.start_streaming(utterance),
        }
    }

    fn on_session(&mut self, joined: std::result::Result<Result<ResponsePayload>, JoinError>) {
        self.session = None;
        if self.state != PipelineState::Streaming {
            return;
        }

        let payload = match joined {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                if e.kind() == ErrorKind::SessionAuthError {
                    self.components.gemini_api = Readiness::error(&e);
                }
                return self.fail_interaction(e);
            }
            Err(e) => {
                return self.fail_interaction(Error::SessionTransport(format!(
                    "session task failed: {e}"
                )));
            }
        };

        self.components.gemini_api = Readiness::Connected;
        let text = payload.text();
        self.record_interaction(
            InteractionOutcome::Success,
            None,
            (!text.is_empty()).then_some(text),
        );
        tracing::info!(
            session = %payload.session_id,
            chunks = payload.chunks.len(),
            audio_samples = payload.audio_samples(),
            "response complete"
        );

        let Some(playback) = &self.playback else {
            self.interaction = None;
            self.enter_detecting();
            return;
        };
        self.metrics.playbacks_started += 1;
        self.playing = Some(playback.start(payload));
        self.transition(PipelineState::Playing);
    }

    fn on_playback(&mut self, outcome: PlaybackOutcome) {
        self.playing = None;
        let failed = self.count_playback(outcome);
        self.interaction = None;
        if failed {
            self.transition(PipelineState::Failed);
        }
        self.enter_detecting();
    }

    // -- Transitions ----------------------------------------------------------

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "pipeline state changed");
            self.state = next;
        }
        self.publish();
    }

    fn enter_detecting(&mut self) {
        self.endpointer.reset();
        self.transition(PipelineState::Detecting);
        if let Some(next) = self.pending.take() {
            tracing::info!("applying queued reconfiguration");
            self.apply_config(next);
        }
    }

    fn begin_capture(&mut self, trigger: Trigger, confidence: Option<f32>) {
        self.endpointer.reset();
        self.interaction = Some(Interaction::new(trigger, confidence));
        self.transition(PipelineState::Capturing);
    }

    fn start_streaming(&mut self, utterance: Utterance) {
        if utterance.is_empty() {
            self.interaction = None;
            self.enter_detecting();
            return;
        }

        tracing::info!(
            end_reason = %utterance.end_reason(),
            duration_ms = duration_ms(utterance.duration()),
            frames = utterance.frames().len(),
            "utterance captured"
        );

        let interaction = self
            .interaction
            .get_or_insert_with(|| Interaction::new(Trigger::Manual, None));
        interaction.end_reason = Some(utterance.end_reason());
        interaction.utterance = utterance.duration();
        interaction.streaming_since = Some(Instant::now());
        interaction.sessions_before = self.opened.load(Ordering::Relaxed);
        self.metrics.total_interactions += 1;

        let client = SessionClient::new(
            Arc::clone(&self.deps.connector),
            ConnectParams {
                api_key: self.config.api_key.clone(),
                config: self.config.session.clone(),
            },
            Arc::clone(&self.opened),
        );
        let utterance = Arc::new(utterance);
        self.session = Some(tokio::spawn(
            async move { client.run_with_retry(utterance).await },
        ));
        self.transition(PipelineState::Streaming);
    }

    /// Unrecoverable interaction error: count it, clean up, keep listening
    fn fail_interaction(&mut self, error: Error) {
        tracing::warn!(error = %error, kind = ?error.kind(), "interaction failed");
        self.last_error = Some(LastError::from_error(&error));
        self.record_interaction(
            InteractionOutcome::Failed,
            Some((Some(error.kind()), error.to_string())),
            None,
        );
        self.transition(PipelineState::Failed);
        self.teardown_interaction();
        self.enter_detecting();
    }

    /// Tear down the current interaction and return to `Detecting`
    async fn abort_interaction(&mut self, reason: &str) {
        match self.state {
            PipelineState::Idle | PipelineState::Detecting | PipelineState::Failed => return,
            PipelineState::Capturing => {}
            PipelineState::Streaming => {
                if let Some(task) = self.session.take() {
                    task.abort();
                }
                self.record_interaction(
                    InteractionOutcome::Failed,
                    Some((None, reason.to_string())),
                    None,
                );
            }
            PipelineState::Playing => {
                if let Some(mut handle) = self.playing.take() {
                    handle.abort();
                    match tokio::time::timeout(ABORT_GRACE, handle.finished()).await {
                        Ok(outcome) => {
                            self.count_playback(outcome);
                        }
                        Err(_) => {
                            tracing::warn!("playback did not acknowledge abort in time");
                            self.metrics.playbacks_interrupted += 1;
                        }
                    }
                }
            }
        }

        self.metrics.aborts += 1;
        tracing::info!(state = %self.state, reason, "interaction aborted");
        self.teardown_interaction();
        self.enter_detecting();
    }

    /// Drop every per-interaction resource
    fn teardown_interaction(&mut self) {
        if let Some(task) = self.session.take() {
            task.abort();
        }
        if let Some(mut handle) = self.playing.take() {
            handle.abort();
        }
        self.endpointer.reset();
        self.interaction = None;
    }

    /// Returns `true` if playback failed
    fn count_playback(&mut self, outcome: PlaybackOutcome) -> bool {
        match outcome {
            PlaybackOutcome::Completed => {
                self.metrics.playbacks_completed += 1;
                false
            }
            PlaybackOutcome::Interrupted => {
                self.metrics.playbacks_interrupted += 1;
                false
            }
            PlaybackOutcome::Failed(e) => {
                tracing::warn!(error = %e, "playback failed");
                self.metrics.playback_errors += 1;
                self.last_error = Some(LastError::from_error(&e));
                true
            }
        }
    }

    /// Count the interaction's outcome once and log it
    fn record_interaction(
        &mut self,
        outcome: InteractionOutcome,
        error: Option<(Option<ErrorKind>, String)>,
        response_text: Option<String>,
    ) {
        let Some(interaction) = self.interaction.as_mut() else {
            return;
        };
        let Some(end_reason) = interaction.end_reason else {
            return;
        };
        if interaction.counted {
            return;
        }
        interaction.counted = true;

        match outcome {
            InteractionOutcome::Success => self.metrics.successful_interactions += 1,
            InteractionOutcome::Failed => self.metrics.failed_interactions += 1,
        }

        let sessions = self
            .opened
            .load(Ordering::Relaxed)
            .saturating_sub(interaction.sessions_before);
        let (error_kind, error) = error.map_or((None, None), |(k, m)| (k, Some(m)));

        self.history.record(InteractionRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            trigger: interaction.trigger,
            wake_word: self.config.wake_word.clone(),
            sensitivity: self.config.wake_word_sensitivity,
            confidence: interaction.confidence,
            end_reason,
            utterance_ms: duration_ms(interaction.utterance),
            sessions: u32::try_from(sessions).unwrap_or(u32::MAX),
            response_text,
            response_time_ms: match outcome {
                InteractionOutcome::Success => interaction
                    .streaming_since
                    .map(|since| duration_ms(since.elapsed())),
                InteractionOutcome::Failed => None,
            },
            outcome,
            error_kind,
            error,
        });
    }

    // -- Capture --------------------------------------------------------------

    async fn restart(&mut self) {
        tracing::info!(state = %self.state, "restarting pipeline");
        self.cancel_self_test();
        self.abort_interaction("restart").await;
        self.stop_capture();
        if let Some(next) = self.pending.take() {
            self.apply_config(next);
        }
        self.last_error = None;
        self.start_capture();
    }

    /// Load the model, open devices and enter `Detecting`
    fn start_capture(&mut self) {
        self.components.gemini_api = if self.config.has_api_key() {
            Readiness::Connected
        } else {
            Readiness::NotConfigured
        };

        match WakeWordScorer::load(
            self.deps.models.as_ref(),
            &self.config.wake_word,
            self.config.wake_word_sensitivity,
            &self.config.wake,
        ) {
            Ok(scorer) => self.scorer = Some(scorer),
            Err(e) => return self.fatal(Component::Detector, e),
        }

        match self.deps.devices.open_output(&self.config.output_device) {
            Ok(sink) => {
                self.playback = Some(PlaybackCoordinator::new(sink, &self.config.tts_service));
                self.components.tts_output = if self.config.tts_service.trim().is_empty() {
                    Readiness::NotConfigured
                } else {
                    Readiness::Ready
                };
            }
            Err(e) => return self.fatal(Component::Output, e),
        }

        let (sender, receiver) =
            frame_queue(self.config.frame_queue_capacity, Arc::clone(&self.dropped));
        match self.deps.devices.open_input(&self.config.input_device, sender) {
            Ok(handle) => {
                self.capture = Some(handle);
                self.frames = Some(receiver);
            }
            Err(e) => return self.fatal(Component::Capture, e),
        }

        self.components.wake_word_detector = Readiness::Running;
        self.components.audio_capture = Readiness::Ready;
        self.endpointer = Endpointer::new(&self.config.endpoint);
        tracing::info!(
            input = %self.config.input_device,
            output = %self.config.output_device,
            wake_word = %self.config.wake_word,
            "listening"
        );
        self.enter_detecting();
    }

    fn stop_capture(&mut self) {
        self.frames = None;
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        self.scorer = None;
        self.playback = None;
        self.components.wake_word_detector = Readiness::Stopped;
        self.components.audio_capture = Readiness::Stopped;
        self.components.tts_output = Readiness::Stopped;
    }

    /// Device or model failure: stop until `restart()`
    fn fatal(&mut self, component: Component, error: Error) {
        tracing::error!(component = ?component, error = %error, "pipeline stopped by fatal error");

        if self.state == PipelineState::Streaming {
            self.record_interaction(
                InteractionOutcome::Failed,
                Some((Some(error.kind()), error.to_string())),
                None,
            );
        }
        self.teardown_interaction();
        self.stop_capture();

        let readiness = Readiness::error(&error);
        match component {
            Component::Detector => self.components.wake_word_detector = readiness,
            Component::Capture => self.components.audio_capture = readiness,
            Component::Output => self.components.tts_output = readiness,
        }
        self.last_error = Some(LastError::from_error(&error));
        self.transition(PipelineState::Idle);
    }

    // -- Reconfiguration ------------------------------------------------------

    fn effective_config(&self) -> &PipelineConfig {
        self.pending.as_ref().unwrap_or(&self.config)
    }

    fn request_reconfig(&mut self, next: PipelineConfig) {
        if self.effective_config().same_as(&next) {
            tracing::debug!("reconfiguration matches current config, ignored");
            return;
        }

        if self.state.is_quiescent() {
            self.pending = None;
            self.apply_config(next);
        } else {
            tracing::info!(state = %self.state, "reconfiguration queued until detecting");
            self.pending = Some(next);
        }
    }

    /// Swap the snapshot; only called while `Idle` or `Detecting`
    fn apply_config(&mut self, next: PipelineConfig) {
        if self.config.same_as(&next) {
            return;
        }
        self.metrics.reconfigurations += 1;
        let previous = std::mem::replace(&mut self.config, next);
        tracing::info!(
            wake_word = %self.config.wake_word,
            sensitivity = self.config.wake_word_sensitivity,
            "configuration applied"
        );

        self.endpointer = Endpointer::new(&self.config.endpoint);
        if previous.has_api_key() != self.config.has_api_key()
            || !matches!(self.components.gemini_api, Readiness::Connected)
        {
            self.components.gemini_api = if self.config.has_api_key() {
                Readiness::Connected
            } else {
                Readiness::NotConfigured
            };
        }

        if self.state == PipelineState::Idle {
            return;
        }

        if previous.devices_differ(&self.config)
            || previous.frame_queue_capacity != self.config.frame_queue_capacity
        {
            self.stop_capture();
            self.start_capture();
            return;
        }

        if previous.wake_word != self.config.wake_word || previous.wake != self.config.wake {
            match WakeWordScorer::load(
                self.deps.models.as_ref(),
                &self.config.wake_word,
                self.config.wake_word_sensitivity,
                &self.config.wake,
            ) {
                Ok(scorer) => self.scorer = Some(scorer),
                Err(e) => return self.fatal(Component::Detector, e),
            }
        } else if let Some(scorer) = self.scorer.as_mut() {
            scorer.set_threshold(self.config.wake_word_sensitivity);
        }

        if let Some(playback) = self.playback.as_mut() {
            playback.set_tts_service(&self.config.tts_service);
        }
    }

    // -- Status ---------------------------------------------------------------

    fn publish(&mut self) {
        self.metrics.dropped_frames = self.dropped.load(Ordering::Relaxed);
        self.metrics.sessions_opened = self.opened.load(Ordering::Relaxed);

        let effective = self.effective_config();
        if !self.config_tx.borrow().same_as(effective) {
            self.config_tx.send_replace(effective.clone());
        }

        let snapshot = StatusSnapshot {
            name: self.config.name.clone(),
            state: self.state,
            wake_word: self.config.wake_word.clone(),
            wake_word_sensitivity: self.config.wake_word_sensitivity,
            reconfiguration_pending: self.pending.is_some(),
            self_test_running: self.self_test.is_some(),
            components: self.components.clone(),
            metrics: self.metrics.clone(),
            last_error: self.last_error.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn next_frame(frames: Option<&FrameReceiver>) -> Result<AudioFrame> {
    match frames {
        Some(frames) => frames.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_session(
    task: Option<&mut JoinHandle<Result<ResponsePayload>>>,
) -> std::result::Result<Result<ResponsePayload>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_self_test(task: Option<&mut JoinHandle<()>>) {
    match task {
        Some(task) => {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "self-test task failed");
            }
        }
        None => std::future::pending().await,
    }
}

async fn next_playback(handle: Option<&mut PlaybackHandle>) -> PlaybackOutcome {
    match handle {
        Some(handle) => handle.finished().await,
        None => std::future::pending().await,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
