//! Pipeline integration tests
//!
//! Drive the control loop end to end with scripted devices, marker wake word
//! models and scripted sessions.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use homevoice::config::ConfigUpdate;
use homevoice::endpoint::EndReason;
use homevoice::error::ErrorKind;
use homevoice::history::{InteractionOutcome, Trigger};
use homevoice::pipeline::Readiness;
use homevoice::selftest::{SelfTestRequest, synthetic_wake_sample};
use homevoice::{Error, Pipeline, PipelineConfig, PipelineHandle, PipelineState, StatusSnapshot};
use tokio::task::JoinHandle;

mod common;
use common::{
    MarkerModels, Outcome, Script, ScriptedConnector, ScriptedDevices, deps, test_config,
};

fn start(
    config: PipelineConfig,
    devices: &Arc<ScriptedDevices>,
    models: &Arc<MarkerModels>,
    connector: &Arc<ScriptedConnector>,
) -> (PipelineHandle, JoinHandle<()>) {
    Pipeline::new(config, deps(devices, models, connector))
        .unwrap()
        .spawn()
}

async fn wait_until(
    handle: &PipelineHandle,
    what: &str,
    predicate: impl FnMut(&StatusSnapshot) -> bool,
) -> StatusSnapshot {
    tokio::time::timeout(Duration::from_secs(30), handle.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}: {:?}", handle.status()))
        .unwrap()
}

fn interaction() -> Script {
    Script::new().silence(3).wake().speech(20).silence(12)
}

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-6
}

// -- Interactions ------------------------------------------------------------

#[tokio::test]
async fn detection_without_speech_is_false_trigger() {
    let devices = ScriptedDevices::with_script(Script::new().wake().silence(15).build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "false trigger", |s| {
        s.metrics.false_triggers == 1 && s.state == PipelineState::Detecting
    })
    .await;

    assert_eq!(status.metrics.detections, 1);
    assert_eq!(status.metrics.total_interactions, 0);
    assert_eq!(connector.connects(), 0);
    assert!(handle.history().is_empty());
}

#[tokio::test]
async fn full_interaction_plays_response_in_order() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "playback", |s| {
        s.metrics.playbacks_completed == 1 && s.state == PipelineState::Detecting
    })
    .await;

    assert_eq!(status.metrics.total_interactions, 1);
    assert_eq!(status.metrics.successful_interactions, 1);
    assert_eq!(status.metrics.failed_interactions, 0);
    assert_eq!(status.metrics.sessions_opened, 1);
    assert_eq!(devices.sink.played(), vec![2400, 1200]);
    // 20 voiced frames of 480 samples, 2 bytes each
    assert_eq!(connector.bytes_sent.load(Ordering::SeqCst), 20 * 480 * 2);

    let records = handle.history().recent(10);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.outcome, InteractionOutcome::Success);
    assert_eq!(record.trigger, Trigger::WakeWord);
    assert_eq!(record.end_reason, EndReason::SilenceTimeout);
    assert_eq!(record.utterance_ms, 600);
    assert_eq!(record.sessions, 1);
    assert_eq!(record.response_text.as_deref(), Some("It is sunny."));
    assert_eq!(record.confidence, Some(1.0));
}

#[tokio::test]
async fn text_only_response_is_spoken() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Respond(vec![
        homevoice::session::ServerEvent::Text("Lights are off.".into()),
        homevoice::session::ServerEvent::TurnComplete,
    ])]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "playback", |s| s.metrics.playbacks_completed == 1).await;

    assert!(devices.sink.played().is_empty());
    assert_eq!(
        *devices.sink.spoken.lock().unwrap(),
        vec!["Lights are off.".to_string()]
    );
}

#[tokio::test]
async fn consecutive_interactions_each_complete() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    for n in 1..=3 {
        devices.feed(interaction().build());
        wait_until(&handle, "interaction", |s| {
            s.metrics.playbacks_completed == n && s.state == PipelineState::Detecting
        })
        .await;
    }

    let status = handle.status();
    assert_eq!(status.metrics.total_interactions, 3);
    assert_eq!(status.metrics.successful_interactions, 3);
    assert_eq!(handle.history().len(), 3);
}

#[tokio::test]
async fn detection_during_interaction_is_ignored() {
    let devices = ScriptedDevices::with_script(interaction().wake().silence(3).build());
    devices.hang_playback.store(true, Ordering::SeqCst);
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "playing", |s| {
        s.state == PipelineState::Playing && s.metrics.detections == 2
    })
    .await;

    assert_eq!(status.metrics.total_interactions, 1);
    assert_eq!(connector.connects(), 1);
}

// -- Session failures --------------------------------------------------------

#[tokio::test]
async fn transport_drop_retries_once_with_same_utterance() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Drop]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "playback", |s| s.metrics.playbacks_completed == 1).await;

    assert_eq!(connector.connects(), 2);
    assert_eq!(status.metrics.sessions_opened, 2);
    assert_eq!(status.metrics.successful_interactions, 1);
    assert_eq!(status.metrics.failed_interactions, 0);
    assert_eq!(
        connector.bytes_sent.load(Ordering::SeqCst),
        2 * 20 * 480 * 2
    );
    assert_eq!(handle.history().recent(1)[0].sessions, 2);
}

#[tokio::test]
async fn second_transport_failure_fails_interaction() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Drop, Outcome::Drop]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "failure", |s| {
        s.metrics.failed_interactions == 1 && s.state == PipelineState::Detecting
    })
    .await;

    assert_eq!(connector.connects(), 2);
    assert_eq!(status.metrics.playbacks_started, 0);
    assert_eq!(
        status.last_error.map(|e| e.kind),
        Some(ErrorKind::SessionTransportError)
    );

    let record = &handle.history().recent(1)[0];
    assert_eq!(record.outcome, InteractionOutcome::Failed);
    assert_eq!(record.error_kind, Some(ErrorKind::SessionTransportError));
}

#[tokio::test]
async fn auth_error_is_not_retried() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Refuse(|| {
        Error::SessionAuth("API key not valid".into())
    })]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "failure", |s| s.metrics.failed_interactions == 1).await;

    assert_eq!(connector.connects(), 1);
    assert!(matches!(status.components.gemini_api, Readiness::Error { .. }));
}

#[tokio::test(start_paused = true)]
async fn hung_session_times_out_and_retries() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Hang, Outcome::Hang]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "failure", |s| {
        s.metrics.failed_interactions == 1 && s.state == PipelineState::Detecting
    })
    .await;

    assert_eq!(connector.connects(), 2);
    assert_eq!(
        status.last_error.map(|e| e.kind),
        Some(ErrorKind::SessionTimeout)
    );
}

// -- Host control ------------------------------------------------------------

#[tokio::test]
async fn start_listening_bypasses_wake_word() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    handle.start_listening().await.unwrap();
    wait_until(&handle, "capturing", |s| s.state == PipelineState::Capturing).await;

    devices.feed(Script::new().speech(20).silence(12).build());
    let status = wait_until(&handle, "playback", |s| s.metrics.playbacks_completed == 1).await;

    assert_eq!(status.metrics.detections, 0);
    let record = &handle.history().recent(1)[0];
    assert_eq!(record.trigger, Trigger::Manual);
    assert_eq!(record.confidence, None);
}

#[tokio::test]
async fn stop_listening_sends_what_was_heard() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    handle.start_listening().await.unwrap();
    wait_until(&handle, "capturing", |s| s.state == PipelineState::Capturing).await;

    devices.feed(Script::new().speech(8).build());
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.stop_listening().await.unwrap();

    wait_until(&handle, "playback", |s| s.metrics.playbacks_completed == 1).await;
    let record = &handle.history().recent(1)[0];
    assert_eq!(record.end_reason, EndReason::ExplicitStop);
    assert_eq!(record.utterance_ms, 240);
}

#[tokio::test]
async fn utterance_is_capped_at_max_duration() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    handle.start_listening().await.unwrap();
    wait_until(&handle, "capturing", |s| s.state == PipelineState::Capturing).await;

    devices.feed(Script::new().speech(120).build());
    wait_until(&handle, "playback", |s| s.metrics.playbacks_completed == 1).await;

    let record = &handle.history().recent(1)[0];
    assert_eq!(record.end_reason, EndReason::MaxDuration);
    assert_eq!(record.utterance_ms, 3000);
}

#[tokio::test]
async fn abort_during_playback_interrupts_output() {
    let devices = ScriptedDevices::with_script(interaction().build());
    devices.hang_playback.store(true, Ordering::SeqCst);
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "playing", |s| s.state == PipelineState::Playing).await;
    handle.abort().await.unwrap();

    let status = wait_until(&handle, "aborted", |s| {
        s.metrics.aborts == 1 && s.state == PipelineState::Detecting
    })
    .await;

    assert_eq!(status.metrics.playbacks_interrupted, 1);
    assert_eq!(status.metrics.playbacks_completed, 0);
    assert_eq!(status.metrics.successful_interactions, 1);
    assert_eq!(devices.sink.interrupts.load(Ordering::SeqCst), 1);
    assert!(devices.sink.played().is_empty());
}

#[tokio::test]
async fn abort_during_streaming_fails_interaction() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Hang]);
    let mut config = test_config();
    config.session.deadline = Duration::from_secs(30);
    let (handle, _task) = start(config, &devices, &models, &connector);

    wait_until(&handle, "streaming", |s| s.state == PipelineState::Streaming).await;
    handle.abort().await.unwrap();

    let status = wait_until(&handle, "aborted", |s| {
        s.metrics.aborts == 1 && s.state == PipelineState::Detecting
    })
    .await;
    assert_eq!(status.metrics.total_interactions, 1);
    assert_eq!(status.metrics.failed_interactions, 1);
    assert_eq!(status.metrics.successful_interactions, 0);
    assert_eq!(status.metrics.playbacks_started, 0);
    assert_eq!(connector.connects(), 1);

    let record = &handle.history().recent(1)[0];
    assert_eq!(record.outcome, InteractionOutcome::Failed);
    assert_eq!(record.trigger, Trigger::WakeWord);
    assert_eq!(record.error.as_deref(), Some("aborted"));
    assert_eq!(record.error_kind, None);

    // The next wake word starts a fresh interaction
    devices.feed(interaction().build());
    let status = wait_until(&handle, "next interaction", |s| {
        s.metrics.playbacks_completed == 1
    })
    .await;
    assert_eq!(status.metrics.total_interactions, 2);
    assert_eq!(status.metrics.successful_interactions, 1);
    assert_eq!(status.metrics.failed_interactions, 1);
}

#[tokio::test]
async fn start_listening_preempts_streaming_interaction() {
    let devices = ScriptedDevices::with_script(interaction().build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Hang]);
    let mut config = test_config();
    config.session.deadline = Duration::from_secs(30);
    let (handle, _task) = start(config, &devices, &models, &connector);

    wait_until(&handle, "streaming", |s| s.state == PipelineState::Streaming).await;
    handle.start_listening().await.unwrap();

    let status = wait_until(&handle, "manual capture", |s| {
        s.state == PipelineState::Capturing && s.metrics.aborts == 1
    })
    .await;
    assert_eq!(status.metrics.total_interactions, 1);
    assert_eq!(status.metrics.failed_interactions, 1);

    devices.feed(Script::new().speech(20).silence(12).build());
    let status = wait_until(&handle, "manual interaction", |s| {
        s.metrics.playbacks_completed == 1 && s.state == PipelineState::Detecting
    })
    .await;
    assert_eq!(status.metrics.detections, 1);
    assert_eq!(status.metrics.total_interactions, 2);
    assert_eq!(status.metrics.successful_interactions, 1);
    assert_eq!(connector.connects(), 2);

    let records = handle.history().recent(2);
    assert_eq!(records[0].trigger, Trigger::Manual);
    assert_eq!(records[0].outcome, InteractionOutcome::Success);
    assert_eq!(records[1].trigger, Trigger::WakeWord);
    assert_eq!(records[1].error.as_deref(), Some("pre-empted by start_listening"));
}

#[tokio::test]
async fn abort_during_capture_only_counts_abort() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    handle.start_listening().await.unwrap();
    wait_until(&handle, "capturing", |s| s.state == PipelineState::Capturing).await;
    handle.abort().await.unwrap();

    let status = wait_until(&handle, "aborted", |s| {
        s.metrics.aborts == 1 && s.state == PipelineState::Detecting
    })
    .await;
    assert_eq!(status.metrics.total_interactions, 0);
    assert_eq!(status.metrics.failed_interactions, 0);
}

#[tokio::test]
async fn playback_failure_returns_to_detecting() {
    let devices = ScriptedDevices::with_script(interaction().build());
    devices.fail_playback.store(true, Ordering::SeqCst);
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    let status = wait_until(&handle, "playback error", |s| {
        s.metrics.playback_errors == 1 && s.state == PipelineState::Detecting
    })
    .await;

    assert_eq!(status.metrics.successful_interactions, 1);
    assert_eq!(
        status.last_error.map(|e| e.kind),
        Some(ErrorKind::PlaybackError)
    );
}

// -- Reconfiguration ---------------------------------------------------------

#[tokio::test]
async fn repeated_reconfiguration_is_idempotent() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    handle.set_sensitivity(0.7).await.unwrap();
    handle.set_sensitivity(0.7).await.unwrap();
    handle.set_wake_word("Hey Jarvis").await.unwrap();

    let status = wait_until(&handle, "wake word change", |s| s.wake_word == "hey jarvis").await;

    assert_eq!(status.metrics.reconfigurations, 2);
    assert!(close(status.wake_word_sensitivity, 0.7));
    assert_eq!(models.loads(), 2);
    assert_eq!(devices.inputs_opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconfiguration_waits_for_detecting() {
    let devices = ScriptedDevices::with_script(interaction().build());
    devices.hang_playback.store(true, Ordering::SeqCst);
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "playing", |s| s.state == PipelineState::Playing).await;
    handle.set_sensitivity(0.8).await.unwrap();

    let status = wait_until(&handle, "queued", |s| s.reconfiguration_pending).await;
    assert!(close(status.wake_word_sensitivity, 0.5));
    assert!(close(handle.config().wake_word_sensitivity, 0.8));

    handle.abort().await.unwrap();
    let status = wait_until(&handle, "applied", |s| {
        s.state == PipelineState::Detecting && !s.reconfiguration_pending
    })
    .await;
    assert!(close(status.wake_word_sensitivity, 0.8));
    assert_eq!(status.metrics.reconfigurations, 1);
}

#[tokio::test]
async fn device_change_reopens_capture() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    handle
        .update_config(ConfigUpdate {
            input_device: Some("USB Mic".into()),
            ..ConfigUpdate::default()
        })
        .await
        .unwrap();

    let status = wait_until(&handle, "reconfigured", |s| s.metrics.reconfigurations == 1).await;
    assert_eq!(status.state, PipelineState::Detecting);
    assert_eq!(devices.inputs_opened.load(Ordering::SeqCst), 2);
    assert_eq!(devices.outputs_opened.load(Ordering::SeqCst), 2);
    assert_eq!(handle.config().input_device, "USB Mic");
}

#[tokio::test]
async fn invalid_sensitivity_is_rejected() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    assert!(matches!(
        handle.set_sensitivity(1.5).await,
        Err(Error::Config(_))
    ));
    assert!(matches!(handle.set_wake_word("  ").await, Err(Error::Config(_))));
}

// -- Faults ------------------------------------------------------------------

#[tokio::test]
async fn unplugged_input_stops_until_restart() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    devices.unplug();

    let status = wait_until(&handle, "idle", |s| s.state == PipelineState::Idle).await;
    assert!(matches!(status.components.audio_capture, Readiness::Error { .. }));
    assert_eq!(
        status.last_error.map(|e| e.kind),
        Some(ErrorKind::DeviceUnavailable)
    );

    handle.restart().await.unwrap();
    let status = wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    assert_eq!(status.components.audio_capture, Readiness::Ready);
    assert_eq!(devices.inputs_opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn model_load_failure_leaves_pipeline_idle() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let config = PipelineConfig {
        wake_word: "broken".into(),
        ..test_config()
    };
    let (handle, _task) = start(config, &devices, &models, &connector);

    let status = wait_until(&handle, "detector error", |s| {
        matches!(s.components.wake_word_detector, Readiness::Error { .. })
    })
    .await;
    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(devices.inputs_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn overflowing_queue_counts_dropped_frames() {
    let devices = ScriptedDevices::with_script(Script::new().silence(20).build());
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let config = PipelineConfig {
        frame_queue_capacity: 4,
        ..test_config()
    };
    let (handle, _task) = start(config, &devices, &models, &connector);

    wait_until(&handle, "dropped", |s| s.metrics.dropped_frames == 16).await;
}

#[tokio::test]
async fn missing_api_key_reports_not_configured() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let config = PipelineConfig {
        api_key: secrecy::SecretString::from(String::new()),
        ..test_config()
    };
    let (handle, _task) = start(config, &devices, &models, &connector);

    let status = wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    assert_eq!(status.components.gemini_api, Readiness::NotConfigured);
}

#[tokio::test]
async fn shutdown_stops_control_loop() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(handle.state(), PipelineState::Idle);
    assert!(matches!(handle.restart().await, Err(Error::PipelineStopped)));
}

// -- Self-tests --------------------------------------------------------------

#[tokio::test]
async fn self_tests_run_when_quiescent() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;

    let report = handle
        .self_test(SelfTestRequest::WakeWord {
            wake_word: None,
            sensitivity: None,
            sample: Some(Script::new().silence(2).wake().build()),
        })
        .await
        .unwrap();
    assert!(report.success, "{}", report.message);

    // The synthetic sample carries no marker frame
    let report = handle
        .self_test(SelfTestRequest::WakeWord {
            wake_word: None,
            sensitivity: None,
            sample: Some(synthetic_wake_sample()),
        })
        .await
        .unwrap();
    assert!(!report.success);

    // Without a recording the test only checks that the model runs
    let report = handle
        .self_test(SelfTestRequest::WakeWord {
            wake_word: Some("Alexa".into()),
            sensitivity: None,
            sample: None,
        })
        .await
        .unwrap();
    assert!(report.success, "{}", report.message);
    assert!(report.message.contains("model alexa loaded"), "{}", report.message);

    let report = handle
        .self_test(SelfTestRequest::GeminiApi { api_key: None })
        .await
        .unwrap();
    assert!(report.success, "{}", report.message);
    assert_eq!(connector.connects(), 1);

    let report = handle
        .self_test(SelfTestRequest::Tts {
            output_device: None,
            tts_service: None,
        })
        .await
        .unwrap();
    assert!(report.success, "{}", report.message);
    assert_eq!(devices.sink.played(), vec![7200]);

    let result = handle
        .self_test(SelfTestRequest::WakeWord {
            wake_word: None,
            sensitivity: Some(2.0),
            sample: None,
        })
        .await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn self_test_capture_reports_missing_device() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    devices.fail_input.store(true, Ordering::SeqCst);

    let report = handle
        .self_test(SelfTestRequest::AudioCapture {
            input_device: Some("Nope".into()),
        })
        .await
        .unwrap();
    assert!(!report.success);
    assert!(report.message.contains("Nope"));
}

#[tokio::test]
async fn self_test_holds_detecting_until_finished() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Stall]);
    let mut config = test_config();
    config.session.deadline = Duration::from_secs(1);
    let (handle, _task) = start(config, &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    let running = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .self_test(SelfTestRequest::GeminiApi { api_key: None })
                .await
        })
    };
    wait_until(&handle, "self-test running", |s| s.self_test_running).await;

    let second = handle
        .self_test(SelfTestRequest::Tts {
            output_device: None,
            tts_service: None,
        })
        .await;
    assert!(matches!(second, Err(Error::Busy(_))));

    // A wake word during the test is counted but starts no capture
    devices.feed(interaction().build());
    let status = wait_until(&handle, "held detection", |s| s.metrics.detections == 1).await;
    assert_eq!(status.state, PipelineState::Detecting);
    handle.start_listening().await.unwrap();

    let report = running.await.unwrap().unwrap();
    assert!(!report.success);
    assert!(report.message.contains("timed out"), "{}", report.message);

    let status = wait_until(&handle, "released", |s| !s.self_test_running).await;
    assert_eq!(status.state, PipelineState::Detecting);
    assert_eq!(status.metrics.total_interactions, 0);
    assert_eq!(connector.connects(), 1);

    devices.feed(interaction().build());
    let status = wait_until(&handle, "interaction after test", |s| {
        s.metrics.playbacks_completed == 1
    })
    .await;
    assert_eq!(status.metrics.detections, 2);
}

#[tokio::test]
async fn restart_cancels_running_self_test() {
    let devices = ScriptedDevices::new();
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![Outcome::Stall]);
    let mut config = test_config();
    config.session.deadline = Duration::from_secs(30);
    let (handle, _task) = start(config, &devices, &models, &connector);

    wait_until(&handle, "detecting", |s| s.state == PipelineState::Detecting).await;
    let running = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .self_test(SelfTestRequest::GeminiApi { api_key: None })
                .await
        })
    };
    wait_until(&handle, "self-test running", |s| s.self_test_running).await;
    handle.restart().await.unwrap();

    assert!(matches!(running.await.unwrap(), Err(Error::Busy(_))));
    wait_until(&handle, "released", |s| {
        !s.self_test_running && s.state == PipelineState::Detecting
    })
    .await;
}

#[tokio::test]
async fn self_test_is_rejected_while_busy() {
    let devices = ScriptedDevices::with_script(interaction().build());
    devices.hang_playback.store(true, Ordering::SeqCst);
    let models = MarkerModels::new();
    let connector = ScriptedConnector::new(vec![]);
    let (handle, _task) = start(test_config(), &devices, &models, &connector);

    wait_until(&handle, "playing", |s| s.state == PipelineState::Playing).await;
    let result = handle
        .self_test(SelfTestRequest::GeminiApi { api_key: None })
        .await;
    assert!(matches!(result, Err(Error::Busy(_))));
}
