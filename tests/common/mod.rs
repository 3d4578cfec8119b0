//! Shared test utilities
//!
//! Scripted stand-ins for the audio devices, the wake word model and the
//! remote session, so pipeline tests run without hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use homevoice::playback::OutputSink;
use homevoice::session::{ConnectParams, Connector, ServerEvent, SessionTransport};
use homevoice::voice::{AudioDevices, AudioFrame, CaptureHandle, FRAME_SAMPLES, FrameSender, SAMPLE_RATE};
use homevoice::wake_word::{ModelLoader, WakeWordModel};
use homevoice::{Error, PipelineConfig, PipelineDeps, Result};

/// First sample of a frame the marker model scores as the wake word
pub const WAKE_MARKER: i16 = 12_345;

// -- Frames ------------------------------------------------------------------

/// Builds a frame script with consecutive sequence numbers
#[derive(Default)]
pub struct Script {
    frames: Vec<AudioFrame>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.frames.len() as u64
    }

    /// One frame the marker model scores at 1.0
    pub fn wake(mut self) -> Self {
        let samples = vec![WAKE_MARKER; FRAME_SAMPLES];
        let seq = self.next_seq();
        self.frames.push(AudioFrame::new(samples, SAMPLE_RATE, seq));
        self
    }

    /// `n` voiced frames
    pub fn speech(mut self, n: usize) -> Self {
        for _ in 0..n {
            let seq = self.next_seq();
            self.frames.push(speech_frame(seq));
        }
        self
    }

    /// `n` silent frames
    pub fn silence(mut self, n: usize) -> Self {
        for _ in 0..n {
            let seq = self.next_seq();
            self.frames.push(AudioFrame::silence(seq));
        }
        self
    }

    pub fn build(self) -> Vec<AudioFrame> {
        self.frames
    }
}

/// A 440 Hz tone at 30% volume, well above the speech threshold
pub fn speech_frame(seq: u64) -> AudioFrame {
    let samples: Vec<f32> = (0..FRAME_SAMPLES)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3
        })
        .collect();
    AudioFrame::from_f32(&samples, SAMPLE_RATE, seq)
}

// -- Devices -----------------------------------------------------------------

/// What the scripted sink records
#[derive(Default)]
pub struct SinkLog {
    pub played: Mutex<Vec<usize>>,
    pub spoken: Mutex<Vec<String>>,
    pub interrupts: AtomicUsize,
}

impl SinkLog {
    pub fn played(&self) -> Vec<usize> {
        self.played.lock().unwrap().clone()
    }
}

struct ScriptedSink {
    log: Arc<SinkLog>,
    hang: bool,
    fail: bool,
}

#[async_trait]
impl OutputSink for ScriptedSink {
    async fn play_audio(&mut self, pcm: &[i16], _sample_rate: u32) -> Result<()> {
        if self.fail {
            return Err(Error::Playback("speaker unplugged".into()));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.log.played.lock().unwrap().push(pcm.len());
        Ok(())
    }

    async fn speak(&mut self, text: &str, _tts_service: &str) -> Result<()> {
        self.log.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn interrupt(&mut self) {
        self.log.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Audio devices fed from scripts
///
/// Each `open_input` pushes the next queued script into the frame queue and
/// keeps the sender alive; `feed` pushes more frames into the open input.
#[derive(Default)]
pub struct ScriptedDevices {
    scripts: Mutex<VecDeque<Vec<AudioFrame>>>,
    live: Mutex<Option<FrameSender>>,
    pub inputs_opened: AtomicUsize,
    pub outputs_opened: AtomicUsize,
    pub fail_input: AtomicBool,
    pub hang_playback: AtomicBool,
    pub fail_playback: AtomicBool,
    pub sink: Arc<SinkLog>,
}

impl ScriptedDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(frames: Vec<AudioFrame>) -> Arc<Self> {
        let devices = Self::default();
        devices.scripts.lock().unwrap().push_back(frames);
        Arc::new(devices)
    }

    /// Push frames into the currently open input
    pub fn feed(&self, frames: Vec<AudioFrame>) {
        let live = self.live.lock().unwrap();
        let sender = live.as_ref().expect("no input open");
        for frame in frames {
            sender.push(frame);
        }
    }

    /// Fail the currently open input
    pub fn unplug(&self) {
        let live = self.live.lock().unwrap();
        live.as_ref().expect("no input open").fault("device unplugged");
    }
}

impl AudioDevices for ScriptedDevices {
    fn open_input(&self, name: &str, sender: FrameSender) -> Result<CaptureHandle> {
        if self.fail_input.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable(format!("no input named '{name}'")));
        }
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        for frame in script {
            sender.push(frame);
        }
        *self.live.lock().unwrap() = Some(sender.clone());
        Ok(CaptureHandle::from_guard(sender))
    }

    fn open_output(&self, _name: &str) -> Result<Box<dyn OutputSink>> {
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSink {
            log: Arc::clone(&self.sink),
            hang: self.hang_playback.load(Ordering::SeqCst),
            fail: self.fail_playback.load(Ordering::SeqCst),
        }))
    }
}

// -- Wake word model ---------------------------------------------------------

struct MarkerModel {
    name: String,
}

impl WakeWordModel for MarkerModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&mut self, frame: &AudioFrame) -> Result<f32> {
        Ok(if frame.samples().first() == Some(&WAKE_MARKER) {
            1.0
        } else {
            0.0
        })
    }

    fn reset(&mut self) {}
}

/// Loads marker models; the phrase `broken` fails to load
#[derive(Default)]
pub struct MarkerModels {
    pub loaded: Mutex<Vec<String>>,
}

impl MarkerModels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn loads(&self) -> usize {
        self.loaded.lock().unwrap().len()
    }
}

impl ModelLoader for MarkerModels {
    fn load(&self, wake_word: &str) -> Result<Box<dyn WakeWordModel>> {
        if wake_word == "broken" {
            return Err(Error::DetectionFault("model file missing".into()));
        }
        self.loaded.lock().unwrap().push(wake_word.to_string());
        Ok(Box::new(MarkerModel {
            name: wake_word.replace(' ', "_"),
        }))
    }
}

// -- Session -----------------------------------------------------------------

/// How one connect attempt behaves
pub enum Outcome {
    /// Connect, then reply with these events
    Respond(Vec<ServerEvent>),
    /// Refuse the connection
    Refuse(fn() -> Error),
    /// Connect, then drop after the input is sent
    Drop,
    /// Connect, then never answer
    Hang,
    /// Never finish connecting
    Stall,
}

/// Audio, text, turn complete
pub fn echo_events() -> Vec<ServerEvent> {
    vec![
        ServerEvent::Audio {
            pcm: vec![100; 2400],
            sample_rate: 24_000,
        },
        ServerEvent::Text("It is sunny.".into()),
        ServerEvent::Audio {
            pcm: vec![100; 1200],
            sample_rate: 24_000,
        },
        ServerEvent::TurnComplete,
    ]
}

/// Connector that plays queued outcomes, then echoes
#[derive(Default)]
pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Outcome>>,
    pub connects: AtomicUsize,
    pub bytes_sent: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Self::default()
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn SessionTransport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Outcome::Respond(echo_events()));

        let (events, drop_after_input, hang) = match outcome {
            Outcome::Refuse(error) => return Err(error()),
            Outcome::Respond(events) => (events, false, false),
            Outcome::Drop => (Vec::new(), true, false),
            Outcome::Hang => (Vec::new(), false, true),
            Outcome::Stall => return std::future::pending().await,
        };
        Ok(Box::new(ScriptedTransport {
            events: events.into(),
            drop_after_input,
            hang,
            bytes_sent: Arc::clone(&self.bytes_sent),
        }))
    }
}

struct ScriptedTransport {
    events: VecDeque<ServerEvent>,
    drop_after_input: bool,
    hang: bool,
    bytes_sent: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionTransport for ScriptedTransport {
    async fn send_audio(&mut self, pcm: &[u8], _sample_rate: u32) -> Result<()> {
        self.bytes_sent.fetch_add(pcm.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn end_input(&mut self) -> Result<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.drop_after_input {
            return Err(Error::SessionTransport("connection reset".into()));
        }
        Ok(self.events.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// -- Config ------------------------------------------------------------------

/// Fast endpointing, single-frame smoothing, a key, and a roomy queue
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig {
        api_key: SecretString::from("test-key".to_string()),
        wake_word_sensitivity: 0.5,
        frame_queue_capacity: 4096,
        ..PipelineConfig::default()
    };
    config.wake.smoothing_frames = 1;
    config.wake.cooldown = Duration::from_millis(300);
    config.endpoint.silence_timeout = Duration::from_millis(300);
    config.endpoint.onset_timeout = Duration::from_millis(300);
    config.endpoint.max_utterance = Duration::from_secs(3);
    config.session.retry_delay = Duration::from_millis(10);
    config.session.deadline = Duration::from_secs(2);
    config
}

pub fn deps(
    devices: &Arc<ScriptedDevices>,
    models: &Arc<MarkerModels>,
    connector: &Arc<ScriptedConnector>,
) -> PipelineDeps {
    PipelineDeps {
        devices: devices.clone(),
        models: models.clone(),
        connector: connector.clone(),
    }
}
