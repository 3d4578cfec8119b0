//! Playback coordination
//!
//! Drives one response at a time into the output sink on its own task. Audio
//! chunks play in server order; a text-only response is spoken instead. An
//! abort stops output mid-chunk and discards the rest. The outcome is
//! delivered over a oneshot, so completion is signalled exactly once per
//! response whatever happens.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};

use crate::session::{ResponseChunk, ResponsePayload};
use crate::{Error, Result};

/// Output device or media player target
#[async_trait]
pub trait OutputSink: Send {
    /// Play 16-bit mono PCM, returning when it has finished
    async fn play_audio(&mut self, pcm: &[i16], sample_rate: u32) -> Result<()>;

    /// Speak text through the named TTS service
    async fn speak(&mut self, text: &str, tts_service: &str) -> Result<()>;

    /// Stop output started by a call whose future was dropped
    fn interrupt(&mut self);
}

/// How a playback ended
#[derive(Debug)]
pub enum PlaybackOutcome {
    /// Every chunk was played
    Completed,
    /// Stopped by an abort
    Interrupted,
    /// The sink failed
    Failed(Error),
}

/// Handle on a running playback
pub struct PlaybackHandle {
    abort: Option<oneshot::Sender<()>>,
    done: oneshot::Receiver<PlaybackOutcome>,
}

impl PlaybackHandle {
    /// Ask the playback to stop at its next checkpoint
    pub fn abort(&mut self) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(());
        }
    }

    /// Wait for the outcome
    ///
    /// Cancel-safe: may be polled from `select!` repeatedly.
    pub async fn finished(&mut self) -> PlaybackOutcome {
        (&mut self.done).await.unwrap_or_else(|_| {
            PlaybackOutcome::Failed(Error::Playback("playback task ended".to_string()))
        })
    }
}

/// Shared output sink
pub type SharedSink = Arc<Mutex<Box<dyn OutputSink>>>;

/// Starts playbacks against one output sink
#[derive(Clone)]
pub struct PlaybackCoordinator {
    sink: SharedSink,
    tts_service: String,
}

impl PlaybackCoordinator {
    #[must_use]
    pub fn new(sink: Box<dyn OutputSink>, tts_service: impl Into<String>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            tts_service: tts_service.into(),
        }
    }

    /// Set the TTS service used for text-only responses
    pub fn set_tts_service(&mut self, tts_service: impl Into<String>) {
        self.tts_service = tts_service.into();
    }

    /// Start playing `payload`
    #[must_use]
    pub fn start(&self, payload: ResponsePayload) -> PlaybackHandle {
        let (abort_tx, abort_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let sink = Arc::clone(&self.sink);
        let tts_service = self.tts_service.clone();
        tokio::spawn(async move {
            let outcome = play(&sink, &payload, &tts_service, abort_rx).await;
            tracing::debug!(session = %payload.session_id, outcome = ?outcome, "playback finished");
            let _ = done_tx.send(outcome);
        });

        PlaybackHandle {
            abort: Some(abort_tx),
            done: done_rx,
        }
    }
}

async fn play(
    sink: &SharedSink,
    payload: &ResponsePayload,
    tts_service: &str,
    mut abort: oneshot::Receiver<()>,
) -> PlaybackOutcome {
    let mut sink = sink.lock().await;

    if payload.has_audio() {
        for chunk in &payload.chunks {
            let ResponseChunk::Audio { pcm, sample_rate } = chunk else {
                continue;
            };

            let result = tokio::select! {
                biased;
                _ = &mut abort => None,
                r = sink.play_audio(pcm, *sample_rate) => Some(r),
            };
            match result {
                None => {
                    sink.interrupt();
                    return PlaybackOutcome::Interrupted;
                }
                Some(Err(e)) => return PlaybackOutcome::Failed(e),
                Some(Ok(())) => {}
            }
        }
        return PlaybackOutcome::Completed;
    }

    let text = payload.text();
    if text.trim().is_empty() {
        return PlaybackOutcome::Completed;
    }

    let result = tokio::select! {
        biased;
        _ = &mut abort => None,
        r = sink.speak(&text, tts_service) => Some(r),
    };
    match result {
        None => {
            sink.interrupt();
            PlaybackOutcome::Interrupted
        }
        Some(Err(e)) => PlaybackOutcome::Failed(e),
        Some(Ok(())) => PlaybackOutcome::Completed,
    }
}
