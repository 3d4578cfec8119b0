//! Streaming session client
//!
//! One session per utterance: connect and authenticate, send the utterance as
//! ordered PCM chunks, signal end of input, then collect response chunks until
//! the server marks the turn complete or closes cleanly. The whole exchange
//! runs under one deadline. Sessions are never reused.

mod gemini;
pub mod retry;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Serialize;
use uuid::Uuid;

pub use gemini::GeminiLiveConnector;
pub use retry::RetryPolicy;

use crate::config::SessionConfig;
use crate::endpoint::Utterance;
use crate::{Error, Result};

/// Frames per outgoing audio chunk (120ms)
pub const FRAMES_PER_CHUNK: usize = 4;

/// Event received from the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Response audio
    Audio { pcm: Vec<i16>, sample_rate: u32 },
    /// Response text (transcript or text-only reply)
    Text(String),
    /// End of the response
    TurnComplete,
}

/// An open duplex session
///
/// `next_event` returns `Ok(None)` when the server closed the session cleanly
/// and an error when the transport dropped.
#[async_trait]
pub trait SessionTransport: Send {
    /// Send one chunk of little-endian 16-bit PCM
    async fn send_audio(&mut self, pcm: &[u8], sample_rate: u32) -> Result<()>;

    /// Signal that no more audio follows
    async fn end_input(&mut self) -> Result<()>;

    /// Wait for the next server event
    async fn next_event(&mut self) -> Result<Option<ServerEvent>>;

    /// Close the session
    async fn close(&mut self) -> Result<()>;
}

/// Connection parameters for one session
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub api_key: SecretString,
    pub config: SessionConfig,
}

/// Opens authenticated sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::SessionAuth` if the credentials are rejected and
    /// `Error::SessionTransport` if the endpoint cannot be reached
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn SessionTransport>>;
}

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Opening,
    Sending,
    AwaitingResponse,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Opening => "opening",
            Self::Sending => "sending",
            Self::AwaitingResponse => "awaiting-response",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        })
    }
}

/// One piece of a response, in server emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    Audio { pcm: Vec<i16>, sample_rate: u32 },
    Text(String),
}

/// A complete response
#[derive(Debug, Clone, Default)]
pub struct ResponsePayload {
    pub session_id: Uuid,
    pub chunks: Vec<ResponseChunk>,
}

impl ResponsePayload {
    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.chunks
            .iter()
            .any(|c| matches!(c, ResponseChunk::Audio { .. }))
    }

    /// All text chunks joined
    #[must_use]
    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .filter_map(|c| match c {
                ResponseChunk::Text(t) => Some(t.as_str()),
                ResponseChunk::Audio { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Total samples of response audio
    #[must_use]
    pub fn audio_samples(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| match c {
                ResponseChunk::Audio { pcm, .. } => pcm.len(),
                ResponseChunk::Text(_) => 0,
            })
            .sum()
    }
}

/// Bookkeeping for one session
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    state: SessionState,
    chunks_sent: usize,
    response: Vec<ResponseChunk>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Opening,
            chunks_sent: 0,
            response: Vec::new(),
        }
    }

    fn transition(&mut self, state: SessionState) {
        tracing::debug!(session = %self.id, from = %self.state, to = %state, "session state");
        self.state = state;
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    fn into_payload(self) -> ResponsePayload {
        ResponsePayload {
            session_id: self.id,
            chunks: self.response,
        }
    }
}

/// Runs sessions against a connector
#[derive(Clone)]
pub struct SessionClient {
    connector: Arc<dyn Connector>,
    params: ConnectParams,
    policy: RetryPolicy,
    opened: Arc<AtomicU64>,
}

impl SessionClient {
    /// Create a client
    ///
    /// `opened` is incremented for every session opened.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, params: ConnectParams, opened: Arc<AtomicU64>) -> Self {
        let policy = RetryPolicy::once_after(params.config.retry_delay);
        Self {
            connector,
            params,
            policy,
            opened,
        }
    }

    /// Run one session for `utterance` under the session deadline
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionTimeout` when the deadline expires, and the
    /// connector's or transport's error otherwise
    pub async fn run(&self, utterance: &Utterance) -> Result<ResponsePayload> {
        let deadline = self.params.config.deadline;
        let mut session = Session::new();

        let result = tokio::time::timeout(deadline, self.exchange(&mut session, utterance)).await;
        match result {
            Ok(Ok(())) => {
                session.transition(SessionState::Closed);
                tracing::debug!(
                    session = %session.id,
                    chunks_sent = session.chunks_sent,
                    chunks_received = session.response.len(),
                    "session complete"
                );
                Ok(session.into_payload())
            }
            Ok(Err(e)) => {
                session.transition(SessionState::Failed);
                Err(e)
            }
            Err(_) => {
                session.transition(SessionState::Failed);
                Err(Error::SessionTimeout(deadline))
            }
        }
    }

    /// Run a session, opening one fresh session for the same utterance if the
    /// first fails with a recoverable error
    ///
    /// # Errors
    ///
    /// Returns the last session error
    pub async fn run_with_retry(&self, utterance: Arc<Utterance>) -> Result<ResponsePayload> {
        let mut attempt = 0;
        loop {
            match self.run(&utterance).await {
                Ok(payload) => return Ok(payload),
                Err(e) if retry::is_recoverable(&e) && self.policy.allows_retry(attempt) => {
                    let delay = self.policy.delay;
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "session failed, retrying with a fresh session"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exchange(&self, session: &mut Session, utterance: &Utterance) -> Result<()> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        let mut transport = self.connector.connect(&self.params).await?;

        session.transition(SessionState::Sending);
        let sample_rate = utterance.sample_rate();
        for chunk in utterance.pcm_chunks(FRAMES_PER_CHUNK) {
            transport.send_audio(&chunk, sample_rate).await?;
            session.chunks_sent += 1;
        }
        transport.end_input().await?;

        session.transition(SessionState::AwaitingResponse);
        loop {
            match transport.next_event().await? {
                Some(ServerEvent::Audio { pcm, sample_rate }) => {
                    session
                        .response
                        .push(ResponseChunk::Audio { pcm, sample_rate });
                }
                Some(ServerEvent::Text(text)) => {
                    session.response.push(ResponseChunk::Text(text));
                }
                Some(ServerEvent::TurnComplete) | None => break,
            }
        }

        session.transition(SessionState::Closing);
        if let Err(e) = transport.close().await {
            tracing::debug!(session = %session.id, error = %e, "session close failed");
        }
        Ok(())
    }
}
