//! Gemini Live transport
//!
//! JSON messages over a websocket: a `setup` message answered by
//! `setupComplete`, base64 PCM in `realtimeInput`, `audioStreamEnd` to flush
//! the input, and `serverContent` messages carrying model turn parts until
//! `turnComplete`.

use std::collections::VecDeque;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{ConnectParams, Connector, ServerEvent, SessionTransport};
use crate::{Error, Result};

/// Sample rate Gemini Live responds with unless the mime type says otherwise
const DEFAULT_RESPONSE_RATE: u32 = 24000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// -- Wire types ---------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage<'a> {
    Setup(Setup<'a>),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_stream_end: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

// -- Connector ----------------------------------------------------------------

/// Opens Gemini Live sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiLiveConnector;

#[async_trait]
impl Connector for GeminiLiveConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn SessionTransport>> {
        let key = params.api_key.expose_secret();
        if key.trim().is_empty() {
            return Err(Error::SessionAuth("no API key configured".to_string()));
        }

        let mut url = url::Url::parse(&params.config.endpoint)
            .map_err(|e| Error::Config(format!("invalid session endpoint: {e}")))?;
        url.query_pairs_mut().append_pair("key", key);

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(map_connect_error)?;

        tracing::debug!(model = %params.config.model, "gemini live connected");

        let mut transport = GeminiLiveTransport {
            ws,
            pending: VecDeque::new(),
        };
        transport.setup(&params.config.model).await?;
        Ok(Box::new(transport))
    }
}

fn map_connect_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Error::SessionAuth(format!("endpoint rejected credentials ({})", response.status()))
        }
        other => Error::SessionTransport(other.to_string()),
    }
}

// -- Transport ----------------------------------------------------------------

/// An open Gemini Live websocket
pub struct GeminiLiveTransport {
    ws: WsStream,
    pending: VecDeque<ServerEvent>,
}

impl GeminiLiveTransport {
    async fn send_json(&mut self, message: &ClientMessage<'_>) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.ws
            .send(Message::text(json))
            .await
            .map_err(|e| Error::SessionTransport(e.to_string()))
    }

    async fn setup(&mut self, model: &str) -> Result<()> {
        self.send_json(&ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
            },
        }))
        .await?;

        loop {
            let Some(message) = self.read_message().await? else {
                return Err(Error::SessionTransport(
                    "session closed during setup".to_string(),
                ));
            };
            if message.setup_complete.is_some() {
                tracing::debug!("gemini live setup complete");
                return Ok(());
            }
        }
    }

    /// Read the next JSON message; `None` on clean close
    async fn read_message(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            let Some(frame) = self.ws.next().await else {
                return Err(Error::SessionTransport(
                    "connection dropped without close".to_string(),
                ));
            };

            let frame = frame.map_err(|e| Error::SessionTransport(e.to_string()))?;
            let parsed: serde_json::Result<ServerMessage> = match frame {
                Message::Text(text) => serde_json::from_str(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice(&bytes),
                Message::Close(close) => return close_outcome(close),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return parsed
                .map(Some)
                .map_err(|e| Error::SessionTransport(format!("malformed server message: {e}")));
        }
    }
}

/// Map a close frame to a clean close or an error
fn close_outcome(
    close: Option<tungstenite::protocol::CloseFrame>,
) -> Result<Option<ServerMessage>> {
    let Some(frame) = close else {
        return Ok(None);
    };

    let reason = frame.reason.to_string();
    match frame.code {
        CloseCode::Normal | CloseCode::Away => Ok(None),
        CloseCode::Policy => Err(Error::SessionAuth(reason)),
        _ if reason.to_lowercase().contains("api key") => Err(Error::SessionAuth(reason)),
        code => Err(Error::SessionTransport(format!(
            "session closed with code {}: {reason}",
            u16::from(code)
        ))),
    }
}

/// Flatten one server message into events, in emission order
fn events_from(message: ServerMessage) -> Result<Vec<ServerEvent>> {
    let mut events = Vec::new();
    let Some(content) = message.server_content else {
        if message.go_away.is_some() {
            tracing::debug!("gemini live server is going away");
        }
        return Ok(events);
    };

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(ServerEvent::Text(text));
            }
            if let Some(blob) = part.inline_data {
                events.push(decode_audio(&blob)?);
            }
        }
    }

    if let Some(text) = content
        .output_transcription
        .and_then(|t| t.text)
        .filter(|t| !t.is_empty())
    {
        events.push(ServerEvent::Text(text));
    }

    if content.turn_complete {
        events.push(ServerEvent::TurnComplete);
    }

    Ok(events)
}

fn decode_audio(blob: &InlineData) -> Result<ServerEvent> {
    let bytes = BASE64
        .decode(&blob.data)
        .map_err(|e| Error::SessionTransport(format!("invalid audio payload: {e}")))?;

    let pcm = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    Ok(ServerEvent::Audio {
        pcm,
        sample_rate: rate_from_mime(&blob.mime_type).unwrap_or(DEFAULT_RESPONSE_RATE),
    })
}

/// Parse `rate=` out of a mime type such as `audio/pcm;rate=24000`
fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.parse().ok())
}

#[async_trait]
impl SessionTransport for GeminiLiveTransport {
    async fn send_audio(&mut self, pcm: &[u8], sample_rate: u32) -> Result<()> {
        self.send_json(&ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: format!("audio/pcm;rate={sample_rate}"),
                data: BASE64.encode(pcm),
            }),
            audio_stream_end: None,
        }))
        .await
    }

    async fn end_input(&mut self) -> Result<()> {
        self.send_json(&ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        }))
        .await
    }

    async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let Some(message) = self.read_message().await? else {
                return Ok(None);
            };
            self.pending.extend(events_from(message)?);
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| Error::SessionTransport(e.to_string()))
    }
}
