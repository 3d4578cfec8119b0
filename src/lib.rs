//! HomeVoice - real-time voice pipeline
//!
//! Listens for a wake phrase on a local microphone, captures the utterance
//! that follows, streams it to a remote conversational model over a duplex
//! session, and plays the response on a local output.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  frames  ┌──────────────┐ utterance ┌──────────────┐
//! │  capture  ├─────────▶│ control loop ├──────────▶│   session    │
//! │  (cpal)   │  queue   │  (pipeline)  │◀──────────┤ (Gemini Live)│
//! └───────────┘          └──────┬───────┘  response └──────────────┘
//!                               │
//!                        ┌──────▼───────┐
//!                        │   playback   │
//!                        └──────────────┘
//! ```
//!
//! The host drives the pipeline through a [`pipeline::PipelineHandle`],
//! either directly or over the HTTP surface in [`api`].

pub mod api;
pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod playback;
pub mod selftest;
pub mod session;
pub mod voice;
pub mod wake_word;

pub use config::{Config, PipelineConfig};
pub use daemon::Daemon;
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{Pipeline, PipelineDeps, PipelineHandle, PipelineState, StatusSnapshot};
