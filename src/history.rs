//! Recent interaction log
//!
//! A bounded in-memory record of finished interactions, newest last. Nothing
//! is persisted.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::endpoint::EndReason;
use crate::error::ErrorKind;

/// Default number of records kept
pub const DEFAULT_CAPACITY: usize = 100;

/// What started the capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    WakeWord,
    Manual,
}

/// Terminal outcome of an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOutcome {
    Success,
    Failed,
}

/// One finished interaction
#[derive(Debug, Clone, Serialize)]
pub struct InteractionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub trigger: Trigger,
    pub wake_word: String,
    pub sensitivity: f32,
    /// Detection confidence, absent for manual captures
    pub confidence: Option<f32>,
    pub end_reason: EndReason,
    pub utterance_ms: u64,
    /// Sessions opened, including the retry
    pub sessions: u32,
    pub response_text: Option<String>,
    /// Time from end of utterance to complete response
    pub response_time_ms: Option<u64>,
    pub outcome: InteractionOutcome,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

/// Bounded ring of interaction records
#[derive(Debug)]
pub struct InteractionLog {
    records: Mutex<VecDeque<InteractionRecord>>,
    capacity: usize,
}

impl Default for InteractionLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InteractionLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn record(&self, record: InteractionRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Up to `limit` most recent records, newest first
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<InteractionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
