//! Status, interaction log and wake word listing

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::history::{DEFAULT_CAPACITY, InteractionRecord};
use crate::pipeline::StatusSnapshot;
use crate::wake_word::AVAILABLE_WAKE_WORDS;

/// Records returned when no limit is given
const DEFAULT_LIMIT: usize = 20;

/// Build status router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/interactions", get(interactions))
        .route("/wake_words", get(wake_words))
        .with_state(state)
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusSnapshot> {
    Json(state.pipeline.status())
}

#[derive(Debug, Deserialize)]
struct InteractionsQuery {
    limit: Option<usize>,
}

/// Most recent interactions, newest first
async fn interactions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<InteractionsQuery>,
) -> Json<Vec<InteractionRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(DEFAULT_CAPACITY);
    Json(state.pipeline.history().recent(limit))
}

/// Wake words response
#[derive(Debug, Serialize)]
pub struct WakeWordsResponse {
    pub wake_words: Vec<&'static str>,
    pub current: String,
}

async fn wake_words(State(state): State<Arc<ApiState>>) -> Json<WakeWordsResponse> {
    Json(WakeWordsResponse {
        wake_words: AVAILABLE_WAKE_WORDS.iter().map(|(phrase, _)| *phrase).collect(),
        current: state.pipeline.config().wake_word,
    })
}
