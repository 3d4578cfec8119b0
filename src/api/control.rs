//! Control endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{post, put},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState, parse_body, parse_required};
use crate::config::ConfigUpdate;

/// Build control router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/config", post(update_config))
        .route("/control/restart", post(restart))
        .route("/control/start_listening", post(start_listening))
        .route("/control/stop_listening", post(stop_listening))
        .route("/control/abort", post(abort))
        .route("/control/wake_word", put(set_wake_word))
        .route("/control/sensitivity", put(set_sensitivity))
        .with_state(state)
}

/// Acknowledgement for a queued control signal
#[derive(Debug, Serialize)]
pub struct Accepted {
    pub accepted: bool,
}

type Ack = Result<(StatusCode, Json<Accepted>), ApiError>;

fn accepted() -> Ack {
    Ok((StatusCode::ACCEPTED, Json(Accepted { accepted: true })))
}

/// Configuration change notification
async fn update_config(State(state): State<Arc<ApiState>>, body: Bytes) -> Ack {
    let update: ConfigUpdate = parse_body(&body)?;
    state.pipeline.update_config(update).await?;
    accepted()
}

async fn restart(State(state): State<Arc<ApiState>>) -> Ack {
    state.pipeline.restart().await?;
    accepted()
}

async fn start_listening(State(state): State<Arc<ApiState>>) -> Ack {
    state.pipeline.start_listening().await?;
    accepted()
}

async fn stop_listening(State(state): State<Arc<ApiState>>) -> Ack {
    state.pipeline.stop_listening().await?;
    accepted()
}

async fn abort(State(state): State<Arc<ApiState>>) -> Ack {
    state.pipeline.abort().await?;
    accepted()
}

#[derive(Debug, Deserialize)]
struct WakeWordRequest {
    wake_word: String,
}

async fn set_wake_word(State(state): State<Arc<ApiState>>, body: Bytes) -> Ack {
    let request: WakeWordRequest = parse_required(&body)?;
    state.pipeline.set_wake_word(&request.wake_word).await?;
    accepted()
}

#[derive(Debug, Deserialize)]
struct SensitivityRequest {
    sensitivity: f32,
}

async fn set_sensitivity(State(state): State<Arc<ApiState>>, body: Bytes) -> Ack {
    let request: SensitivityRequest = parse_required(&body)?;
    state.pipeline.set_sensitivity(request.sensitivity).await?;
    accepted()
}
