//! Health check endpoint

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::pipeline::PipelineState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` while capture runs, `degraded` when stopped
    pub status: &'static str,
    pub version: &'static str,
    pub state: PipelineState,
}

/// Liveness check
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let pipeline_state = state.pipeline.state();
    Json(HealthResponse {
        status: if pipeline_state == PipelineState::Idle {
            "degraded"
        } else {
            "ok"
        },
        version: env!("CARGO_PKG_VERSION"),
        state: pipeline_state,
    })
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}
