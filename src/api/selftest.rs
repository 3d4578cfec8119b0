//! Self-test endpoints
//!
//! Each returns `{success, message}`; a failing component is still a 200.
//! 409 while an interaction is in progress.

use std::sync::Arc;

use axum::{Json, Router, body::Bytes, extract::State, routing::post};
use secrecy::SecretString;
use serde::Deserialize;

use super::{ApiError, ApiState, parse_body};
use crate::selftest::{SelfTestReport, SelfTestRequest};

/// Build self-test router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/wake_word", post(wake_word))
        .route("/audio_capture", post(audio_capture))
        .route("/gemini_api", post(gemini_api))
        .route("/tts", post(tts))
        .with_state(state)
}

type Report = Result<Json<SelfTestReport>, ApiError>;

async fn run(state: &ApiState, request: SelfTestRequest) -> Report {
    Ok(Json(state.pipeline.self_test(request).await?))
}

#[derive(Debug, Default, Deserialize)]
struct WakeWordBody {
    wake_word: Option<String>,
    sensitivity: Option<f32>,
}

async fn wake_word(State(state): State<Arc<ApiState>>, body: Bytes) -> Report {
    let body: WakeWordBody = parse_body(&body)?;
    run(
        &state,
        SelfTestRequest::WakeWord {
            wake_word: body.wake_word,
            sensitivity: body.sensitivity,
            sample: None,
        },
    )
    .await
}

#[derive(Debug, Default, Deserialize)]
struct CaptureBody {
    input_device: Option<String>,
}

async fn audio_capture(State(state): State<Arc<ApiState>>, body: Bytes) -> Report {
    let body: CaptureBody = parse_body(&body)?;
    run(
        &state,
        SelfTestRequest::AudioCapture {
            input_device: body.input_device,
        },
    )
    .await
}

#[derive(Default, Deserialize)]
struct ApiKeyBody {
    api_key: Option<String>,
}

async fn gemini_api(State(state): State<Arc<ApiState>>, body: Bytes) -> Report {
    let body: ApiKeyBody = parse_body(&body)?;
    run(
        &state,
        SelfTestRequest::GeminiApi {
            api_key: body.api_key.map(SecretString::from),
        },
    )
    .await
}

#[derive(Debug, Default, Deserialize)]
struct OutputBody {
    output_device: Option<String>,
    tts_service: Option<String>,
}

async fn tts(State(state): State<Arc<ApiState>>, body: Bytes) -> Report {
    let body: OutputBody = parse_body(&body)?;
    run(
        &state,
        SelfTestRequest::Tts {
            output_device: body.output_device,
            tts_service: body.tts_service,
        },
    )
    .await
}
