//! Text-to-speech endpoint, fixed to the piper backend.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Response};
use axum::Json;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use sauti_core::backend::piper;
use sauti_core::params::Params;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub model_id: String,
    pub text: String,
    #[serde(default)]
    pub parameters: Option<Params>,
}

/// Synthesize speech; the response body is the raw WAV audio.
pub async fn synthesize(
    State(state): State<AppState>,
    Json(req): Json<SynthesizeRequest>,
) -> Result<Response<Body>, ApiError> {
    if req.text.is_empty() {
        return Err(ApiError::bad_request("text is required"));
    }

    let ctx = CancellationToken::new();
    let _guard = ctx.clone().drop_guard();

    let resp = state
        .dispatcher
        .infer(
            &ctx,
            piper::BACKEND_NAME,
            &req.model_id,
            req.text.into_bytes(),
            req.parameters.unwrap_or_default(),
        )
        .await?;

    Response::builder()
        .header(header::CONTENT_TYPE, "audio/wav")
        .body(Body::from(resp.output))
        .map_err(|err| ApiError::internal(err.to_string()))
}
