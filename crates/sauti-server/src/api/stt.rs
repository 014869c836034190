//! Speech-to-text endpoint, fixed to the whisper.cpp backend.

use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use sauti_core::backend::whisper;
use sauti_core::params::Params;
use sauti_core::ResponseMetadata;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
    pub metadata: ResponseMetadata,
}

/// `multipart/form-data` intake: `file` (required audio), `model_id`
/// (required), `parameters` (optional JSON-encoded object).
pub async fn transcribe(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TranscribeResponse>, ApiError> {
    let mut audio: Option<Vec<u8>> = None;
    let mut model_id = String::new();
    let mut parameters = Params::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("failed to read audio: {err}")))?;
                audio = Some(bytes.to_vec());
            }
            "model_id" => {
                model_id = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("invalid model_id: {err}")))?;
            }
            "parameters" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("invalid parameters: {err}")))?;
                if !raw.is_empty() {
                    parameters = serde_json::from_str(&raw)
                        .map_err(|err| ApiError::bad_request(format!("invalid parameters JSON: {err}")))?;
                }
            }
            _ => {}
        }
    }

    let Some(audio) = audio.filter(|bytes| !bytes.is_empty()) else {
        return Err(ApiError::bad_request("audio file is required"));
    };

    let ctx = CancellationToken::new();
    let _guard = ctx.clone().drop_guard();

    let resp = state
        .dispatcher
        .infer(&ctx, whisper::BACKEND_NAME, &model_id, audio, parameters)
        .await?;

    Ok(Json(TranscribeResponse {
        text: String::from_utf8_lossy(&resp.output).into_owned(),
        metadata: resp.metadata,
    }))
}
