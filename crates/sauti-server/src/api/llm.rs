//! Text generation endpoints, fixed to the llama.cpp backend.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use sauti_core::backend::llama;
use sauti_core::params::Params;
use sauti_core::ResponseMetadata;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub parameters: Option<Params>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub text: String,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Serialize)]
struct StreamEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl StreamEvent {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            done: None,
            error: None,
        }
    }

    fn done() -> Self {
        Self {
            text: None,
            done: Some(true),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            text: None,
            done: None,
            error: Some(message),
        }
    }

    fn into_sse(self) -> Event {
        let payload = serde_json::to_string(&self).unwrap_or_default();
        Event::default().event("message").data(payload)
    }
}

pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    if req.prompt.is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }

    let ctx = CancellationToken::new();
    let _guard = ctx.clone().drop_guard();

    let resp = state
        .dispatcher
        .infer(
            &ctx,
            llama::BACKEND_NAME,
            &req.model_id,
            req.prompt.into_bytes(),
            req.parameters.unwrap_or_default(),
        )
        .await?;

    Ok(Json(GenerateResponse {
        text: String::from_utf8_lossy(&resp.output).into_owned(),
        metadata: resp.metadata,
    }))
}

/// Streaming generation over server-sent events.
///
/// Every stream ends with exactly one terminal event: `{done: true}` on
/// success or `{error}` on any failure, pre-stream or mid-stream.
pub async fn generate_stream(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let ctx = CancellationToken::new();
        let _guard = ctx.clone().drop_guard();

        if req.prompt.is_empty() {
            yield Ok(StreamEvent::error("prompt is required".into()).into_sse());
            return;
        }

        let mut rx = match state
            .dispatcher
            .infer_stream(
                &ctx,
                llama::BACKEND_NAME,
                &req.model_id,
                req.prompt.into_bytes(),
                req.parameters.unwrap_or_default(),
            )
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                yield Ok(StreamEvent::error(err.to_string()).into_sse());
                return;
            }
        };

        while let Some(chunk) = rx.recv().await {
            if let Some(err) = chunk.error {
                yield Ok(StreamEvent::error(err.to_string()).into_sse());
                return;
            }
            if chunk.done {
                yield Ok(StreamEvent::done().into_sse());
                return;
            }
            let text = String::from_utf8_lossy(&chunk.data).into_owned();
            yield Ok(StreamEvent::text(text).into_sse());
        }

        // Producer went away without a terminal chunk; normalize.
        yield Ok(StreamEvent::done().into_sse());
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
