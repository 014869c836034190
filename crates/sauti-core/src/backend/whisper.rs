//! whisper.cpp speech-to-text backend.
//!
//! Supervises one `whisper-server` child and submits audio as a
//! `multipart/form-data` transcription request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendRequest, BackendResponse, ResponseMetadata};
use crate::error::{Error, Result};
use crate::params;
use crate::process::{ServerSpec, ServerSupervisor};

/// Provider name of this backend.
pub const BACKEND_NAME: &str = "whisper.cpp";

/// Default port the supervised child server is pinned to.
pub const BACKEND_PORT: u16 = 8082;

// Transcription of long audio can take a while once the model is cold.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct WhisperBackend {
    supervisor: Arc<ServerSupervisor>,
    client: reqwest::Client,
    bin: PathBuf,
    port: u16,
}

/// Knobs forwarded to the child server as form fields.
#[derive(Debug, Clone, PartialEq)]
struct TranscriptionRequest {
    language: String,
    prompt: String,
    temperature: f64,
    beam_size: i64,
    best_of: i64,
    translate: bool,
    no_timestamps: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    segments: Vec<serde_json::Value>,
}

impl WhisperBackend {
    pub fn new(bin: impl Into<PathBuf>, supervisor: Arc<ServerSupervisor>) -> Self {
        Self {
            supervisor,
            client: reqwest::Client::builder()
                .timeout(CLIENT_TIMEOUT)
                .build()
                .expect("default reqwest client"),
            bin: bin.into(),
            port: BACKEND_PORT,
        }
    }

    /// Pin the child server to a different port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn ensure_server(&self, ctx: &CancellationToken, req: &BackendRequest) -> Result<()> {
        let args = vec![
            "--model".to_string(),
            req.model_path.display().to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
        ];
        self.supervisor
            .start_server(
                ctx,
                ServerSpec {
                    name: BACKEND_NAME.to_string(),
                    bin: self.bin.clone(),
                    args,
                    port: self.port,
                    health_path: "/".to_string(),
                },
            )
            .await
    }
}

fn build_transcription_request(req: &BackendRequest) -> TranscriptionRequest {
    let p = &req.parameters;
    TranscriptionRequest {
        language: params::get(p, "language", String::new()),
        temperature: params::get(p, "temperature", 0.0),
        translate: params::get(p, "translate", false),
        no_timestamps: params::get(p, "no_timestamps", false),
        prompt: params::get(p, "prompt", String::new()),
        beam_size: params::get(p, "beam_size", -1),
        best_of: params::get(p, "best_of", 2),
    }
}

/// Build the multipart form: the raw audio plus the parameter fields.
/// Sentinel values (`beam_size < 0`, `best_of <= 0`, empty `prompt`) are
/// omitted rather than sent.
fn build_form(audio: Vec<u8>, params: &TranscriptionRequest) -> multipart::Form {
    let file_part = multipart::Part::bytes(audio).file_name("audio.wav");

    let mut form = multipart::Form::new()
        .part("file", file_part)
        .text("language", params.language.clone())
        .text("response_format", "verbose_json")
        .text("temperature", format!("{:.2}", params.temperature))
        .text("translate", params.translate.to_string())
        .text("no_timestamps", params.no_timestamps.to_string());

    if params.beam_size >= 0 {
        form = form.text("beam_size", params.beam_size.to_string());
    }
    if params.best_of > 0 {
        form = form.text("best_of", params.best_of.to_string());
    }
    if !params.prompt.is_empty() {
        form = form.text("prompt", params.prompt.clone());
    }

    form
}

#[async_trait]
impl Backend for WhisperBackend {
    fn provider(&self) -> &str {
        BACKEND_NAME
    }

    async fn infer(&self, ctx: &CancellationToken, req: BackendRequest) -> Result<BackendResponse> {
        self.ensure_server(ctx, &req).await?;

        let transcription_req = build_transcription_request(&req);
        let form = build_form(req.input.clone(), &transcription_req);
        let url = format!("http://127.0.0.1:{}/inference", self.port);
        let start = Instant::now();

        let round_trip = async {
            let resp = self.client.post(&url).multipart(form).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::BackendStatus {
                    provider: BACKEND_NAME.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(resp.json::<TranscriptionResponse>().await?)
        };
        let transcription = tokio::select! {
            transcription = round_trip => transcription?,
            _ = ctx.cancelled() => return Err(Error::Canceled),
        };

        let elapsed = start.elapsed().as_secs_f64();
        let text = transcription.text.clone();

        Ok(BackendResponse {
            metadata: ResponseMetadata {
                provider: BACKEND_NAME.to_string(),
                model: req.model_path.display().to_string(),
                timestamp: Utc::now(),
                duration_seconds: elapsed,
                output_size_bytes: text.len() as u64,
                backend_specific: serde_json::json!({
                    "response": serde_json::to_value(&transcription)?,
                }),
            },
            output: text.into_bytes(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.supervisor.stop_server(BACKEND_NAME, self.port).await
    }
}
