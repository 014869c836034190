//! llama.cpp chat backend.
//!
//! Supervises one `llama-server` child per model port and speaks its
//! OpenAI-style chat-completions API, in full or as server-sent events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{
    Backend, BackendRequest, BackendResponse, ResponseMetadata, StreamChunk, StreamingBackend,
};
use crate::error::{Error, Result};
use crate::params;
use crate::process::{ServerSpec, ServerSupervisor};

/// Provider name of this backend.
pub const BACKEND_NAME: &str = "llama.cpp";

/// Default port the supervised child server is pinned to.
pub const BACKEND_PORT: u16 = 8081;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct LlamaBackend {
    supervisor: Arc<ServerSupervisor>,
    client: reqwest::Client,
    bin: PathBuf,
    port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    messages: Vec<ChatMessage>,
    stream: bool,
    n_predict: i64,
    temperature: f64,
    top_k: i64,
    top_p: f64,
    min_p: f64,
    repeat_penalty: f64,
    presence_penalty: f64,
    frequency_penalty: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Choice {
    #[serde(default)]
    index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<ChoiceDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

impl LlamaBackend {
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
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        self.supervisor
            .start_server(
                ctx,
                ServerSpec {
                    name: BACKEND_NAME.to_string(),
                    bin: self.bin.clone(),
                    args,
                    port: self.port,
                    health_path: "/health".to_string(),
                },
            )
            .await
    }

    fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}/chat/completions", self.port)
    }
}

/// Assemble the chat-completions body from the request.
///
/// `parameters["messages"]` (a JSON-encoded array of role/content pairs)
/// takes precedence; otherwise the input bytes become a single user
/// message, optionally preceded by `parameters["system_prompt"]`.
fn build_chat_request(req: &BackendRequest, stream: bool) -> ChatCompletionRequest {
    let p = &req.parameters;

    let mut messages = Vec::new();
    let raw_messages = params::get(p, "messages", String::new());
    if !raw_messages.is_empty() {
        if let Ok(parsed) = serde_json::from_str::<Vec<ChatMessage>>(&raw_messages) {
            messages = parsed;
        }
    }
    if messages.is_empty() {
        let prompt = String::from_utf8_lossy(&req.input).into_owned();
        let system_prompt = params::get(p, "system_prompt", String::new());
        if !system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt,
        });
    }

    ChatCompletionRequest {
        messages,
        stream,
        n_predict: params::get(p, "n_predict", 128),
        temperature: params::get(p, "temperature", 0.7),
        top_k: params::get(p, "top_k", 40),
        top_p: params::get(p, "top_p", 0.9),
        min_p: params::get(p, "min_p", 0.05),
        repeat_penalty: params::get(p, "repeat_penalty", 1.1),
        presence_penalty: params::get(p, "presence_penalty", 0.0),
        frequency_penalty: params::get(p, "frequency_penalty", 0.0),
    }
}

#[async_trait]
impl Backend for LlamaBackend {
    fn provider(&self) -> &str {
        BACKEND_NAME
    }

    async fn infer(&self, ctx: &CancellationToken, req: BackendRequest) -> Result<BackendResponse> {
        self.ensure_server(ctx, &req).await?;

        let body = build_chat_request(&req, false);
        let start = Instant::now();

        let round_trip = async {
            let resp = self.client.post(self.endpoint()).json(&body).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::BackendStatus {
                    provider: BACKEND_NAME.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(resp.json::<ChatCompletionResponse>().await?)
        };
        let completion = tokio::select! {
            completion = round_trip => completion?,
            _ = ctx.cancelled() => return Err(Error::Canceled),
        };

        let elapsed = start.elapsed().as_secs_f64();
        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        Ok(BackendResponse {
            metadata: ResponseMetadata {
                provider: BACKEND_NAME.to_string(),
                model: req.model_path.display().to_string(),
                timestamp: Utc::now(),
                duration_seconds: elapsed,
                output_size_bytes: content.len() as u64,
                backend_specific: serde_json::json!({
                    "response": serde_json::to_value(&completion)?,
                }),
            },
            output: content.into_bytes(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.supervisor.stop_server(BACKEND_NAME, self.port).await
    }

    fn streaming(&self) -> Option<&dyn StreamingBackend> {
        Some(self)
    }
}

#[async_trait]
impl StreamingBackend for LlamaBackend {
    async fn infer_stream(
        &self,
        ctx: &CancellationToken,
        req: BackendRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        self.ensure_server(ctx, &req).await?;

        let body = build_chat_request(&req, true);
        let resp = self
            .client
            .post(self.endpoint())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendStatus {
                provider: BACKEND_NAME.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        // Capacity 1: a stalled consumer stalls the SSE read, and a
        // dropped consumer aborts the HTTP request to the child.
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(pump_sse(resp, tx, ctx.clone()));
        Ok(rx)
    }
}

async fn pump_sse(
    resp: reqwest::Response,
    tx: mpsc::Sender<StreamChunk>,
    ctx: CancellationToken,
) {
    let mut body = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let next = tokio::select! {
            next = body.next() => next,
            _ = ctx.cancelled() => {
                let _ = tx.send(StreamChunk::failed(Error::Canceled)).await;
                return;
            }
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                let _ = tx.send(StreamChunk::failed(err.into())).await;
                return;
            }
            // Upstream closed without a [DONE] sentinel.
            None => {
                let _ = tx.send(StreamChunk::done()).await;
                return;
            }
        };

        buf.extend_from_slice(&bytes);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                let _ = tx.send(StreamChunk::done()).await;
                return;
            }

            let frame: ChatCompletionResponse = match serde_json::from_str(data) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(error = %err, "skipping undecodable SSE frame");
                    continue;
                }
            };

            if let Some(choice) = frame.choices.first() {
                let content = choice
                    .delta
                    .as_ref()
                    .map(|d| d.content.clone())
                    .unwrap_or_default();
                if !content.is_empty()
                    && tx.send(StreamChunk::data(content.into_bytes())).await.is_err()
                {
                    // Consumer hung up; dropping the response tears the
                    // HTTP request down.
                    return;
                }
                if choice.finish_reason.is_some() {
                    let _ = tx.send(StreamChunk::done()).await;
                    return;
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::path::Path;

    use axum::body::Body;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use tempfile::TempDir;

    fn fake_server_bin(dir: &TempDir) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("llama-server");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn request(input: &str, parameters: serde_json::Value) -> BackendRequest {
        BackendRequest {
            model_path: PathBuf::from("/tmp/m"),
            input: input.as_bytes().to_vec(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
        }
    }

    fn backend(dir: &TempDir, port: u16) -> LlamaBackend {
        LlamaBackend::new(fake_server_bin(dir), Arc::new(ServerSupervisor::new()))
            .with_port(port)
    }

    async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let done = chunk.done;
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    #[test]
    fn build_request_uses_input_as_user_message() {
        let req = request("hi there", json!({}));
        let body = build_chat_request(&req, false);

        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.messages[0].content, "hi there");
        assert_eq!(body.n_predict, 128);
        assert_eq!(body.temperature, 0.7);
        assert_eq!(body.top_k, 40);
        assert_eq!(body.top_p, 0.9);
        assert_eq!(body.min_p, 0.05);
        assert_eq!(body.repeat_penalty, 1.1);
        assert_eq!(body.presence_penalty, 0.0);
        assert_eq!(body.frequency_penalty, 0.0);
    }

    #[test]
    fn build_request_prepends_system_prompt() {
        let req = request("hi", json!({"system_prompt": "be brief"}));
        let body = build_chat_request(&req, false);

        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[0].content, "be brief");
        assert_eq!(body.messages[1].role, "user");
    }

    #[test]
    fn build_request_prefers_encoded_messages() {
        let msgs = json!([
            {"role": "system", "content": "s"},
            {"role": "user", "content": "u"},
        ])
        .to_string();
        let req = request("ignored", json!({"messages": msgs}));
        let body = build_chat_request(&req, false);

        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[1].content, "u");
    }

    #[test]
    fn build_request_reads_numeric_knobs() {
        let req = request("hi", json!({"n_predict": 64, "temperature": 0.2, "top_k": 10}));
        let body = build_chat_request(&req, true);

        assert!(body.stream);
        assert_eq!(body.n_predict, 64);
        assert_eq!(body.temperature, 0.2);
        assert_eq!(body.top_k, 10);
    }

    #[tokio::test]
    async fn infer_returns_first_choice_content() {
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/chat/completions",
                post(|| async {
                    Json(json!({"choices": [{"message": {"role": "assistant", "content": "hello"}}]}))
                }),
            );
        let port = serve(router).await;
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, port);

        let resp = backend
            .infer(&CancellationToken::new(), request("hi", json!({})))
            .await
            .unwrap();

        assert_eq!(resp.output, b"hello");
        assert_eq!(resp.metadata.provider, "llama.cpp");
        assert_eq!(resp.metadata.model, "/tmp/m");
        assert_eq!(resp.metadata.output_size_bytes, 5);

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn infer_surfaces_child_server_error_status() {
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/chat/completions",
                post(|| async {
                    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "model load failed")
                }),
            );
        let port = serve(router).await;
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, port);

        let err = backend
            .infer(&CancellationToken::new(), request("hi", json!({})))
            .await
            .unwrap_err();
        match err {
            Error::BackendStatus { status, body, .. } => {
                assert_eq!(status, 500);
                assert!(body.contains("model load failed"));
            }
            other => panic!("unexpected error: {other}"),
        }

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn stream_emits_deltas_then_terminal_done() {
        let frame_a = json!({"choices": [{"delta": {"content": "A"}}]});
        let frame_b =
            json!({"choices": [{"delta": {"content": "B"}, "finish_reason": "stop"}]});
        let sse = format!("data: {frame_a}\n\ndata: {frame_b}\n\n");

        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/chat/completions",
                post(move || {
                    let sse = sse.clone();
                    async move {
                        ([(header::CONTENT_TYPE, "text/event-stream")], sse)
                    }
                }),
            );
        let port = serve(router).await;
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, port);

        let rx = backend
            .infer_stream(&CancellationToken::new(), request("hi", json!({})))
            .await
            .unwrap();
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data, b"A");
        assert_eq!(chunks[1].data, b"B");
        assert!(chunks[2].done);
        assert!(chunks[2].error.is_none());

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn stream_ignores_noise_and_stops_at_done_sentinel() {
        let frame = json!({"choices": [{"delta": {"content": "X"}}]});
        let sse = format!(": comment\n\nnot-data\ndata: {frame}\n\ndata: [DONE]\n\n");

        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/chat/completions",
                post(move || {
                    let sse = sse.clone();
                    async move { ([(header::CONTENT_TYPE, "text/event-stream")], sse) }
                }),
            );
        let port = serve(router).await;
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, port);

        let rx = backend
            .infer_stream(&CancellationToken::new(), request("hi", json!({})))
            .await
            .unwrap();
        let chunks = collect(rx).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, b"X");
        assert!(chunks[1].done);

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn stream_cancellation_yields_terminal_cancel_chunk() {
        // First frame arrives, then the connection stays open forever.
        let frame = json!({"choices": [{"delta": {"content": "A"}}]});
        let first = format!("data: {frame}\n\n");

        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/chat/completions",
                post(move || {
                    let first = first.clone();
                    async move {
                        let stream = futures::stream::iter(vec![Ok::<_, Infallible>(
                            axum::body::Bytes::from(first),
                        )])
                        .chain(futures::stream::pending());
                        (
                            [(header::CONTENT_TYPE, "text/event-stream")],
                            Body::from_stream(stream),
                        )
                            .into_response()
                    }
                }),
            );
        let port = serve(router).await;
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir, port);

        let ctx = CancellationToken::new();
        let mut rx = backend
            .infer_stream(&ctx, request("hi", json!({})))
            .await
            .unwrap();

        let first = rx.recv().await.expect("first delta");
        assert_eq!(first.data, b"A");

        ctx.cancel();
        let last = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("terminal within bound")
            .expect("terminal chunk");
        assert!(last.done);
        assert!(matches!(last.error, Some(Error::Canceled)));

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_without_running_server() {
        let dir = TempDir::new().unwrap();
        let backend = LlamaBackend::new(
            Path::new("/nonexistent/llama-server"),
            Arc::new(ServerSupervisor::new()),
        );
        backend.close().await.unwrap();
        let _ = dir;
    }
}
