//! Shared test fixtures: mock backends and a pre-populated dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sauti_core::config::{Config, HuggingFaceSource, ModelConfig, ModelSource, SourceType};
use sauti_core::model::ModelDownloader;
use sauti_core::{
    Backend, BackendRegistry, BackendRequest, BackendResponse, ModelManager, ResponseMetadata,
    Result, StreamChunk, StreamingBackend,
};

use crate::dispatch::Dispatcher;
use crate::state::AppState;

/// Echo backend: output is `echo:<input>`.
pub struct MockBackend {
    provider: &'static str,
}

#[async_trait]
impl Backend for MockBackend {
    fn provider(&self) -> &str {
        self.provider
    }

    async fn infer(&self, _ctx: &CancellationToken, req: BackendRequest) -> Result<BackendResponse> {
        let mut output = b"echo:".to_vec();
        output.extend(&req.input);
        Ok(BackendResponse {
            metadata: ResponseMetadata {
                provider: self.provider.to_string(),
                model: req.model_path.display().to_string(),
                timestamp: Utc::now(),
                duration_seconds: 0.01,
                output_size_bytes: output.len() as u64,
                backend_specific: serde_json::Value::Null,
            },
            output,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Streaming backend yielding "A", "B", then a terminal done chunk.
pub struct MockStreamingBackend {
    provider: &'static str,
}

#[async_trait]
impl Backend for MockStreamingBackend {
    fn provider(&self) -> &str {
        self.provider
    }

    async fn infer(&self, ctx: &CancellationToken, req: BackendRequest) -> Result<BackendResponse> {
        MockBackend {
            provider: self.provider,
        }
        .infer(ctx, req)
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn streaming(&self) -> Option<&dyn StreamingBackend> {
        Some(self)
    }
}

#[async_trait]
impl StreamingBackend for MockStreamingBackend {
    async fn infer_stream(
        &self,
        ctx: &CancellationToken,
        _req: BackendRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = mpsc::channel(1);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for piece in ["A", "B"] {
                if ctx.is_cancelled() {
                    let _ = tx.send(StreamChunk::failed(sauti_core::Error::Canceled)).await;
                    return;
                }
                if tx.send(StreamChunk::data(piece)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamChunk::done()).await;
        });
        Ok(rx)
    }
}

/// Downloader that fabricates an artifact path without touching the hub.
struct StubDownloader;

#[async_trait]
impl ModelDownloader for StubDownloader {
    async fn download(
        &self,
        _ctx: &CancellationToken,
        model: &ModelConfig,
        target_dir: &Path,
    ) -> Result<PathBuf> {
        let ModelSource::Huggingface(src) = &model.source;
        Ok(target_dir.join(&src.repo).join("model.bin"))
    }
}

/// A model manager holding one model, id `m`.
pub async fn model_manager(dir: &TempDir) -> Arc<ModelManager> {
    let mut cfg = Config {
        storage: sauti_core::config::StorageConfig {
            models_dir: Some(dir.path().to_path_buf()),
        },
        ..Default::default()
    };
    cfg.services.llm.models = vec!["m".into()];
    cfg.models.insert(
        "m".into(),
        ModelConfig {
            source: ModelSource::Huggingface(HuggingFaceSource {
                repo: "org/m".into(),
                ..Default::default()
            }),
        },
    );

    let manager =
        Arc::new(ModelManager::new().with_downloader(SourceType::HuggingFace, Arc::new(StubDownloader)));
    manager
        .load_models_from_config(&CancellationToken::new(), &cfg)
        .await
        .expect("stub reconciliation");
    manager
}

/// Dispatcher with `mock` (unary) and `mock-stream` (streaming) backends
/// plus model `m`.
pub async fn dispatcher() -> (Dispatcher, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let backends = Arc::new(BackendRegistry::new());
    backends
        .register(Arc::new(MockBackend { provider: "mock" }))
        .expect("register mock");
    backends
        .register(Arc::new(MockStreamingBackend {
            provider: "mock-stream",
        }))
        .expect("register mock-stream");
    let models = model_manager(&dir).await;
    (Dispatcher::new(backends, models), dir)
}

/// App state wired with the mock dispatcher, with providers registered
/// under the real provider names so the fixed-provider routes resolve.
pub async fn app_state() -> (AppState, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let backends = Arc::new(BackendRegistry::new());
    backends
        .register(Arc::new(MockStreamingBackend {
            provider: sauti_core::backend::llama::BACKEND_NAME,
        }))
        .expect("register llama mock");
    backends
        .register(Arc::new(MockBackend {
            provider: sauti_core::backend::whisper::BACKEND_NAME,
        }))
        .expect("register whisper mock");
    backends
        .register(Arc::new(MockBackend {
            provider: sauti_core::backend::piper::BACKEND_NAME,
        }))
        .expect("register piper mock");
    let models = model_manager(&dir).await;
    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(backends, models)),
    };
    (state, dir)
}
