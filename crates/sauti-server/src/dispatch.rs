//! The shared request pipeline behind both transports.
//!
//! Validate, resolve the backend and model, build the internal request
//! with the on-disk model path, and invoke. Backends never touch the
//! model registry themselves.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use sauti_core::params::Params;
use sauti_core::{
    BackendRegistry, BackendRequest, BackendResponse, Error, ModelManager, Result, StreamChunk,
};

pub struct Dispatcher {
    backends: Arc<BackendRegistry>,
    models: Arc<ModelManager>,
}

impl Dispatcher {
    pub fn new(backends: Arc<BackendRegistry>, models: Arc<ModelManager>) -> Self {
        Self { backends, models }
    }

    /// Unary inference.
    pub async fn infer(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        model_id: &str,
        input: Vec<u8>,
        parameters: Params,
    ) -> Result<BackendResponse> {
        validate(provider, model_id)?;

        let backend = self
            .backends
            .get(provider)
            .ok_or_else(|| Error::BackendNotFound(provider.to_string()))?;
        let model = self
            .models
            .get(model_id)
            .await
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;

        let req = BackendRequest {
            model_path: model.path.clone(),
            input,
            parameters,
        };

        backend.infer(ctx, req).await.inspect_err(|err| {
            error!(provider, model_id, error = %err, "inference failed");
        })
    }

    /// Streaming inference. Fails with `NotStreamable` when the resolved
    /// backend lacks the streaming capability.
    pub async fn infer_stream(
        &self,
        ctx: &CancellationToken,
        provider: &str,
        model_id: &str,
        input: Vec<u8>,
        parameters: Params,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        validate(provider, model_id)?;

        let backend = self
            .backends
            .get(provider)
            .ok_or_else(|| Error::BackendNotFound(provider.to_string()))?;
        let Some(streaming) = backend.streaming() else {
            return Err(Error::NotStreamable(provider.to_string()));
        };
        let model = self
            .models
            .get(model_id)
            .await
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;

        let req = BackendRequest {
            model_path: model.path.clone(),
            input,
            parameters,
        };

        streaming.infer_stream(ctx, req).await.inspect_err(|err| {
            error!(provider, model_id, error = %err, "streaming inference failed");
        })
    }
}

fn validate(provider: &str, model_id: &str) -> Result<()> {
    if provider.is_empty() {
        return Err(Error::Validation("provider is required".into()));
    }
    if model_id.is_empty() {
        return Err(Error::Validation("model_id is required".into()));
    }
    Ok(())
}
