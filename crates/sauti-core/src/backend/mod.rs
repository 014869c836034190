//! The uniform backend contract and its wire-level types.
//!
//! A backend adapts the gateway's provider-agnostic request into the wire
//! protocol of one specific inference engine. Backends are shared
//! read-only across concurrent requests and owned by the
//! [`registry::BackendRegistry`] for their lifetime.

pub mod llama;
pub mod piper;
pub mod registry;
pub mod whisper;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::params::Params;

pub use registry::BackendRegistry;

/// An inference request as seen by a backend. The front end resolves
/// `model_path` from the model registry; backends never read the registry
/// themselves.
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    /// Absolute on-disk path of the model artifact.
    pub model_path: PathBuf,
    /// Opaque input bytes: prompt text, audio, or TTS text.
    pub input: Vec<u8>,
    /// Loosely typed per-request knobs.
    pub parameters: Params,
}

/// The result of a completed inference call.
#[derive(Debug)]
pub struct BackendResponse {
    pub output: Vec<u8>,
    pub metadata: ResponseMetadata,
}

/// Metadata attached to every response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub provider: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub output_size_bytes: u64,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub backend_specific: serde_json::Value,
}

/// A single unit of a streaming response. The final chunk of every stream
/// carries `done = true`; an error chunk is always terminal.
#[derive(Debug)]
pub struct StreamChunk {
    pub data: Vec<u8>,
    pub done: bool,
    pub error: Option<Error>,
}

impl StreamChunk {
    /// A non-terminal data chunk.
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            done: false,
            error: None,
        }
    }

    /// The terminal success chunk.
    pub fn done() -> Self {
        Self {
            data: Vec::new(),
            done: true,
            error: None,
        }
    }

    /// A terminal error chunk.
    pub fn failed(error: Error) -> Self {
        Self {
            data: Vec::new(),
            done: true,
            error: Some(error),
        }
    }
}

/// Core operations every inference backend implements.
///
/// Implementations must be safe for arbitrarily many concurrent calls.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identifier of this backend, unique across the registry.
    fn provider(&self) -> &str;

    /// Execute inference and return the complete result.
    async fn infer(&self, ctx: &CancellationToken, req: BackendRequest) -> Result<BackendResponse>;

    /// Release resources, including any supervised child servers.
    async fn close(&self) -> Result<()>;

    /// Capability accessor: the streaming sub-contract, when supported.
    /// The front end checks this at dispatch instead of assuming presence.
    fn streaming(&self) -> Option<&dyn StreamingBackend> {
        None
    }
}

/// Optional streaming sub-contract.
#[async_trait]
pub trait StreamingBackend: Backend {
    /// Execute inference and stream results as they are produced. The
    /// returned channel is small-bounded so producers backpressure
    /// against slow consumers; the final chunk always has `done = true`.
    async fn infer_stream(
        &self,
        ctx: &CancellationToken,
        req: BackendRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>>;
}
