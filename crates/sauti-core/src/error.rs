//! Error types shared across the gateway core.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by backends, the supervisor, and the model registry.
#[derive(Debug, Error)]
pub enum Error {
    /// A request failed validation before reaching a backend.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No backend is registered under the requested provider.
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// No model is registered under the requested id.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// A backend with the same provider is already registered.
    #[error("backend already registered: {0}")]
    AlreadyRegistered(String),

    /// Streaming was requested from a backend that does not support it.
    #[error("backend {0} does not support streaming")]
    NotStreamable(String),

    /// The configured binary does not exist on disk.
    #[error("binary not found: {0}")]
    BinaryNotFound(PathBuf),

    /// A child server crashed or misbehaved while starting.
    #[error("server {name} failed to start: {reason}")]
    StartupFailure { name: String, reason: String },

    /// A child server did not become healthy within the readiness window.
    #[error("timed out waiting for server {name} on port {port}")]
    StartupTimeout { name: String, port: u16 },

    /// HTTP transport towards a child server failed.
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A child server answered with a non-success status.
    #[error("{provider} request failed with status {status}: {body}")]
    BackendStatus {
        provider: String,
        status: u16,
        body: String,
    },

    /// A child process exited non-zero or produced undecodable output.
    #[error("child process failed: {reason}{}", fmt_stderr(.stderr))]
    ChildFailure { reason: String, stderr: String },

    /// A per-call deadline expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller's cancellation scope fired.
    #[error("operation canceled")]
    Canceled,

    /// Downloading a model artifact failed after all retries.
    #[error("download failed for {repo}: {reason}")]
    DownloadFailed { repo: String, reason: String },

    /// The configuration could not be loaded or is inconsistent.
    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\nstderr: {}", stderr.trim_end())
    }
}

impl Error {
    /// True when the error maps to a not-found condition at the API edge.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::BackendNotFound(_) | Error::ModelNotFound(_))
    }
}
