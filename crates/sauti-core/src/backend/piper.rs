//! Piper text-to-speech backend.
//!
//! No long-running server: every call invokes the piper binary once,
//! pipes the text through stdin, and reads the synthesized WAV back from
//! a temp file (piper's CLI can only write to a file).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::backend::{Backend, BackendRequest, BackendResponse, ResponseMetadata};
use crate::error::Result;
use crate::process::Executor;

/// Provider name of this backend.
pub const BACKEND_NAME: &str = "piper";

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct PiperBackend {
    executor: Executor,
    temp_dir: PathBuf,
}

impl PiperBackend {
    /// Create a piper backend. Fails when the binary does not exist.
    pub fn new(bin: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            executor: Executor::new(bin, EXEC_TIMEOUT)?,
            temp_dir: std::env::temp_dir(),
        })
    }

    /// Write temp WAV files under a different directory.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}

fn build_args(req: &BackendRequest, output_file: &Path) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        req.model_path.display().to_string(),
        "--output_file".to_string(),
        output_file.display().to_string(),
    ];

    let p = &req.parameters;
    if let Some(v) = p.get("speaker_id").and_then(Value::as_i64) {
        args.push("--speaker".to_string());
        args.push(v.to_string());
    }
    for (key, flag) in [
        ("length_scale", "--length_scale"),
        ("noise_scale", "--noise_scale"),
        ("noise_w", "--noise_w"),
        ("sentence_silence", "--sentence_silence"),
    ] {
        if let Some(v) = p.get(key).and_then(Value::as_f64) {
            args.push(flag.to_string());
            args.push(format!("{v:.2}"));
        }
    }

    args
}

/// Removes the temp WAV on every exit path.
struct TempWav(PathBuf);

impl Drop for TempWav {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!(path = %self.0.display(), error = %err, "failed to remove temp file");
            }
        }
    }
}

#[async_trait]
impl Backend for PiperBackend {
    fn provider(&self) -> &str {
        BACKEND_NAME
    }

    async fn infer(&self, ctx: &CancellationToken, req: BackendRequest) -> Result<BackendResponse> {
        let output_file = self
            .temp_dir
            .join(format!("piper_{}.wav", Uuid::new_v4().simple()));
        let _cleanup = TempWav(output_file.clone());

        let args = build_args(&req, &output_file);
        let start = Instant::now();
        let (stdout, stderr) = self
            .executor
            .execute(ctx, &args, Some(req.input.clone()))
            .await?;
        let elapsed = start.elapsed().as_secs_f64();

        let audio = tokio::fs::read(&output_file).await?;

        Ok(BackendResponse {
            metadata: ResponseMetadata {
                provider: BACKEND_NAME.to_string(),
                model: req.model_path.display().to_string(),
                timestamp: Utc::now(),
                duration_seconds: elapsed,
                output_size_bytes: audio.len() as u64,
                backend_specific: serde_json::json!({
                    "stdout": String::from_utf8_lossy(&stdout),
                    "stderr": String::from_utf8_lossy(&stderr),
                    "args": args.join(" "),
                }),
            },
            output: audio,
        })
    }

    async fn close(&self) -> Result<()> {
        // Nothing held between calls.
        Ok(())
    }
}
