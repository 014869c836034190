//! Model artifact downloading.
//!
//! One source type exists today: the Hugging Face hub, fetched through
//! the external `hf` CLI. The downloader retries transient failures and
//! resolves the primary model file inside the downloaded tree.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ModelConfig, ModelSource};
use crate::error::{Error, Result};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Extension priority when several files match the include patterns.
const EXTENSION_PRIORITY: &[&str] = &[
    ".onnx",
    ".bin",
    ".gguf",
    ".safetensors",
    ".pt",
    ".pth",
    ".pkl",
    ".h5",
];

/// Base-name markers hinting at the primary artifact.
const NAME_PATTERNS: &[&str] = &["model", "checkpoint", "weights"];

/// Materialises a model described by config under the cache directory and
/// returns the path of the primary artifact.
#[async_trait]
pub trait ModelDownloader: Send + Sync {
    async fn download(
        &self,
        ctx: &CancellationToken,
        model: &ModelConfig,
        target_dir: &Path,
    ) -> Result<PathBuf>;
}

/// Downloader shelling out to `hf download`.
#[derive(Debug, Default)]
pub struct HuggingFaceDownloader;

impl HuggingFaceDownloader {
    pub fn new() -> Self {
        Self
    }

    fn build_args(src: &crate::config::HuggingFaceSource, local_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "download".to_string(),
            src.repo.trim().to_string(),
            "--local-dir".to_string(),
            local_dir.display().to_string(),
        ];
        if let Some(revision) = src.revision.as_deref().filter(|r| !r.is_empty()) {
            args.push("--revision".to_string());
            args.push(revision.to_string());
        }
        if let Some(repo_type) = src.repo_type.as_deref().filter(|r| !r.is_empty()) {
            args.push("--repo-type".to_string());
            args.push(repo_type.to_string());
        }
        for inc in &src.include {
            args.push("--include".to_string());
            args.push(inc.clone());
        }
        for exc in &src.exclude {
            args.push("--exclude".to_string());
            args.push(exc.clone());
        }
        if src.force_download {
            args.push("--force-download".to_string());
        }
        if let Some(token) = src.token.as_deref().filter(|t| !t.is_empty()) {
            args.push("--token".to_string());
            args.push(token.to_string());
        }
        if let Some(workers) = src.max_workers.filter(|w| *w > 0) {
            args.push("--max-workers".to_string());
            args.push(workers.to_string());
        }
        args
    }
}

#[async_trait]
impl ModelDownloader for HuggingFaceDownloader {
    async fn download(
        &self,
        ctx: &CancellationToken,
        model: &ModelConfig,
        target_dir: &Path,
    ) -> Result<PathBuf> {
        let ModelSource::Huggingface(src) = &model.source;
        let repo = src.repo.trim();
        if repo.is_empty() {
            return Err(Error::Config("huggingface source has an empty repo".into()));
        }

        let local_dir = target_dir.join(repo);
        tokio::fs::create_dir_all(&local_dir).await?;

        let args = Self::build_args(src, &local_dir);
        let mut last_err = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                info!(repo, attempt, last_error = %last_err, "retrying download");
                tokio::time::sleep(RETRY_DELAY).await;
            } else {
                info!(repo, path = %local_dir.display(), "downloading model");
            }

            let invocation = async {
                tokio::time::timeout(
                    ATTEMPT_TIMEOUT,
                    tokio::process::Command::new("hf")
                        .args(&args)
                        .kill_on_drop(true)
                        .output(),
                )
                .await
            };
            let outcome = tokio::select! {
                outcome = invocation => outcome,
                _ = ctx.cancelled() => return Err(Error::Canceled),
            };

            match outcome {
                Err(_) => {
                    warn!(repo, attempt, "download attempt timed out");
                    last_err = "attempt deadline exceeded".to_string();
                }
                Ok(Err(err)) => {
                    last_err = err.to_string();
                    warn!(repo, attempt, error = %last_err, "failed to invoke hf");
                }
                Ok(Ok(output)) if output.status.success() => {
                    info!(repo, attempt, "model downloaded");
                    return Ok(resolve_model_path(&local_dir, &src.include));
                }
                Ok(Ok(output)) => {
                    last_err = format!(
                        "hf exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                    warn!(repo, attempt, error = %last_err, "download failed");
                }
            }
        }

        Err(Error::DownloadFailed {
            repo: repo.to_string(),
            reason: last_err,
        })
    }
}

/// Resolve the primary model file inside `base_dir` from the include
/// patterns. Returns the directory itself when no single file can be
/// identified.
pub fn resolve_model_path(base_dir: &Path, include_patterns: &[String]) -> PathBuf {
    if include_patterns.is_empty() {
        return base_dir.to_path_buf();
    }

    let mut matches: Vec<PathBuf> = Vec::new();
    for pattern in include_patterns {
        let full = base_dir.join(pattern);
        let Some(full) = full.to_str() else { continue };
        match glob::glob(full) {
            Ok(paths) => matches.extend(paths.flatten()),
            Err(err) => warn!(pattern, error = %err, "invalid include pattern"),
        }
    }

    let files: Vec<PathBuf> = matches.into_iter().filter(|p| p.is_file()).collect();

    match files.len() {
        0 => {
            warn!(path = %base_dir.display(), "no files matched include patterns, using base directory");
            base_dir.to_path_buf()
        }
        1 => files.into_iter().next().expect("one match"),
        _ => match find_primary_model_file(&files) {
            Some(primary) => {
                info!(path = %primary.display(), candidates = files.len(), "resolved primary model file");
                primary
            }
            None => {
                warn!(candidates = files.len(), "ambiguous model files, using base directory");
                base_dir.to_path_buf()
            }
        },
    }
}

/// Pick the most likely primary artifact out of several candidates.
fn find_primary_model_file(files: &[PathBuf]) -> Option<PathBuf> {
    for ext in EXTENSION_PRIORITY {
        if let Some(file) = files
            .iter()
            .find(|f| f.to_string_lossy().to_lowercase().ends_with(ext))
        {
            return Some(file.clone());
        }
    }

    for pattern in NAME_PATTERNS {
        if let Some(file) = files.iter().find(|f| {
            f.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().contains(pattern))
                .unwrap_or(false)
        }) {
            return Some(file.clone());
        }
    }

    None
}
