//! Declarative gateway configuration.
//!
//! The config file assigns model ids to services and describes where each
//! model artifact comes from. Parsing is plain serde over YAML; schema
//! validation happens upstream of this crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{Error, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: ServicesConfig,

    /// Model descriptors keyed by model id.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Per-service model assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub llm: ServiceConfig,
    #[serde(default)]
    pub stt: ServiceConfig,
    #[serde(default)]
    pub tts: ServiceConfig,
    #[serde(default)]
    pub nlu: ServiceConfig,
}

/// A single service's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Ids of the models this service may dispatch to.
    #[serde(default)]
    pub models: Vec<String>,
}

/// Storage locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory where model artifacts are cached.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
}

/// A single model descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub source: ModelSource,
}

/// Where a model artifact comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelSource {
    Huggingface(HuggingFaceSource),
}

impl ModelSource {
    pub fn source_type(&self) -> SourceType {
        match self {
            ModelSource::Huggingface(_) => SourceType::HuggingFace,
        }
    }
}

/// Discriminant for [`ModelSource`], used to key downloader registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    HuggingFace,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::HuggingFace => f.write_str("huggingface"),
        }
    }
}

/// A model hosted on the Hugging Face hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HuggingFaceSource {
    pub repo: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub repo_type: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub force_download: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub max_workers: Option<u32>,
}

impl Config {
    /// Load a configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Ids referenced by at least one service.
    pub fn referenced_model_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .services
            .llm
            .models
            .iter()
            .chain(&self.services.stt.models)
            .chain(&self.services.tts.models)
            .chain(&self.services.nlu.models)
            .map(String::as_str)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Default HTTP port, honouring `SAUTI_SERVER_HTTP_PORT`.
pub fn default_http_port() -> u16 {
    port_from_env(env::SAUTI_SERVER_HTTP_PORT).unwrap_or(8080)
}

/// Default gRPC port, honouring `SAUTI_SERVER_GRPC_PORT`.
pub fn default_grpc_port() -> u16 {
    port_from_env(env::SAUTI_SERVER_GRPC_PORT).unwrap_or(50051)
}

fn port_from_env(var: &str) -> Option<u16> {
    std::env::var(var).ok()?.trim().parse().ok()
}

/// Default directory for config files, honouring `SAUTI_CONFIG_PATH`.
pub fn default_config_dir() -> PathBuf {
    if let Ok(p) = std::env::var(env::SAUTI_CONFIG_PATH) {
        let trimmed = p.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sauti")
}

/// Default directory for cached model artifacts.
pub fn default_models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sauti")
        .join("models")
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: impl AsRef<str>) -> PathBuf {
    let path = path.as_ref();
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
