//! Model instances and their config-driven lifecycle.

pub mod hub;
pub mod manager;
pub mod registry;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ModelConfig;

pub use hub::{HuggingFaceDownloader, ModelDownloader};
pub use manager::ModelManager;
pub use registry::ModelRegistry;

/// Loading status of a model instance. Informational: dispatch only needs
/// the resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Failed,
    Unloading,
}

/// A model materialised on disk, as referenced by configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInstance {
    pub id: String,
    /// Absolute path of the primary model artifact.
    #[serde(skip)]
    pub path: PathBuf,
    /// The descriptor this instance was built from, kept for introspection.
    pub config: ModelConfig,
    pub status: ModelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelInstance {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, config: ModelConfig) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            config,
            status: ModelStatus::Unloaded,
            loaded_at: None,
            error: None,
        }
    }

    pub fn set_status(&mut self, status: ModelStatus) {
        self.status = status;
        if status == ModelStatus::Loaded {
            self.loaded_at = Some(Utc::now());
        }
    }
}
