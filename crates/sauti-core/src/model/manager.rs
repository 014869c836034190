//! Config-driven reconciliation of the model registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{self, Config, SourceType};
use crate::env;
use crate::error::{Error, Result};
use crate::model::hub::{HuggingFaceDownloader, ModelDownloader};
use crate::model::registry::ModelRegistry;
use crate::model::ModelInstance;

/// Owns the model registry and rebuilds it from configuration snapshots.
pub struct ModelManager {
    registry: RwLock<Arc<ModelRegistry>>,
    downloaders: HashMap<SourceType, Arc<dyn ModelDownloader>>,
    /// Serialises reconciliations without blocking readers.
    reconcile: Mutex<()>,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    pub fn new() -> Self {
        let mut downloaders: HashMap<SourceType, Arc<dyn ModelDownloader>> = HashMap::new();
        downloaders.insert(
            SourceType::HuggingFace,
            Arc::new(HuggingFaceDownloader::new()),
        );
        Self {
            registry: RwLock::new(Arc::new(ModelRegistry::new())),
            downloaders,
            reconcile: Mutex::new(()),
        }
    }

    /// Replace the downloader for a source type. Used by tests and by
    /// embedders wiring alternative sources.
    pub fn with_downloader(
        mut self,
        source_type: SourceType,
        downloader: Arc<dyn ModelDownloader>,
    ) -> Self {
        self.downloaders.insert(source_type, downloader);
        self
    }

    /// The current registry snapshot.
    pub async fn registry(&self) -> Arc<ModelRegistry> {
        self.registry.read().await.clone()
    }

    /// Look a model up in the current snapshot.
    pub async fn get(&self, id: &str) -> Option<Arc<ModelInstance>> {
        self.registry.read().await.get(id)
    }

    /// Rebuild the registry from a configuration snapshot.
    ///
    /// Every model id referenced by a service is materialised through its
    /// source's downloader; ids with no descriptor are skipped with a
    /// warning; entries for ids no longer referenced disappear with the
    /// snapshot swap. On a download failure the partially built snapshot
    /// is still published and the error is returned, so the caller
    /// decides whether to retry.
    pub async fn load_models_from_config(
        &self,
        ctx: &CancellationToken,
        cfg: &Config,
    ) -> Result<()> {
        let _serialised = self.reconcile.lock().await;

        let models_path = resolve_models_path(cfg);
        tokio::fs::create_dir_all(&models_path).await.map_err(|e| {
            Error::Config(format!(
                "failed to prepare models directory {}: {e}",
                models_path.display()
            ))
        })?;

        let mut next = ModelRegistry::new();
        for model_id in cfg.referenced_model_ids() {
            let Some(model_cfg) = cfg.models.get(model_id) else {
                warn!(model_id, "model not found in config, skipping");
                continue;
            };

            let source_type = model_cfg.source.source_type();
            let Some(downloader) = self.downloaders.get(&source_type) else {
                self.publish(next).await;
                return Err(Error::Config(format!(
                    "no downloader registered for source type {source_type}"
                )));
            };

            match downloader.download(ctx, model_cfg, &models_path).await {
                Ok(path) => {
                    info!(model_id, path = %path.display(), "model loaded into registry");
                    next.insert(ModelInstance::new(model_id, path, model_cfg.clone()));
                }
                Err(err) => {
                    self.publish(next).await;
                    return Err(err);
                }
            }
        }

        self.publish(next).await;
        Ok(())
    }

    async fn publish(&self, next: ModelRegistry) {
        *self.registry.write().await = Arc::new(next);
    }
}

/// Resolve the models cache directory.
///
/// Precedence: `SAUTI_MODELS_PATH`, then `storage.models_dir` from the
/// config, then the OS default cache location.
fn resolve_models_path(cfg: &Config) -> PathBuf {
    if let Ok(p) = std::env::var(env::SAUTI_MODELS_PATH) {
        let trimmed = p.trim();
        if !trimmed.is_empty() {
            return config::expand_tilde(trimmed);
        }
    }
    if let Some(dir) = &cfg.storage.models_dir {
        return config::expand_tilde(dir.to_string_lossy());
    }
    config::default_models_dir()
}
