//! Snapshot registry of model instances.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::ModelInstance;

/// Immutable snapshot of `model_id → instance`.
///
/// The manager reconciles a fresh snapshot aside and publishes it whole,
/// so in-flight readers never observe a half-built table.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<ModelInstance>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance while building a snapshot.
    pub fn insert(&mut self, instance: ModelInstance) {
        self.models.insert(instance.id.clone(), Arc::new(instance));
    }

    /// Look up a model by id.
    pub fn get(&self, id: &str) -> Option<Arc<ModelInstance>> {
        self.models.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<ModelInstance>> {
        self.models.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
