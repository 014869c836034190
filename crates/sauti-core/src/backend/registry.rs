//! Registry of backend instances keyed by provider.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{error, info};

use crate::backend::Backend;
use crate::error::{Error, Result};

/// Keyed map of provider name to backend. Lookups take a read lock;
/// registration and close take the write lock.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend. Fails when its provider is already taken; exactly
    /// one of two concurrent registrations for the same provider wins.
    pub fn register(&self, backend: Arc<dyn Backend>) -> Result<()> {
        let provider = backend.provider().to_string();
        let mut backends = self.backends.write().expect("registry lock poisoned");
        if backends.contains_key(&provider) {
            return Err(Error::AlreadyRegistered(provider));
        }
        backends.insert(provider.clone(), backend);
        info!(provider, "backend registered");
        Ok(())
    }

    /// Look a backend up by provider.
    pub fn get(&self, provider: &str) -> Option<Arc<dyn Backend>> {
        self.backends
            .read()
            .expect("registry lock poisoned")
            .get(provider)
            .cloned()
    }

    /// Close every registered backend. All backends are attempted; the
    /// first error is returned.
    pub async fn close_all(&self) -> Result<()> {
        let backends: Vec<Arc<dyn Backend>> = {
            let backends = self.backends.write().expect("registry lock poisoned");
            backends.values().cloned().collect()
        };

        let mut first_err = None;
        for backend in backends {
            match backend.close().await {
                Ok(()) => info!(provider = backend.provider(), "backend closed"),
                Err(err) => {
                    error!(provider = backend.provider(), error = %err, "failed to close backend");
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
