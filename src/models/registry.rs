//! Loaded-model registry with use-counted unload draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::engine::{ModelBackend, ModelMetadata, Tokenizer};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model not loaded: {0}")]
    NotLoaded(String),

    #[error("model already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("model '{0}' still in use after drain timeout")]
    DrainTimeout(String),
}

/// One loaded model: backend + tokenizer + metadata, reference counted so
/// unload can wait for in-flight use to finish.
pub struct ModelHandle {
    pub model_id: String,
    pub backend: Arc<dyn ModelBackend>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub metadata: ModelMetadata,
    pub loaded_at: DateTime<Utc>,
    in_use: AtomicUsize,
    drained: Notify,
}

impl ModelHandle {
    pub fn new(
        model_id: String,
        backend: Arc<dyn ModelBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        metadata: ModelMetadata,
    ) -> Self {
        Self {
            model_id,
            backend,
            tokenizer,
            metadata,
            loaded_at: Utc::now(),
            in_use: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Track one in-flight use. The guard keeps unload waiting.
    pub fn acquire(self: &Arc<Self>) -> UseGuard {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        UseGuard { handle: self.clone() }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_use() == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                () = self.drained.notified() => {}
                () = tokio::time::sleep(remaining) => {}
            }
        }
    }
}

/// RAII guard for in-flight model use.
pub struct UseGuard {
    handle: Arc<ModelHandle>,
}

impl Drop for UseGuard {
    fn drop(&mut self) {
        self.handle.in_use.fetch_sub(1, Ordering::SeqCst);
        self.handle.drained.notify_waiters();
    }
}

/// Serializable model description for `runtime/state`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub parameter_count: u64,
    pub dtype: String,
    pub context_length: usize,
    pub is_vision_model: bool,
    pub loaded_at: DateTime<Utc>,
}

/// Thread-safe map of loaded models.
pub struct ModelRegistry {
    models: DashMap<String, Arc<ModelHandle>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { models: DashMap::new() }
    }

    pub fn insert(&self, handle: Arc<ModelHandle>) -> Result<(), RegistryError> {
        let model_id = handle.model_id.clone();
        match self.models.entry(model_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RegistryError::AlreadyLoaded(model_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, model_id: &str) -> Result<Arc<ModelHandle>, RegistryError> {
        self.models
            .get(model_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotLoaded(model_id.to_string()))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Remove a model, waiting (bounded) for its in-flight use to drain.
    /// The handle is removed from the map first so no new use can start.
    pub async fn remove(
        &self,
        model_id: &str,
        drain_timeout: Duration,
    ) -> Result<Arc<ModelHandle>, RegistryError> {
        let (_, handle) = self
            .models
            .remove(model_id)
            .ok_or_else(|| RegistryError::NotLoaded(model_id.to_string()))?;

        if !handle.wait_drained(drain_timeout).await {
            tracing::warn!(model_id, in_use = handle.in_use(), "unload drain timed out");
            return Err(RegistryError::DrainTimeout(model_id.to_string()));
        }
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|e| e.key().clone()).collect()
    }

    pub fn list(&self) -> Vec<ModelInfo> {
        self.models
            .iter()
            .map(|entry| {
                let handle = entry.value();
                ModelInfo {
                    model_id: handle.model_id.clone(),
                    parameter_count: handle.metadata.parameter_count,
                    dtype: handle.metadata.dtype.clone(),
                    context_length: handle.metadata.context_length,
                    is_vision_model: handle.metadata.is_vision,
                    loaded_at: handle.loaded_at,
                }
            })
            .collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BackendError;

    struct NullBackend;

    impl ModelBackend for NullBackend {
        fn forward(
            &self,
            tokens: &[Vec<u32>],
            _mask: &[Vec<u8>],
        ) -> Result<Vec<Vec<f32>>, BackendError> {
            Ok(vec![vec![0.0]; tokens.len()])
        }
        fn prefill(
            &self,
            tokens: &[u32],
            _cached: Option<&crate::engine::KvBlock>,
        ) -> Result<crate::engine::KvBlock, BackendError> {
            Ok(Arc::new(tokens.to_vec()))
        }
        fn decode_step(
            &self,
            _kv: &crate::engine::KvBlock,
            _token: Option<u32>,
        ) -> Result<Vec<f32>, BackendError> {
            Ok(vec![0.0])
        }
        fn synchronize(&self) -> Result<(), BackendError> {
            Ok(())
        }
        fn eos_token_id(&self) -> Option<u32> {
            None
        }
        fn pad_token_id(&self) -> u32 {
            0
        }
        fn vocab_size(&self) -> usize {
            1
        }
    }

    struct NullTokenizer;

    impl Tokenizer for NullTokenizer {
        fn encode(&self, _text: &str, _add: bool) -> Result<Vec<u32>, BackendError> {
            Ok(vec![0])
        }
        fn decode(&self, _tokens: &[u32]) -> Result<String, BackendError> {
            Ok(String::new())
        }
    }

    fn handle(id: &str) -> Arc<ModelHandle> {
        Arc::new(ModelHandle::new(
            id.to_string(),
            Arc::new(NullBackend),
            Arc::new(NullTokenizer),
            ModelMetadata {
                parameter_count: 1_000,
                dtype: "float16".into(),
                context_length: 4096,
                is_vision: false,
            },
        ))
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = ModelRegistry::new();
        registry.insert(handle("m1")).unwrap();
        assert!(registry.contains("m1"));
        assert_eq!(registry.get("m1").unwrap().model_id, "m1");

        registry.remove("m1", Duration::from_millis(100)).await.unwrap();
        assert!(!registry.contains("m1"));
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let registry = ModelRegistry::new();
        registry.insert(handle("m1")).unwrap();
        assert!(matches!(
            registry.insert(handle("m1")),
            Err(RegistryError::AlreadyLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing_model() {
        let registry = ModelRegistry::new();
        assert!(matches!(registry.get("nope"), Err(RegistryError::NotLoaded(_))));
    }

    #[tokio::test]
    async fn test_remove_waits_for_active_use() {
        let registry = ModelRegistry::new();
        registry.insert(handle("m1")).unwrap();
        let held = registry.get("m1").unwrap();
        let guard = held.acquire();
        assert_eq!(held.in_use(), 1);

        // Drops the guard shortly after removal starts.
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        registry.remove("m1", Duration::from_secs(2)).await.unwrap();
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_times_out_when_still_in_use() {
        let registry = ModelRegistry::new();
        registry.insert(handle("m1")).unwrap();
        let held = registry.get("m1").unwrap();
        let _guard = held.acquire();

        let result = registry.remove("m1", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(RegistryError::DrainTimeout(_))));
    }
}
