//! Runtime cache
//!
//! Holds at most one loaded model per model id. Construction for a given id
//! is serialized through a per-id gate so concurrent callers share one load;
//! the table itself sits behind a short-lived mutex.
//!
//! Handles are reference counted: `release` drops the cache's reference and
//! an in-flight run keeps its own until it finishes.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::HubError;
use crate::inference::engine::{GenerationParams, InferenceBackend, LoadedModel, PromptMessage};
use crate::types::ModelRef;

/// A loaded model bound to one local file
pub struct RuntimeHandle {
    model_id: i64,
    path: PathBuf,
    model: Box<dyn LoadedModel>,
    run_lock: Mutex<()>,
}

impl RuntimeHandle {
    pub fn model_id(&self) -> i64 {
        self.model_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run one generation. Runs on the same handle are serialized.
    /// Blocking; call from `spawn_blocking`.
    pub fn generate(
        &self,
        messages: &[PromptMessage],
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), HubError> {
        let _running = self.run_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.model.generate(messages, params, sink)
    }

    pub fn count_tokens(&self, text: &str) -> Option<usize> {
        self.model.count_tokens(text)
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("model_id", &self.model_id)
            .field("path", &self.path)
            .finish()
    }
}

type LoadGate = Arc<tokio::sync::Mutex<()>>;

pub struct RuntimeCache {
    backend: Arc<dyn InferenceBackend>,
    entries: Mutex<HashMap<i64, Arc<RuntimeHandle>>>,
    gates: Mutex<HashMap<i64, LoadGate>>,
}

impl RuntimeCache {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Return the handle for `model`, loading it if the cache has none or
    /// the cached one is bound to a different path.
    pub async fn acquire(&self, model: &ModelRef) -> Result<Arc<RuntimeHandle>, HubError> {
        let path = model
            .downloaded_path()
            .ok_or_else(|| HubError::Load("Model is not downloaded yet".to_string()))?
            .to_path_buf();

        if let Some(handle) = self.cached(model.id, &path) {
            return Ok(handle);
        }

        let gate = self.gate(model.id);
        let _loading = gate.lock().await;

        // Another caller may have finished the load while we waited.
        if let Some(handle) = self.cached(model.id, &path) {
            return Ok(handle);
        }

        if self.evict(model.id).is_some() {
            tracing::info!("Model {} moved to {}, evicting stale runtime", model.id, path.display());
        }

        tracing::info!(
            "Loading model {} from {} ({} backend)",
            model.id,
            path.display(),
            self.backend.name()
        );
        let backend = self.backend.clone();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || backend.load(&load_path))
            .await
            .map_err(|e| HubError::Load(format!("Loader task failed: {}", e)))??;

        let handle = Arc::new(RuntimeHandle {
            model_id: model.id,
            path,
            model: loaded,
            run_lock: Mutex::new(()),
        });
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.id, handle.clone());
        Ok(handle)
    }

    /// Ids with a resident runtime
    pub fn list_loaded(&self) -> HashSet<i64> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Drop the cached runtime for `model_id`. Returns whether one existed.
    pub fn release(&self, model_id: i64) -> bool {
        let released = self.evict(model_id).is_some();
        if released {
            tracing::info!("Released runtime for model {}", model_id);
        }
        released
    }

    pub async fn preload(&self, model: &ModelRef) -> Result<(), HubError> {
        self.acquire(model).await.map(|_| ())
    }

    fn cached(&self, model_id: i64, path: &Path) -> Option<Arc<RuntimeHandle>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&model_id)
            .filter(|handle| handle.path == path)
            .cloned()
    }

    fn evict(&self, model_id: i64) -> Option<Arc<RuntimeHandle>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&model_id)
    }

    fn gate(&self, model_id: i64) -> LoadGate {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model_id)
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::echo::EchoBackend;

    fn model_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"GGUF").unwrap();
        path
    }

    fn downloaded(id: i64, path: &Path) -> ModelRef {
        let mut model = ModelRef::new(id, 1, "org/repo", "m.gguf");
        model.local_path = Some(path.to_path_buf());
        model
    }

    #[tokio::test]
    async fn test_acquire_requires_download() {
        let cache = RuntimeCache::new(Arc::new(EchoBackend::new()));
        let model = ModelRef::new(1, 1, "org/repo", "m.gguf");
        let err = cache.acquire(&model).await.unwrap_err();
        assert!(matches!(err, HubError::Load(ref msg) if msg.contains("not downloaded")));
        assert!(cache.list_loaded().is_empty());
    }

    #[tokio::test]
    async fn test_same_path_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "a.gguf");
        let cache = RuntimeCache::new(Arc::new(EchoBackend::new()));
        let model = downloaded(3, &path);

        let first = cache.acquire(&model).await.unwrap();
        let second = cache.acquire(&model).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.list_loaded(), HashSet::from([3]));
    }

    #[tokio::test]
    async fn test_path_change_replaces_handle() {
        let dir = tempfile::tempdir().unwrap();
        let a = model_file(dir.path(), "a.gguf");
        let b = model_file(dir.path(), "b.gguf");
        let cache = RuntimeCache::new(Arc::new(EchoBackend::new()));

        let first = cache.acquire(&downloaded(3, &a)).await.unwrap();
        let second = cache.acquire(&downloaded(3, &b)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.path(), b.as_path());
        assert_eq!(cache.list_loaded().len(), 1);
    }

    #[tokio::test]
    async fn test_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(dir.path(), "a.gguf");
        let cache = RuntimeCache::new(Arc::new(EchoBackend::new()));
        let model = downloaded(5, &path);

        cache.preload(&model).await.unwrap();
        assert!(cache.release(5));
        assert!(!cache.release(5));
        assert!(cache.list_loaded().is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_cache_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RuntimeCache::new(Arc::new(EchoBackend::new()));
        let model = downloaded(9, &dir.path().join("missing.gguf"));

        assert!(matches!(cache.acquire(&model).await, Err(HubError::Load(_))));
        assert!(cache.list_loaded().is_empty());
    }
}
