mod common;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use common::{write_model_file, ScriptedBackend};
use llmhub::inference::{GenerationParams, PromptMessage, RuntimeCache};
use llmhub::types::{ModelRef, Role};
use llmhub::HubError;

fn model_at(id: i64, path: &std::path::Path) -> ModelRef {
    let mut model = ModelRef::new(id, 1, "org/repo", "m.gguf");
    model.local_path = Some(path.to_path_buf());
    model
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_loads_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model_file(dir.path(), "a.gguf");
    let backend = ScriptedBackend {
        load_delay: Duration::from_millis(100),
        ..ScriptedBackend::new(&["hi"])
    };
    let cache = Arc::new(RuntimeCache::new(Arc::new(backend.clone())));
    let model = model_at(1, &path);

    let a = tokio::spawn({
        let cache = cache.clone();
        let model = model.clone();
        async move { cache.acquire(&model).await }
    });
    let b = tokio::spawn({
        let cache = cache.clone();
        let model = model.clone();
        async move { cache.acquire(&model).await }
    });

    let first = a.await.unwrap().unwrap();
    let second = b.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(backend.load_count(), 1);
}

#[tokio::test]
async fn test_path_change_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let old_path = write_model_file(dir.path(), "old.gguf");
    let new_path = write_model_file(dir.path(), "new.gguf");
    let backend = ScriptedBackend::new(&["hi"]);
    let cache = RuntimeCache::new(Arc::new(backend.clone()));

    let old = cache.acquire(&model_at(1, &old_path)).await.unwrap();
    let again = cache.acquire(&model_at(1, &old_path)).await.unwrap();
    assert!(Arc::ptr_eq(&old, &again));

    let new = cache.acquire(&model_at(1, &new_path)).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(backend.load_count(), 2);

    // The old handle is no longer reachable through the cache.
    let current = cache.acquire(&model_at(1, &new_path)).await.unwrap();
    assert!(Arc::ptr_eq(&new, &current));
    assert_eq!(cache.list_loaded().len(), 1);
}

#[tokio::test]
async fn test_corrupt_file_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.gguf");
    std::fs::write(&path, b"not a model").unwrap();
    let backend = ScriptedBackend::new(&["hi"]);
    let cache = RuntimeCache::new(Arc::new(backend.clone()));

    let err = cache.acquire(&model_at(2, &path)).await.unwrap_err();
    assert!(matches!(err, HubError::Load(_)));
    assert!(cache.list_loaded().is_empty());

    // Failures are not cached: the next call tries again.
    let _ = cache.acquire(&model_at(2, &path)).await;
    assert_eq!(backend.load_count(), 2);
}

#[tokio::test]
async fn test_not_downloaded_model_is_rejected() {
    let backend = ScriptedBackend::new(&["hi"]);
    let cache = RuntimeCache::new(Arc::new(backend.clone()));

    let mut model = ModelRef::new(3, 1, "org/repo", "m.gguf");
    model.local_path = Some(std::path::PathBuf::new());

    let err = cache.acquire(&model).await.unwrap_err();
    assert!(matches!(err, HubError::Load(ref msg) if msg.contains("not downloaded")));
    assert_eq!(backend.load_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_does_not_break_inflight_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model_file(dir.path(), "a.gguf");
    let backend = ScriptedBackend {
        token_delay: Duration::from_millis(20),
        ..ScriptedBackend::new(&["one", " two", " three"])
    };
    let cache = RuntimeCache::new(Arc::new(backend.clone()));
    let handle = cache.acquire(&model_at(4, &path)).await.unwrap();

    let run = tokio::task::spawn_blocking({
        let handle = handle.clone();
        move || {
            let mut out = String::new();
            let prompt = [PromptMessage::new(Role::User, "count")];
            let result = handle.generate(&prompt, &GenerationParams::default(), &mut |piece: &str| {
                out.push_str(piece);
                ControlFlow::Continue(())
            });
            result.map(|_| out)
        }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.release(4));
    assert!(cache.list_loaded().is_empty());

    assert_eq!(run.await.unwrap().unwrap(), "one two three");
}
