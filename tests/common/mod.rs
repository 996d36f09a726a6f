//! Shared test doubles

#![allow(dead_code)]

use async_trait::async_trait;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use llmhub::hub::ArtifactFetcher;
use llmhub::inference::{GenerationParams, InferenceBackend, LoadedModel, PromptMessage};
use llmhub::storage::MemoryStore;
use llmhub::types::{DownloadJob, ModelRef};
use llmhub::HubError;

/// Backend that counts constructions and replays a fixed token script.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pub loads: Arc<AtomicUsize>,
    pub load_delay: Duration,
    pub tokens: Vec<String>,
    pub token_delay: Duration,
    /// Pause after the last token before returning
    pub tail_delay: Duration,
    /// Fail generation after this many tokens
    pub fail_after: Option<usize>,
    /// Report `count` tokens through the model's tokenizer
    pub tokenizer: Option<usize>,
    pub last_prompt: Arc<Mutex<Vec<PromptMessage>>>,
}

impl ScriptedBackend {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Vec<PromptMessage> {
        self.last_prompt.lock().unwrap().clone()
    }
}

impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>, HubError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);

        let bytes = std::fs::read(path)
            .map_err(|e| HubError::Load(format!("cannot open {}: {}", path.display(), e)))?;
        if !bytes.starts_with(b"GGUF") {
            return Err(HubError::Load(format!("{} is not a GGUF file", path.display())));
        }
        Ok(Box::new(ScriptedModel {
            script: self.clone(),
        }))
    }
}

struct ScriptedModel {
    script: ScriptedBackend,
}

impl LoadedModel for ScriptedModel {
    fn generate(
        &self,
        messages: &[PromptMessage],
        _params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), HubError> {
        *self.script.last_prompt.lock().unwrap() = messages.to_vec();
        for (i, token) in self.script.tokens.iter().enumerate() {
            if self.script.fail_after == Some(i) {
                return Err(HubError::Generation("engine blew up".to_string()));
            }
            std::thread::sleep(self.script.token_delay);
            if sink(token).is_break() {
                return Ok(());
            }
        }
        std::thread::sleep(self.script.tail_delay);
        Ok(())
    }

    fn count_tokens(&self, _text: &str) -> Option<usize> {
        self.script.tokenizer
    }
}

/// Fetcher that appends `chunks` blocks of `chunk_size` bytes to the
/// destination, sleeping between writes.
#[derive(Clone)]
pub struct ScriptedFetcher {
    pub calls: Arc<AtomicUsize>,
    pub chunks: usize,
    pub chunk_size: usize,
    pub delay: Duration,
    /// Fail after this many chunks
    pub fail_after: Option<usize>,
}

impl ScriptedFetcher {
    pub fn new(chunks: usize, chunk_size: usize, delay: Duration) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            chunks,
            chunk_size,
            delay,
            fail_after: None,
        }
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn total_size(&self) -> u64 {
        (self.chunks * self.chunk_size) as u64
    }
}

#[async_trait]
impl ArtifactFetcher for ScriptedFetcher {
    async fn fetch(&self, _repo_id: &str, _filename: &str, dest: &Path) -> Result<PathBuf, HubError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)
            .await
            .map_err(|e| HubError::Fetch(e.to_string()))?;

        for i in 0..self.chunks {
            if self.fail_after == Some(i) {
                return Err(HubError::Fetch("connection reset".to_string()));
            }
            let mut chunk = vec![0u8; self.chunk_size];
            if i == 0 {
                chunk[..4.min(self.chunk_size)].copy_from_slice(&b"GGUF"[..4.min(self.chunk_size)]);
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| HubError::Fetch(e.to_string()))?;
            file.flush().await.map_err(|e| HubError::Fetch(e.to_string()))?;
            tokio::time::sleep(self.delay).await;
        }
        Ok(dest.to_path_buf())
    }
}

/// Poll the store until the job reaches a terminal state.
pub async fn wait_for_terminal(store: &MemoryStore, job_id: i64) -> DownloadJob {
    for _ in 0..500 {
        if let Some(job) = store.job(job_id) {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never finished", job_id);
}

/// A model file on disk, registered as downloaded.
pub async fn downloaded_model(store: &MemoryStore, dir: &Path, name: &str) -> ModelRef {
    use llmhub::storage::Store;

    let path = write_model_file(dir, name);
    let mut model = store.create_model(1, "org/repo", name);
    model.local_path = Some(path);
    model.size_bytes = Some(16);
    store.update_model(&model).await.unwrap();
    model
}

pub fn write_model_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"GGUF000000000000").unwrap();
    path
}
