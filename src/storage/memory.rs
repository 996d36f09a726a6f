//! In-process store
//!
//! A [`Store`] kept in concurrent maps. Every session handed out by
//! [`MemoryStore::connect`] shares the same tables, which makes it the
//! backing store of the CLI and of the test suite.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::HubError;
use crate::hub::validate_artifact;
use crate::storage::{StorageError, Store, StoreConnector};
use crate::types::{ChatMessage, DownloadJob, ModelRef, Role};

#[derive(Default)]
struct Tables {
    models: DashMap<i64, ModelRef>,
    jobs: DashMap<i64, DownloadJob>,
    messages: DashMap<i64, Vec<ChatMessage>>,
    next_id: AtomicI64,
    sessions: AtomicUsize,
}

impl Tables {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Shared in-memory tables
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model record (not yet downloaded).
    pub fn create_model(&self, owner_id: i64, repo_id: &str, filename: &str) -> ModelRef {
        let model = ModelRef::new(self.tables.next_id(), owner_id, repo_id, filename);
        self.tables.models.insert(model.id, model.clone());
        model
    }

    /// Create a `pending` job for an existing model.
    pub fn create_job(&self, model_id: i64) -> DownloadJob {
        let job = DownloadJob::pending(self.tables.next_id(), model_id);
        self.tables.jobs.insert(job.id, job.clone());
        job
    }

    /// Validate the artifact, then register the model and its first job.
    pub fn register_download(
        &self,
        owner_id: i64,
        repo_id: &str,
        filename: &str,
    ) -> Result<(ModelRef, DownloadJob), HubError> {
        validate_artifact(filename)?;
        if repo_id.trim().is_empty() {
            return Err(HubError::Validation("Repository id is required".to_string()));
        }
        let model = self.create_model(owner_id, repo_id.trim(), filename.trim());
        let job = self.create_job(model.id);
        Ok((model, job))
    }

    /// Store a message on behalf of the caller layer (e.g. a user turn).
    pub fn add_message(&self, chat_id: i64, role: Role, content: &str) -> ChatMessage {
        self.push_message(chat_id, role, content, None)
    }

    pub fn model(&self, id: i64) -> Option<ModelRef> {
        self.tables.models.get(&id).map(|m| m.value().clone())
    }

    pub fn job(&self, id: i64) -> Option<DownloadJob> {
        self.tables.jobs.get(&id).map(|j| j.value().clone())
    }

    /// All messages of a chat, oldest first.
    pub fn chat_messages(&self, chat_id: i64) -> Vec<ChatMessage> {
        self.tables
            .messages
            .get(&chat_id)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    /// Number of sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.tables.sessions.load(Ordering::SeqCst)
    }

    fn push_message(
        &self,
        chat_id: i64,
        role: Role,
        content: &str,
        tokens_used: Option<u32>,
    ) -> ChatMessage {
        let message = ChatMessage {
            id: self.tables.next_id(),
            chat_id,
            role,
            content: content.to_string(),
            tokens_used,
            created_at: Utc::now(),
        };
        self.tables
            .messages
            .entry(chat_id)
            .or_default()
            .push(message.clone());
        message
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_model(&self, id: i64) -> Result<Option<ModelRef>, StorageError> {
        Ok(self.model(id))
    }

    async fn get_job(&self, id: i64) -> Result<Option<DownloadJob>, StorageError> {
        Ok(self.job(id))
    }

    async fn update_job(&self, job: &DownloadJob) -> Result<(), StorageError> {
        match self.tables.jobs.get_mut(&job.id) {
            Some(mut stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("job {}", job.id))),
        }
    }

    async fn update_model(&self, model: &ModelRef) -> Result<(), StorageError> {
        match self.tables.models.get_mut(&model.id) {
            Some(mut stored) => {
                *stored = model.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("model {}", model.id))),
        }
    }

    async fn get_messages(&self, chat_id: i64, up_to: i64) -> Result<Vec<ChatMessage>, StorageError> {
        Ok(self
            .chat_messages(chat_id)
            .into_iter()
            .filter(|m| m.id <= up_to)
            .collect())
    }

    async fn append_message(
        &self,
        chat_id: i64,
        role: Role,
        content: &str,
        tokens_used: Option<u32>,
    ) -> Result<ChatMessage, StorageError> {
        Ok(self.push_message(chat_id, role, content, tokens_used))
    }
}

impl StoreConnector for MemoryStore {
    fn connect(&self) -> Result<Box<dyn Store>, StorageError> {
        self.tables.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_download_creates_pending_job() {
        let store = MemoryStore::new();
        let (model, job) = store
            .register_download(3, "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF", "tiny.Q4_K_M.gguf")
            .unwrap();

        assert_eq!(job.model_id, model.id);
        assert_eq!(job.status, crate::types::JobStatus::Pending);
        assert_eq!(store.model(model.id).unwrap().owner_id, 3);
    }

    #[test]
    fn test_register_download_rejects_non_gguf() {
        let store = MemoryStore::new();
        let err = store.register_download(3, "org/repo", "model.bin").unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[tokio::test]
    async fn test_messages_filtered_up_to_id() {
        let store = MemoryStore::new();
        let first = store.add_message(10, Role::User, "hello");
        store.add_message(10, Role::Assistant, "hi");
        store.add_message(11, Role::User, "other chat");

        let upto_first = store.get_messages(10, first.id).await.unwrap();
        assert_eq!(upto_first.len(), 1);
        assert_eq!(upto_first[0].content, "hello");

        let all = store.get_messages(10, i64::MAX).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_job_fails() {
        let store = MemoryStore::new();
        let err = store.update_job(&DownloadJob::pending(99, 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_connect_counts_sessions() {
        let store = MemoryStore::new();
        let _a = store.connect().unwrap();
        let _b = store.connect().unwrap();
        assert_eq!(store.sessions_opened(), 2);
    }
}
