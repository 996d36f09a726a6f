//! Persistent storage
//!
//! The core never owns persistence. It talks to an external job/model store
//! through [`Store`], and every concurrently running unit (a download, its
//! progress watcher, a completion run) opens its own session through
//! [`StoreConnector`] so commits from different units never interleave on
//! one connection.

pub mod memory;
pub mod settings;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{ChatMessage, DownloadJob, ModelRef, Role};

pub use memory::MemoryStore;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not determine the application data directory")]
    DataDir,
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// One session against the job/model store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_model(&self, id: i64) -> Result<Option<ModelRef>, StorageError>;

    async fn get_job(&self, id: i64) -> Result<Option<DownloadJob>, StorageError>;

    /// Overwrite the stored job with `job`.
    async fn update_job(&self, job: &DownloadJob) -> Result<(), StorageError>;

    /// Overwrite the stored model with `model`.
    async fn update_model(&self, model: &ModelRef) -> Result<(), StorageError>;

    /// Messages of `chat_id` with id `<= up_to`, oldest first.
    async fn get_messages(&self, chat_id: i64, up_to: i64) -> Result<Vec<ChatMessage>, StorageError>;

    async fn append_message(
        &self,
        chat_id: i64,
        role: Role,
        content: &str,
        tokens_used: Option<u32>,
    ) -> Result<ChatMessage, StorageError>;
}

/// Opens independent store sessions.
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Store>, StorageError>;
}

/// Application data directory
///
/// Linux: ~/.local/share/llmhub, macOS: ~/Library/Application Support/llmhub
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "llmhub", "llmhub")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::DataDir)
}
