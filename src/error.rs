//! Error taxonomy
//!
//! `Validation` is the caller's fault and never retried. `Fetch` is recorded
//! on the job; starting a failed job again is the retry. `Load` surfaces to
//! whoever asked for a runtime. `Generation` ends a stream with an error
//! event and discards partial output.

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Fetch failed: {0}")]
    Fetch(String),
    #[error("Load failed: {0}")]
    Load(String),
    #[error("Generation failed: {0}")]
    Generation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HubError {
    pub fn is_validation(&self) -> bool {
        matches!(self, HubError::Validation(_))
    }
}
