//! Model types
//!
//! Identity of a registered model artifact.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A registered model, as kept by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub id: i64,
    /// User that registered the model; scopes the download directory
    pub owner_id: i64,
    /// Remote repository, e.g. `TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF`
    pub repo_id: String,
    /// File inside the repository
    pub filename: String,
    /// Set once a download finished
    pub local_path: Option<PathBuf>,
    /// Measured size of the downloaded file
    pub size_bytes: Option<u64>,
}

impl ModelRef {
    pub fn new(id: i64, owner_id: i64, repo_id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id,
            owner_id,
            repo_id: repo_id.into(),
            filename: filename.into(),
            local_path: None,
            size_bytes: None,
        }
    }

    /// Local path of a completed download, if any.
    ///
    /// An empty path counts as "not downloaded".
    pub fn downloaded_path(&self) -> Option<&PathBuf> {
        self.local_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded_path().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_model_is_not_downloaded() {
        let model = ModelRef::new(1, 7, "org/repo", "model.gguf");
        assert!(!model.is_downloaded());
        assert!(model.size_bytes.is_none());
    }

    #[test]
    fn test_empty_path_is_not_downloaded() {
        let mut model = ModelRef::new(1, 7, "org/repo", "model.gguf");
        model.local_path = Some(PathBuf::new());
        assert!(!model.is_downloaded());

        model.local_path = Some(PathBuf::from("/models/7/org__repo/model.gguf"));
        assert!(model.is_downloaded());
    }
}
