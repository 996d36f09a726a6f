//! HuggingFace hub client
//!
//! Resumable GGUF downloads plus the model search and repository listing
//! endpoints of the hub API.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::HubError;
use crate::hub::{ArtifactFetcher, ARTIFACT_EXTENSION, DEFAULT_REVISION};
use crate::types::HubConfig;

const USER_AGENT: &str = concat!("llmhub/", env!("CARGO_PKG_VERSION"));

/// Search result from the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HfModelSummary {
    pub repo_id: String,
    pub likes: Option<u64>,
    pub downloads: Option<u64>,
    pub pipeline_tag: Option<String>,
    pub tags: Vec<String>,
}

// The hub sends `id`, `modelId` or both depending on the API version.
#[derive(Debug, Deserialize)]
struct RawModelSummary {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "modelId", default)]
    model_id: Option<String>,
    #[serde(default)]
    likes: Option<u64>,
    #[serde(default)]
    downloads: Option<u64>,
    #[serde(default)]
    pipeline_tag: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl RawModelSummary {
    fn into_summary(self) -> Option<HfModelSummary> {
        let repo_id = self.model_id.or(self.id)?;
        Some(HfModelSummary {
            repo_id,
            likes: self.likes,
            downloads: self.downloads,
            pipeline_tag: self.pipeline_tag,
            tags: self.tags,
        })
    }
}

fn parse_summaries(raw: Vec<RawModelSummary>) -> Vec<HfModelSummary> {
    raw.into_iter().filter_map(RawModelSummary::into_summary).collect()
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// Client for one hub endpoint
#[derive(Clone)]
pub struct HfClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HfClient {
    pub fn new(config: &HubConfig) -> Result<Self, HubError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| HubError::Fetch(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.hf_endpoint.trim_end_matches('/').to_string(),
            token: config.hf_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    /// Download URL for a file at a revision
    pub fn resolve_url(&self, repo_id: &str, revision: &str, filename: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, repo_id, revision, filename
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Search models by free text, most downloaded first.
    pub async fn search_models(&self, query: &str, limit: usize) -> Result<Vec<HfModelSummary>, HubError> {
        let limit = limit.clamp(1, 50).to_string();
        let url = format!("{}/api/models", self.endpoint);

        let response = self
            .authorized(self.client.get(&url))
            .query(&[
                ("search", query.trim()),
                ("sort", "downloads"),
                ("direction", "-1"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| HubError::Fetch(format!("Failed to search models: {}", e)))?;

        if !response.status().is_success() {
            return Err(HubError::Fetch(format!("API error: {}", response.status())));
        }

        let raw: Vec<RawModelSummary> = response
            .json()
            .await
            .map_err(|e| HubError::Fetch(format!("Failed to parse response: {}", e)))?;

        Ok(parse_summaries(raw))
    }

    /// List files of a repository on `main`, sorted by path.
    pub async fn list_repo_files(&self, repo_id: &str, only_gguf: bool) -> Result<Vec<String>, HubError> {
        let url = format!("{}/api/models/{}/tree/main", self.endpoint, repo_id.trim());

        let response = self
            .authorized(self.client.get(&url))
            .query(&[("recursive", "true")])
            .send()
            .await
            .map_err(|e| HubError::Fetch(format!("Failed to fetch repo info: {}", e)))?;

        if !response.status().is_success() {
            return Err(HubError::Fetch(format!("API error: {}", response.status())));
        }

        let entries: Vec<TreeEntry> = response
            .json()
            .await
            .map_err(|e| HubError::Fetch(format!("Failed to parse response: {}", e)))?;

        Ok(select_files(entries, only_gguf))
    }
}

fn select_files(entries: Vec<TreeEntry>, only_gguf: bool) -> Vec<String> {
    let mut files: Vec<String> = entries
        .into_iter()
        .filter(|e| e.kind.as_deref().map(|k| k == "file").unwrap_or(true))
        .map(|e| e.path)
        .filter(|p| !only_gguf || p.to_lowercase().ends_with(ARTIFACT_EXTENSION))
        .collect();
    files.sort();
    files
}

#[async_trait]
impl ArtifactFetcher for HfClient {
    async fn fetch(&self, repo_id: &str, filename: &str, dest: &Path) -> Result<PathBuf, HubError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HubError::Fetch(format!("Failed to create model dir: {}", e)))?;
        }

        let resume_from = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let url = self.resolve_url(repo_id, DEFAULT_REVISION, filename);
        let mut request = self.authorized(self.client.get(&url));
        if resume_from > 0 {
            tracing::info!("Resuming {} from {} bytes", filename, resume_from);
            request = request.header(RANGE, format!("bytes={}-", resume_from));
        } else {
            tracing::info!("Downloading from: {}", url);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HubError::Fetch(format!("Download failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && resume_from > 0 {
            tracing::info!("{} already complete ({} bytes)", dest.display(), resume_from);
            return Ok(dest.to_path_buf());
        }
        if !status.is_success() {
            return Err(HubError::Fetch(format!("Download failed with status: {}", status)));
        }

        // A 200 to a ranged request means the server ignored the range.
        let append = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let base = if append { resume_from } else { 0 };
        let expected = response.content_length().map(|len| base + len);

        let file = if append {
            OpenOptions::new().append(true).open(dest).await
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(dest)
                .await
        }
        .map_err(|e| HubError::Fetch(format!("Failed to open {}: {}", dest.display(), e)))?;

        let mut file = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written = base;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HubError::Fetch(format!("Download error: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| HubError::Fetch(format!("Write error: {}", e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| HubError::Fetch(format!("Write error: {}", e)))?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(HubError::Fetch(format!(
                    "Download incomplete: got {} bytes, expected {}",
                    written, expected
                )));
            }
        }

        tracing::info!("Download complete: {} ({} bytes)", dest.display(), written);
        Ok(dest.to_path_buf())
    }
}
