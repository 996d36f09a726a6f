//! Configuration types
//!
//! Runtime configuration for downloads and inference.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::storage::get_data_dir;

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Root directory for downloaded models
    pub models_dir: PathBuf,
    /// Base URL of the model hub
    pub hf_endpoint: String,
    /// Access token for gated or private repositories
    pub hf_token: Option<String>,
    /// Cadence of the download progress watcher
    pub progress_interval_ms: u64,
    /// Context window used when creating inference contexts
    pub context_size: u32,
    /// Inference threads (0 = auto)
    pub threads: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Capacity of the per-completion event channel
    pub stream_buffer: usize,
    /// Connect timeout for hub requests; transfers themselves are unbounded
    pub connect_timeout_secs: u64,
}

pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            models_dir: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            hf_endpoint: DEFAULT_HF_ENDPOINT.to_string(),
            hf_token: None,
            progress_interval_ms: 1000,
            context_size: 2048,
            threads: 0,
            gpu_layers: 0,
            stream_buffer: 64,
            connect_timeout_secs: 30,
        }
    }
}

impl HubConfig {
    /// Clamp values into usable ranges.
    pub fn validate(&mut self) {
        self.progress_interval_ms = self.progress_interval_ms.max(10);
        self.context_size = self.context_size.clamp(512, 131072);
        self.stream_buffer = self.stream_buffer.max(1);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);

        if self.hf_endpoint.trim().is_empty() {
            self.hf_endpoint = DEFAULT_HF_ENDPOINT.to_string();
        }
        self.hf_endpoint = self.hf_endpoint.trim().trim_end_matches('/').to_string();

        if self
            .hf_token
            .as_deref()
            .map(|t| t.trim().is_empty())
            .unwrap_or(false)
        {
            self.hf_token = None;
        }
    }

    pub fn progress_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.progress_interval_ms)
    }
}
