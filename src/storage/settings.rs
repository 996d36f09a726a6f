//! Configuration storage
//!
//! Loads [`HubConfig`] from a JSON file and applies environment overrides.

use crate::storage::{get_data_dir, StorageError};
use crate::types::HubConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config file location
pub fn default_config_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("config.json"))
}

/// Load configuration from `path` (or the default location).
///
/// Returns defaults if the file doesn't exist or is corrupted. Environment
/// overrides (`MODELS_DIR`, `HF_TOKEN`, `HF_ENDPOINT`) win over file values.
pub fn load_config(path: Option<&Path>) -> HubConfig {
    let mut config = match load_config_internal(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            HubConfig::default()
        }
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate();
    config
}

fn load_config_internal(path: Option<&Path>) -> Result<HubConfig, StorageError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    if !path.exists() {
        tracing::info!("Config file not found at {}, using defaults", path.display());
        return Ok(HubConfig::default());
    }

    let json = fs::read_to_string(&path)?;
    let config: HubConfig = serde_json::from_str(&json)?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Apply overrides from a variable lookup.
pub fn apply_env_overrides(config: &mut HubConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = lookup("MODELS_DIR").filter(|v| !v.trim().is_empty()) {
        config.models_dir = PathBuf::from(dir);
    }
    if let Some(token) = lookup("HF_TOKEN") {
        config.hf_token = Some(token);
    }
    if let Some(endpoint) = lookup("HF_ENDPOINT").filter(|v| !v.trim().is_empty()) {
        config.hf_endpoint = endpoint;
    }
}

/// Save configuration as pretty JSON
pub fn save_config(config: &HubConfig, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {}", path.display());
    Ok(())
}
