//! Model hub access
//!
//! Artifact naming policy, the fetch seam used by the download orchestrator,
//! the HuggingFace client and the curated catalog.

pub mod catalog;
pub mod huggingface;

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::error::HubError;

pub use huggingface::{HfClient, HfModelSummary};

/// Accepted artifact extension
pub const ARTIFACT_EXTENSION: &str = ".gguf";

/// The only revision artifacts are fetched from
pub const DEFAULT_REVISION: &str = "main";

const HUB_HOST: &str = "huggingface.co";

/// Fetches one artifact to a local destination.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `filename` from `repo_id` into `dest`.
    ///
    /// A partial file already at `dest` must be extended, not restarted.
    /// Returns the path of the complete file.
    async fn fetch(&self, repo_id: &str, filename: &str, dest: &Path) -> Result<PathBuf, HubError>;
}

/// Reject artifacts this hub cannot serve.
pub fn validate_artifact(filename: &str) -> Result<(), HubError> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(HubError::Validation("Model filename is required".to_string()));
    }
    if !trimmed.to_lowercase().ends_with(ARTIFACT_EXTENSION) {
        return Err(HubError::Validation(format!(
            "Only {} files are supported (got '{}')",
            ARTIFACT_EXTENSION, trimmed
        )));
    }

    let path = Path::new(trimmed);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(HubError::Validation(format!(
            "Model filename must be a relative path inside the repository: '{}'",
            trimmed
        )));
    }
    Ok(())
}

/// A repository, and optionally a file in it, named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubLocator {
    pub repo_id: String,
    pub filename: Option<String>,
}

impl HubLocator {
    /// Accepts `owner/repo[/path/in/repo]` or a `huggingface.co` link,
    /// including `/blob/<rev>/` and `/resolve/<rev>/` file links.
    pub fn parse(input: &str) -> Result<Self, HubError> {
        let input = input.trim();
        let (segments, is_link) = if input.contains("://") {
            let url = reqwest::Url::parse(input)
                .map_err(|e| HubError::Validation(format!("Invalid hub link '{}': {}", input, e)))?;
            if url.host_str() != Some(HUB_HOST) {
                return Err(HubError::Validation(format!("Not a {} link: '{}'", HUB_HOST, input)));
            }
            let segments: Vec<String> = url
                .path_segments()
                .map(|parts| parts.filter(|p| !p.is_empty()).map(str::to_string).collect())
                .unwrap_or_default();
            (segments, true)
        } else {
            let path = input.split(['?', '#']).next().unwrap_or_default();
            let bare_link = path.strip_prefix(HUB_HOST).and_then(|r| r.strip_prefix('/'));
            let (path, is_link) = match bare_link {
                Some(rest) => (rest, true),
                None => (path, false),
            };
            let segments: Vec<String> = path
                .split('/')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            (segments, is_link)
        };

        let [owner, repo, rest @ ..] = segments.as_slice() else {
            return Err(HubError::Validation(format!(
                "Expected owner/repo, got '{}'",
                input
            )));
        };

        let file = match rest {
            [kind, revision, path @ ..] if kind == "blob" || kind == "resolve" => {
                if revision != DEFAULT_REVISION {
                    return Err(HubError::Validation(format!(
                        "Only the {} revision can be downloaded (got '{}')",
                        DEFAULT_REVISION, revision
                    )));
                }
                path.join("/")
            }
            // Repository pages such as /tree/main name no file.
            _ if is_link => String::new(),
            _ => rest.join("/"),
        };

        Ok(Self {
            repo_id: format!("{}/{}", owner, repo),
            filename: (!file.is_empty()).then_some(file),
        })
    }
}

/// Turn a catalog id or a hub locator into `(repo_id, filename)`.
///
/// Catalog ids are tried first. An explicit `filename` overrides the one the
/// source names; one of the two must be present.
pub fn resolve_artifact(source: &str, filename: Option<&str>) -> Result<(String, String), HubError> {
    let (repo_id, named) = match catalog::find(source.trim()) {
        Some(item) => (item.repo_id.to_string(), Some(item.filename.to_string())),
        None => {
            let locator = HubLocator::parse(source)?;
            (locator.repo_id, locator.filename)
        }
    };

    let filename = filename
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .or(named)
        .ok_or_else(|| HubError::Validation(format!("No file given for {}", repo_id)))?;
    validate_artifact(&filename)?;
    Ok((repo_id, filename))
}

/// Filesystem-safe directory name for a repository id.
pub fn safe_repo_dir(repo_id: &str) -> String {
    repo_id.trim().replace(['/', '\\'], "__")
}

/// Destination of an artifact: `<models_dir>/<owner>/<safe repo>/<filename>`.
pub fn destination_path(models_dir: &Path, owner_id: i64, repo_id: &str, filename: &str) -> PathBuf {
    models_dir
        .join(owner_id.to_string())
        .join(safe_repo_dir(repo_id))
        .join(filename.trim())
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_artifact_extension() {
        assert!(validate_artifact("tinyllama.Q4_K_M.gguf").is_ok());
        assert!(validate_artifact("Model.GGUF").is_ok());
        assert!(validate_artifact("sub/dir/model.gguf").is_ok());

        let err = validate_artifact("model.bin").unwrap_err();
        assert!(err.to_string().contains(".gguf"));
        assert!(validate_artifact("   ").is_err());
    }

    #[test]
    fn test_validate_artifact_rejects_escapes() {
        assert!(validate_artifact("../evil.gguf").is_err());
        assert!(validate_artifact("/etc/evil.gguf").is_err());
        assert!(validate_artifact("a/../../evil.gguf").is_err());
    }

    #[test]
    fn test_locator_from_file_links() {
        let blob = HubLocator::parse(
            "https://huggingface.co/TheBloke/Llama-2-7B-GGUF/blob/main/llama-2-7b.Q4_K_M.gguf",
        )
        .unwrap();
        assert_eq!(blob.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(blob.filename.as_deref(), Some("llama-2-7b.Q4_K_M.gguf"));

        let resolve = HubLocator::parse("huggingface.co/org/repo/resolve/main/q4/m.gguf?download=true").unwrap();
        assert_eq!(resolve.repo_id, "org/repo");
        assert_eq!(resolve.filename.as_deref(), Some("q4/m.gguf"));
    }

    #[test]
    fn test_locator_short_forms() {
        let nested = HubLocator::parse("org/repo/q4/model.gguf#top").unwrap();
        assert_eq!(nested.repo_id, "org/repo");
        assert_eq!(nested.filename.as_deref(), Some("q4/model.gguf"));

        let bare = HubLocator::parse(" org/repo ").unwrap();
        assert_eq!(bare.filename, None);

        let page = HubLocator::parse("https://huggingface.co/org/repo/tree/main").unwrap();
        assert_eq!(page.repo_id, "org/repo");
        assert_eq!(page.filename, None);
    }

    #[test]
    fn test_locator_rejections() {
        assert!(HubLocator::parse("just-a-name").unwrap_err().is_validation());
        assert!(HubLocator::parse("https://example.com/org/repo/m.gguf").is_err());
        let err = HubLocator::parse("https://huggingface.co/org/repo/resolve/dev/m.gguf").unwrap_err();
        assert!(err.to_string().contains("main"));
    }

    #[test]
    fn test_resolve_artifact_sources() {
        let (repo, file) = resolve_artifact("tinyllama-q4km", None).unwrap();
        assert_eq!(repo, "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF");
        assert_eq!(file, "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf");

        let (_, file) = resolve_artifact("tinyllama-q4km", Some("other.Q8_0.gguf")).unwrap();
        assert_eq!(file, "other.Q8_0.gguf");

        let (repo, file) = resolve_artifact("https://huggingface.co/org/repo/blob/main/m.gguf", None).unwrap();
        assert_eq!((repo.as_str(), file.as_str()), ("org/repo", "m.gguf"));

        let (repo, file) = resolve_artifact("org/repo", Some(" m.gguf ")).unwrap();
        assert_eq!((repo.as_str(), file.as_str()), ("org/repo", "m.gguf"));
    }

    #[test]
    fn test_resolve_artifact_needs_a_gguf_file() {
        assert!(resolve_artifact("org/repo", None).unwrap_err().is_validation());
        assert!(resolve_artifact("org/repo", Some("  ")).is_err());
        assert!(resolve_artifact("org/repo/weights.bin", None).is_err());
    }

    #[test]
    fn test_destination_path_layout() {
        let dest = destination_path(
            Path::new("/models"),
            42,
            "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
            "tinyllama.Q4_K_M.gguf",
        );
        assert_eq!(
            dest,
            PathBuf::from("/models/42/TheBloke__TinyLlama-1.1B-Chat-v1.0-GGUF/tinyllama.Q4_K_M.gguf")
        );
        assert_eq!(safe_repo_dir("a\\b/c"), "a__b__c");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }
}
