//! Curated model catalog
//!
//! A short list of small public GGUF models so a user can try the pipeline
//! without browsing the hub.

use once_cell::sync::Lazy;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogItem {
    pub id: &'static str,
    pub label: &'static str,
    pub repo_id: &'static str,
    pub filename: &'static str,
    pub description: Option<&'static str>,
}

impl CatalogItem {
    fn haystack(&self) -> String {
        [
            self.id,
            self.label,
            self.repo_id,
            self.filename,
            self.description.unwrap_or(""),
        ]
        .join(" ")
        .to_lowercase()
    }
}

static CATALOG: Lazy<Vec<CatalogItem>> = Lazy::new(|| {
    vec![
        CatalogItem {
            id: "tinyllama-q4km",
            label: "TinyLlama 1.1B Chat (Q4_K_M, GGUF)",
            repo_id: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
            filename: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
            description: Some("Very small model for a quick CPU check of the pipeline."),
        },
        CatalogItem {
            id: "tinyllama-q5km",
            label: "TinyLlama 1.1B Chat (Q5_K_M, GGUF)",
            repo_id: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
            filename: "tinyllama-1.1b-chat-v1.0.Q5_K_M.gguf",
            description: Some("Slightly better quality per byte than Q4."),
        },
        CatalogItem {
            id: "qwen2.5-0.5b-q4km",
            label: "Qwen2.5 0.5B Instruct (Q4_K_M, GGUF)",
            repo_id: "Qwen/Qwen2.5-0.5B-Instruct-GGUF",
            filename: "qwen2.5-0.5b-instruct-q4_k_m.gguf",
            description: Some("Tiny instruct model with a chat template."),
        },
    ]
});

/// All catalog entries
pub fn catalog() -> &'static [CatalogItem] {
    &CATALOG
}

/// Case-insensitive substring search; a blank query returns everything.
pub fn search_catalog(query: Option<&str>) -> Vec<CatalogItem> {
    let needle = query.map(|q| q.trim().to_lowercase()).unwrap_or_default();
    if needle.is_empty() {
        return CATALOG.clone();
    }
    CATALOG
        .iter()
        .filter(|item| item.haystack().contains(&needle))
        .cloned()
        .collect()
}

pub fn find(id: &str) -> Option<&'static CatalogItem> {
    CATALOG.iter().find(|item| item.id == id)
}
