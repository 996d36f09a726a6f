//! Echo backend
//!
//! Used when the crate is built without the `llama` feature. Loading checks
//! that the file exists and is non-empty; generation streams back the last
//! user turn word by word.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use crate::error::HubError;
use crate::inference::engine::{GenerationParams, InferenceBackend, LoadedModel, PromptMessage};
use crate::types::Role;

#[derive(Debug, Default)]
pub struct EchoBackend;

impl EchoBackend {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceBackend for EchoBackend {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>, HubError> {
        let meta = std::fs::metadata(path)
            .map_err(|e| HubError::Load(format!("Failed to open {}: {}", path.display(), e)))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(HubError::Load(format!(
                "{} is not a usable model file",
                path.display()
            )));
        }
        tracing::info!("Echo model bound to {}", path.display());
        Ok(Box::new(EchoModel {
            path: path.to_path_buf(),
        }))
    }
}

struct EchoModel {
    path: PathBuf,
}

impl LoadedModel for EchoModel {
    fn generate(
        &self,
        messages: &[PromptMessage],
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), HubError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| HubError::Generation("No user message to answer".to_string()))?;

        tracing::debug!("Echo generation on {}", self.path.display());
        let reply = format!("You said: {}", last_user.content.trim());
        for piece in split_words(&reply).take(params.max_tokens as usize) {
            if sink(piece).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn count_tokens(&self, _text: &str) -> Option<usize> {
        None
    }
}

/// Split into words keeping each word's leading whitespace.
fn split_words(text: &str) -> impl Iterator<Item = &str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut prev_space = false;
    for (i, c) in text.char_indices() {
        let space = c.is_whitespace();
        if space && !prev_space && i > start {
            pieces.push(&text[start..i]);
            start = i;
        }
        prev_space = space;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces.into_iter()
}
