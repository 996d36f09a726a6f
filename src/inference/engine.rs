//! Inference engine seam
//!
//! Backends construct [`LoadedModel`]s from a local file; a loaded model
//! runs one generation at a time and pushes text increments into a sink.
//! Both calls block and are always driven from `spawn_blocking`.

use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use crate::error::HubError;
use crate::types::{ChatMessage, HubConfig, Role};

/// One prompt turn handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&ChatMessage> for PromptMessage {
    fn from(message: &ChatMessage) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

/// Sampling parameters for one completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Penalty applied to recently generated tokens
    pub repeat_penalty: f32,
    /// Prepended as a system turn when non-empty
    pub system_prompt: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            system_prompt: None,
        }
    }
}

impl GenerationParams {
    /// Ensure all parameters are within acceptable ranges.
    pub fn validate(&mut self, context_size: u32) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }

        self.max_tokens = self.max_tokens.clamp(1, context_size.max(1));
        self.repeat_penalty = self.repeat_penalty.max(0.0);

        if self
            .system_prompt
            .as_deref()
            .map(|p| p.trim().is_empty())
            .unwrap_or(false)
        {
            self.system_prompt = None;
        }
    }

    /// Trimmed system prompt, if any
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// A model resident in memory
pub trait LoadedModel: Send + Sync {
    /// Generate a reply to `messages`, feeding each text increment to `sink`
    /// in order. Stops early when the sink returns `Break`.
    fn generate(
        &self,
        messages: &[PromptMessage],
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), HubError>;

    /// Token count according to the model's own tokenizer, when it has one.
    fn count_tokens(&self, text: &str) -> Option<usize>;
}

/// Constructs loaded models from local files
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build a model bound to `path`. Failures are `HubError::Load`.
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>, HubError>;
}

/// Coarse token estimate used when no tokenizer is available.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Backend selected at build time.
pub fn create_backend(config: &HubConfig) -> Arc<dyn InferenceBackend> {
    #[cfg(feature = "llama")]
    {
        Arc::new(crate::inference::llama::LlamaBackendEngine::new(config))
    }

    #[cfg(not(feature = "llama"))]
    {
        let _ = config;
        Arc::new(crate::inference::echo::EchoBackend::new())
    }
}
