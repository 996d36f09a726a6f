//! LLM inference
//!
//! The engine seam ([`InferenceBackend`] / [`LoadedModel`]), the per-model
//! runtime cache and the streaming completion driver.

pub mod cache;
pub mod echo;
pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod streaming;

pub use cache::{RuntimeCache, RuntimeHandle};
pub use engine::{create_backend, GenerationParams, InferenceBackend, LoadedModel, PromptMessage};
pub use streaming::{CompletionRequest, CompletionStreamer, StreamEvent};
