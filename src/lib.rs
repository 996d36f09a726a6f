//! llmhub library
//!
//! Background GGUF downloads from a model hub, a per-model runtime cache and
//! streamed chat completions.

pub mod error;
pub mod hub;
pub mod inference;
pub mod jobs;
pub mod logging;
pub mod service;
pub mod storage;
pub mod types;

pub use error::HubError;
pub use service::ChatService;
