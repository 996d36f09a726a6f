//! Shared type definitions
//!
//! Records owned by the external store plus the runtime configuration.

pub mod config;
pub mod job;
pub mod message;
pub mod model;

pub use config::HubConfig;
pub use job::{DownloadJob, JobStatus};
pub use message::{ChatMessage, Role};
pub use model::ModelRef;
