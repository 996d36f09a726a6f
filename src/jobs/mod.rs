//! Background download jobs
//!
//! [`JobOrchestrator`] runs one fetch per job on its own task and pairs it
//! with a [`ProgressWatcher`] that samples the destination file size into
//! the job record. Callers only ever observe a job by polling the store.

pub mod orchestrator;
pub mod watcher;

pub use orchestrator::JobOrchestrator;
pub use watcher::ProgressWatcher;
