//! Download job types
//!
//! One tracked attempt to fetch a model artifact and its state machine:
//! `pending -> running -> {done, failed}`. A `failed` job may be started
//! again; `running` and `done` jobs may not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Whether a start request may pick this job up.
    pub fn is_startable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: i64,
    pub model_id: i64,
    pub status: JobStatus,
    /// Bytes on disk so far; never decreases while running
    pub progress_bytes: u64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn pending(id: i64, model_id: i64) -> Self {
        Self {
            id,
            model_id,
            status: JobStatus::Pending,
            progress_bytes: 0,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.error = None;
        self.progress_bytes = 0;
        self.started_at = Some(now);
        self.finished_at = None;
    }

    /// Final transition on success. `final_size` replaces the watcher's
    /// last sample when the file could be measured.
    pub fn mark_done(&mut self, final_size: Option<u64>, now: DateTime<Utc>) {
        self.status = JobStatus::Done;
        if let Some(size) = final_size {
            self.progress_bytes = size;
        }
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(now);
    }

    /// Record a progress sample, ignoring anything that would move backwards.
    ///
    /// Returns whether the stored value changed.
    pub fn record_progress(&mut self, bytes: u64) -> bool {
        if self.status != JobStatus::Running || bytes <= self.progress_bytes {
            return false;
        }
        self.progress_bytes = bytes;
        true
    }
}
