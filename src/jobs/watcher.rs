//! Download progress watcher
//!
//! Samples the size of a file being downloaded at a fixed cadence and writes
//! it into the job's `progress_bytes` while the job is `running`. The fetch
//! side stops it through a cancellation token and waits for the task to end
//! before finalizing the job, so no sample can land after the terminal write.

use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::storage::Store;
use crate::types::JobStatus;

pub struct ProgressWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressWatcher {
    /// Start watching `path` for `job_id` on a session of its own.
    pub fn spawn(store: Box<dyn Store>, job_id: i64, path: PathBuf, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            watch(store, job_id, path, interval, token).await;
        });
        Self { cancel, handle }
    }

    /// Signal the watcher and wait until it has exited.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("Progress watcher ended abnormally: {}", e);
        }
    }
}

async fn watch(
    store: Box<dyn Store>,
    job_id: i64,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };

        let mut job = match store.get_job(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Running => job,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Progress read for job {} failed: {}", job_id, e);
                continue;
            }
        };

        if !job.record_progress(size) {
            continue;
        }
        // Re-check right before writing: the fetch may have finished while
        // the job was being read.
        if cancel.is_cancelled() {
            break;
        }
        match store.update_job(&job).await {
            Ok(()) => tracing::debug!("Job {} progress: {} bytes", job_id, size),
            Err(e) => tracing::debug!("Progress write for job {} failed: {}", job_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreConnector};
    use chrono::Utc;

    #[tokio::test]
    async fn test_watcher_samples_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, vec![0u8; 1500]).unwrap();

        let store = MemoryStore::new();
        let model = store.create_model(1, "org/repo", "model.gguf");
        let mut job = store.create_job(model.id);
        job.mark_running(Utc::now());
        store.update_job(&job).await.unwrap();

        let watcher = ProgressWatcher::spawn(
            store.connect().unwrap(),
            job.id,
            path,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        watcher.stop().await;

        assert_eq!(store.job(job.id).unwrap().progress_bytes, 1500);
    }

    #[tokio::test]
    async fn test_watcher_ignores_jobs_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let store = MemoryStore::new();
        let model = store.create_model(1, "org/repo", "model.gguf");
        let job = store.create_job(model.id);

        let watcher = ProgressWatcher::spawn(
            store.connect().unwrap(),
            job.id,
            path,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.stop().await;

        assert_eq!(store.job(job.id).unwrap().progress_bytes, 0);
    }

    #[tokio::test]
    async fn test_stopped_watcher_writes_nothing_more() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, vec![0u8; 10]).unwrap();

        let store = MemoryStore::new();
        let model = store.create_model(1, "org/repo", "model.gguf");
        let mut job = store.create_job(model.id);
        job.mark_running(Utc::now());
        store.update_job(&job).await.unwrap();

        let watcher = ProgressWatcher::spawn(
            store.connect().unwrap(),
            job.id,
            path.clone(),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        watcher.stop().await;

        std::fs::write(&path, vec![0u8; 9000]).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.job(job.id).unwrap().progress_bytes, 10);
    }
}
