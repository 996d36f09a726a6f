//! Download job orchestrator
//!
//! `start(job_id)` claims the job in-process and returns immediately; the
//! fetch runs on its own task:
//!
//! 1. load the job, bail out unless it is `pending` or `failed`
//! 2. load the model, fail the job if it is gone
//! 3. validate the artifact kind
//! 4. persist `running` before any byte is requested
//! 5. derive `<models_dir>/<owner>/<safe repo>/<filename>`
//! 6. start the progress watcher
//! 7. fetch (resumable), then stop the watcher
//! 8. record the model path and size and mark the job `done`, or mark it
//!    `failed` and leave the model untouched
//!
//! Nothing escapes the task: every error ends up on the job record.

use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::HubError;
use crate::hub::{destination_path, validate_artifact, ArtifactFetcher};
use crate::jobs::ProgressWatcher;
use crate::storage::{Store, StoreConnector};
use crate::types::{DownloadJob, HubConfig, JobStatus, ModelRef};

/// Ids currently owned by a running task in this process.
#[derive(Clone, Default)]
struct ClaimSet {
    ids: Arc<Mutex<HashSet<i64>>>,
}

impl ClaimSet {
    fn claim(&self, id: i64) -> Option<Claim> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(id) {
            return None;
        }
        Some(Claim {
            set: self.clone(),
            id,
        })
    }

    fn contains(&self, id: i64) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

/// Released on drop, whatever path the task takes.
struct Claim {
    set: ClaimSet,
    id: i64,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

struct JobContext {
    connector: Arc<dyn StoreConnector>,
    fetcher: Arc<dyn ArtifactFetcher>,
    models_dir: PathBuf,
    progress_interval: Duration,
    active_models: ClaimSet,
}

/// Runs download jobs in the background
pub struct JobOrchestrator {
    ctx: Arc<JobContext>,
    active_jobs: ClaimSet,
}

impl JobOrchestrator {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        fetcher: Arc<dyn ArtifactFetcher>,
        models_dir: PathBuf,
        progress_interval: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(JobContext {
                connector,
                fetcher,
                models_dir,
                progress_interval,
                active_models: ClaimSet::default(),
            }),
            active_jobs: ClaimSet::default(),
        }
    }

    pub fn from_config(
        config: &HubConfig,
        connector: Arc<dyn StoreConnector>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self::new(
            connector,
            fetcher,
            config.models_dir.clone(),
            config.progress_interval(),
        )
    }

    /// Schedule a run of `job_id` and return immediately.
    ///
    /// Returns `None` when this process already runs that job. The handle is
    /// only useful for waiting on the run; dropping it does not cancel it.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, job_id: i64) -> Option<JoinHandle<()>> {
        let claim = match self.active_jobs.claim(job_id) {
            Some(claim) => claim,
            None => {
                tracing::debug!("Job {} is already in flight, ignoring start", job_id);
                return None;
            }
        };

        let ctx = self.ctx.clone();
        let span = tracing::info_span!("download_job", job_id);
        Some(tokio::spawn(
            async move {
                let _claim = claim;
                run_job(&ctx, job_id).await;
            }
            .instrument(span),
        ))
    }

    /// Whether a task for `job_id` is alive in this process.
    pub fn is_active(&self, job_id: i64) -> bool {
        self.active_jobs.contains(job_id)
    }
}

async fn run_job(ctx: &JobContext, job_id: i64) {
    let store = match ctx.connector.connect() {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Job {}: could not open a store session: {}", job_id, e);
            return;
        }
    };

    if let Err(e) = drive(ctx, store.as_ref(), job_id).await {
        tracing::warn!("Job {} failed: {}", job_id, e);
        if let Err(write_err) = fail_by_id(store.as_ref(), job_id, &e.to_string()).await {
            tracing::error!("Job {}: could not record failure: {}", job_id, write_err);
        }
    }
}

async fn drive(ctx: &JobContext, store: &dyn Store, job_id: i64) -> Result<(), HubError> {
    let mut job = match store.get_job(job_id).await? {
        Some(job) => job,
        None => {
            tracing::debug!("Job {} not found", job_id);
            return Ok(());
        }
    };
    if !job.status.is_startable() {
        tracing::debug!("Job {} is {}, nothing to do", job_id, job.status);
        return Ok(());
    }

    let mut model = match store.get_model(job.model_id).await? {
        Some(model) => model,
        None => {
            return fail(store, &mut job, "Model not found").await;
        }
    };

    if let Err(e) = validate_artifact(&model.filename) {
        return fail(store, &mut job, &e.to_string()).await;
    }

    let _model_claim = match ctx.active_models.claim(model.id) {
        Some(claim) => claim,
        None => {
            tracing::warn!(
                "Job {}: model {} already has a running download, leaving job {}",
                job_id,
                model.id,
                job.status
            );
            return Ok(());
        }
    };

    job.mark_running(Utc::now());
    store.update_job(&job).await?;
    tracing::info!("Job {} running: {}/{}", job_id, model.repo_id, model.filename);

    let dest = destination_path(&ctx.models_dir, model.owner_id, &model.repo_id, &model.filename);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| HubError::Fetch(format!("Failed to create {}: {}", parent.display(), e)))?;
    }

    let watcher = ProgressWatcher::spawn(
        ctx.connector.connect()?,
        job_id,
        dest.clone(),
        ctx.progress_interval,
    );
    let fetched = ctx
        .fetcher
        .fetch(&model.repo_id, &model.filename, &dest)
        .await;
    watcher.stop().await;

    // Pick up the watcher's last sample.
    if let Some(latest) = store.get_job(job_id).await? {
        job = latest;
    }

    match fetched {
        Ok(path) => finish(store, &mut job, &mut model, path).await,
        Err(e) => fail(store, &mut job, &e.to_string()).await,
    }
}

async fn finish(
    store: &dyn Store,
    job: &mut DownloadJob,
    model: &mut ModelRef,
    path: PathBuf,
) -> Result<(), HubError> {
    let final_size = match tokio::fs::metadata(&path).await {
        Ok(meta) => Some(meta.len()),
        Err(e) => {
            tracing::warn!("Could not measure {}: {}", path.display(), e);
            None
        }
    };

    model.local_path = Some(path);
    model.size_bytes = final_size;
    store.update_model(model).await?;

    job.mark_done(final_size, Utc::now());
    store.update_job(job).await?;
    tracing::info!("Job {} done ({} bytes)", job.id, job.progress_bytes);
    Ok(())
}

async fn fail(store: &dyn Store, job: &mut DownloadJob, error: &str) -> Result<(), HubError> {
    job.mark_failed(error, Utc::now());
    store.update_job(job).await?;
    tracing::warn!("Job {} failed: {}", job.id, error);
    Ok(())
}

/// Fallback used when the regular path itself errored: re-read and fail.
async fn fail_by_id(store: &dyn Store, job_id: i64, error: &str) -> Result<(), HubError> {
    if let Some(mut job) = store.get_job(job_id).await? {
        if job.status != JobStatus::Done {
            fail(store, &mut job, error).await?;
        }
    }
    Ok(())
}
