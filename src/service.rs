//! Request-facing operations
//!
//! [`ChatService`] wires the orchestrator, the runtime cache and the
//! streamer together and performs the caller-side checks before a
//! completion run is started.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::HubError;
use crate::hub::{ArtifactFetcher, HfClient};
use crate::inference::{
    create_backend, CompletionRequest, CompletionStreamer, GenerationParams, InferenceBackend,
    RuntimeCache, RuntimeHandle, StreamEvent,
};
use crate::jobs::JobOrchestrator;
use crate::storage::StoreConnector;
use crate::types::{HubConfig, ModelRef, Role};

pub struct ChatService {
    config: HubConfig,
    connector: Arc<dyn StoreConnector>,
    orchestrator: JobOrchestrator,
    cache: Arc<RuntimeCache>,
    streamer: CompletionStreamer,
}

impl ChatService {
    pub fn new(
        config: HubConfig,
        connector: Arc<dyn StoreConnector>,
        fetcher: Arc<dyn ArtifactFetcher>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        let orchestrator = JobOrchestrator::from_config(&config, connector.clone(), fetcher);
        let cache = Arc::new(RuntimeCache::new(backend));
        let streamer = CompletionStreamer::new(cache.clone(), connector.clone(), config.stream_buffer);
        Self {
            config,
            connector,
            orchestrator,
            cache,
            streamer,
        }
    }

    /// Service backed by the hub client and the backend this build carries.
    pub fn from_config(config: HubConfig, connector: Arc<dyn StoreConnector>) -> Result<Self, HubError> {
        let fetcher = Arc::new(HfClient::new(&config)?);
        let backend = create_backend(&config);
        tracing::info!("Inference backend: {}", backend.name());
        Ok(Self::new(config, connector, fetcher, backend))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Fire-and-forget. Returns a handle to await the run, or `None` if the
    /// job is already being run by this process.
    pub fn start_download(&self, job_id: i64) -> Option<JoinHandle<()>> {
        self.orchestrator.start(job_id)
    }

    pub async fn acquire_runtime(&self, model: &ModelRef) -> Result<Arc<RuntimeHandle>, HubError> {
        self.cache.acquire(model).await
    }

    pub fn list_loaded_model_ids(&self) -> HashSet<i64> {
        self.cache.list_loaded()
    }

    pub fn release_runtime(&self, model_id: i64) -> bool {
        self.cache.release(model_id)
    }

    /// Warm the cache. Same failures as [`ChatService::acquire_runtime`].
    pub async fn preload_runtime(&self, model: &ModelRef) -> Result<(), HubError> {
        self.cache.preload(model).await
    }

    /// Validate the request and start a completion answering
    /// `after_message_id`, which must be the chat's latest message and a
    /// user turn.
    pub async fn stream_completion(
        &self,
        chat_id: i64,
        model_id: i64,
        after_message_id: i64,
        mut params: GenerationParams,
    ) -> Result<mpsc::Receiver<StreamEvent>, HubError> {
        let store = self.connector.connect()?;

        let model = store
            .get_model(model_id)
            .await?
            .ok_or_else(|| HubError::Validation("Model not found".to_string()))?;
        if !model.is_downloaded() {
            return Err(HubError::Validation("Model is not downloaded yet".to_string()));
        }

        let messages = store.get_messages(chat_id, i64::MAX).await?;
        match messages.last() {
            Some(last) if last.id == after_message_id && last.role == Role::User => {}
            _ => {
                return Err(HubError::Validation(
                    "after_message_id must be the last user message id".to_string(),
                ))
            }
        }

        params.validate(self.config.context_size);
        Ok(self.streamer.run(CompletionRequest {
            chat_id,
            model,
            messages,
            params,
        }))
    }
}
