//! Completion streaming
//!
//! A run produces `start, token*, (done | error)` on a bounded channel. The
//! producer stops as soon as the receiver is dropped and then persists
//! nothing.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::HubError;
use crate::inference::cache::RuntimeCache;
use crate::inference::engine::{estimate_tokens, GenerationParams, PromptMessage};
use crate::storage::StoreConnector;
use crate::types::{ChatMessage, ModelRef, Role};

/// One event of a completion stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Start,
    Token(String),
    /// Token count of the stored reply; 0 when nothing was stored
    Done(usize),
    Error(String),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start => "start",
            StreamEvent::Token(_) => "token",
            StreamEvent::Done(_) => "done",
            StreamEvent::Error(_) => "error",
        }
    }

    pub fn data(&self) -> String {
        match self {
            StreamEvent::Start => String::new(),
            StreamEvent::Token(text) => text.clone(),
            StreamEvent::Done(count) => count.to_string(),
            StreamEvent::Error(message) => message.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_) | StreamEvent::Error(_))
    }

    /// Server-sent-events frame.
    pub fn to_sse(&self) -> String {
        let mut frame = format!("event: {}\n", self.name());
        let data = self.data();
        if data.is_empty() {
            frame.push_str("data: \n");
        } else {
            for line in data.split('\n') {
                frame.push_str("data: ");
                frame.push_str(line);
                frame.push('\n');
            }
        }
        frame.push('\n');
        frame
    }
}

/// Input of one completion run. `messages` must already end with the user
/// turn being answered.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub chat_id: i64,
    pub model: ModelRef,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

impl CompletionRequest {
    /// Prompt turns, with the system prompt first when one is set.
    pub fn prompt(&self) -> Vec<PromptMessage> {
        let mut prompt = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = self.params.system_prompt() {
            prompt.push(PromptMessage::new(Role::System, system));
        }
        prompt.extend(self.messages.iter().map(PromptMessage::from));
        prompt
    }
}

pub struct CompletionStreamer {
    cache: Arc<RuntimeCache>,
    connector: Arc<dyn StoreConnector>,
    buffer: usize,
}

impl CompletionStreamer {
    pub fn new(cache: Arc<RuntimeCache>, connector: Arc<dyn StoreConnector>, buffer: usize) -> Self {
        Self {
            cache,
            connector,
            buffer: buffer.max(1),
        }
    }

    /// Start a run and return its event stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run(&self, request: CompletionRequest) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let cache = self.cache.clone();
        let connector = self.connector.clone();
        let span = tracing::info_span!(
            "completion",
            run_id = %Uuid::new_v4(),
            chat_id = request.chat_id,
            model_id = request.model.id
        );
        tokio::spawn(drive(cache, connector, request, tx).instrument(span));
        rx
    }
}

async fn drive(
    cache: Arc<RuntimeCache>,
    connector: Arc<dyn StoreConnector>,
    request: CompletionRequest,
    tx: mpsc::Sender<StreamEvent>,
) {
    if tx.send(StreamEvent::Start).await.is_err() {
        return;
    }

    match complete(&cache, connector.as_ref(), request, &tx).await {
        Ok(Some(count)) => {
            let _ = tx.send(StreamEvent::Done(count)).await;
        }
        Ok(None) => {
            tracing::info!("Consumer went away, run abandoned");
        }
        Err(e) => {
            tracing::warn!("Completion failed: {}", e);
            let _ = tx.send(StreamEvent::Error(e.to_string())).await;
        }
    }
}

/// Returns the stored token count, or `None` if the consumer disconnected.
async fn complete(
    cache: &RuntimeCache,
    connector: &dyn StoreConnector,
    request: CompletionRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<Option<usize>, HubError> {
    let handle = cache.acquire(&request.model).await?;
    let prompt = request.prompt();
    let params = request.params.clone();
    let sender = tx.clone();

    let run_handle = handle.clone();
    let (result, text, abandoned) = tokio::task::spawn_blocking(move || {
        let mut text = String::new();
        let mut abandoned = false;
        let result = run_handle.generate(&prompt, &params, &mut |piece: &str| {
            if piece.is_empty() {
                return std::ops::ControlFlow::Continue(());
            }
            text.push_str(piece);
            if sender.blocking_send(StreamEvent::Token(piece.to_string())).is_err() {
                abandoned = true;
                return std::ops::ControlFlow::Break(());
            }
            std::ops::ControlFlow::Continue(())
        });
        (result, text, abandoned)
    })
    .await
    .map_err(|e| HubError::Generation(format!("Generation task failed: {}", e)))?;

    // The consumer may leave after the last token but before the engine
    // returns; nothing is stored for a stream nobody is reading.
    if abandoned || tx.is_closed() {
        return Ok(None);
    }
    result?;

    let reply = text.trim();
    if reply.is_empty() {
        tracing::info!("Empty completion, nothing stored");
        return Ok(Some(0));
    }

    let count = handle
        .count_tokens(reply)
        .unwrap_or_else(|| estimate_tokens(reply))
        .max(1);

    let store = connector.connect()?;
    let stored = store
        .append_message(
            request.chat_id,
            Role::Assistant,
            reply,
            Some(u32::try_from(count).unwrap_or(u32::MAX)),
        )
        .await?;
    tracing::info!("Stored reply {} ({} tokens)", stored.id, count);
    Ok(Some(count))
}
