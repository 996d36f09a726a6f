//! llama.cpp backend
//!
//! One process-wide `LlamaBackend`; each loaded model owns its weights and
//! creates a fresh context per generation.

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use once_cell::sync::OnceCell;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::path::Path;

use crate::error::HubError;
use crate::inference::engine::{GenerationParams, InferenceBackend, LoadedModel, PromptMessage};
use crate::types::HubConfig;

static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn llama_backend() -> Result<&'static LlamaBackend, HubError> {
    LLAMA_BACKEND.get_or_try_init(|| {
        LlamaBackend::init().map_err(|e| HubError::Load(format!("Failed to init llama backend: {}", e)))
    })
}

/// Tokens of the repetition window
const PENALTY_LAST_N: i32 = 64;

pub struct LlamaBackendEngine {
    context_size: u32,
    threads: i32,
    gpu_layers: u32,
}

impl LlamaBackendEngine {
    pub fn new(config: &HubConfig) -> Self {
        let threads = if config.threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as i32)
                .unwrap_or(4)
        } else {
            config.threads as i32
        };
        Self {
            context_size: config.context_size,
            threads,
            gpu_layers: config.gpu_layers,
        }
    }
}

impl InferenceBackend for LlamaBackendEngine {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModel>, HubError> {
        let backend = llama_backend()?;
        let params = LlamaModelParams::default().with_n_gpu_layers(self.gpu_layers);
        let model = LlamaModel::load_from_file(backend, path, &params)
            .map_err(|e| HubError::Load(format!("Failed to load model from {}: {}", path.display(), e)))?;

        tracing::info!(
            "Model loaded: {} ({} layers on GPU)",
            path.display(),
            self.gpu_layers
        );
        Ok(Box::new(LlamaLoaded {
            backend,
            model,
            context_size: self.context_size,
            threads: self.threads,
        }))
    }
}

struct LlamaLoaded {
    backend: &'static LlamaBackend,
    model: LlamaModel,
    context_size: u32,
    threads: i32,
}

impl LlamaLoaded {
    /// Render the conversation with the model's chat template, falling back
    /// to ChatML when the model ships none.
    fn render_prompt(&self, messages: &[PromptMessage]) -> String {
        let templated = self.model.chat_template(None).ok().and_then(|template| {
            let chat = messages
                .iter()
                .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
                .collect::<Result<Vec<_>, _>>()
                .ok()?;
            self.model.apply_chat_template(&template, &chat, true).ok()
        });

        templated.unwrap_or_else(|| {
            tracing::debug!("No usable chat template, using ChatML");
            chatml(messages)
        })
    }

    fn sampler(params: &GenerationParams) -> LlamaSampler {
        if params.temperature <= 0.0 {
            return LlamaSampler::greedy();
        }
        let seed = rand_seed();
        LlamaSampler::chain_simple([
            LlamaSampler::penalties(PENALTY_LAST_N, params.repeat_penalty, 0.0, 0.0),
            LlamaSampler::top_k(params.top_k as i32),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    }
}

impl LoadedModel for LlamaLoaded {
    fn generate(
        &self,
        messages: &[PromptMessage],
        params: &GenerationParams,
        sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), HubError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.context_size))
            .with_n_threads(self.threads)
            .with_n_threads_batch(self.threads);
        let mut ctx = self
            .model
            .new_context(self.backend, ctx_params)
            .map_err(|e| HubError::Generation(format!("Context creation failed: {}", e)))?;

        let prompt = self.render_prompt(messages);
        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| HubError::Generation(format!("Tokenize failed: {}", e)))?;

        let n_ctx = self.context_size as usize;
        if tokens.len() >= n_ctx {
            return Err(HubError::Generation(format!(
                "Prompt is {} tokens, context holds {}",
                tokens.len(),
                n_ctx
            )));
        }

        let mut batch = LlamaBatch::new(n_ctx, 1);
        let last_index = tokens.len() as i32 - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i as i32 == last_index)
                .map_err(|e| HubError::Generation(format!("Batch add failed: {}", e)))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| HubError::Generation(format!("Decode prompt failed: {}", e)))?;

        let mut sampler = Self::sampler(params);
        let budget = (params.max_tokens as usize).min(n_ctx - tokens.len());
        let mut n_cur = tokens.len() as i32;
        let mut pending: Vec<u8> = Vec::new();

        for _ in 0..budget {
            let token: LlamaToken = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if self.model.is_eog_token(token) {
                break;
            }

            let bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| HubError::Generation(format!("Detokenize failed: {}", e)))?;
            pending.extend_from_slice(&bytes);
            if let Some(piece) = take_utf8(&mut pending) {
                if sink(&piece).is_break() {
                    return Ok(());
                }
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| HubError::Generation(format!("Batch add failed: {}", e)))?;
            n_cur += 1;
            ctx.decode(&mut batch)
                .map_err(|e| HubError::Generation(format!("Decode failed: {}", e)))?;
        }

        if flush_pending(&mut pending, sink).is_break() {
            tracing::debug!("Sink stopped on the trailing bytes");
        }
        Ok(())
    }

    fn count_tokens(&self, text: &str) -> Option<usize> {
        self.model
            .str_to_token(text, AddBos::Never)
            .ok()
            .map(|tokens| tokens.len())
    }
}

/// Drain the longest valid UTF-8 prefix of `pending`. An incomplete trailing
/// sequence stays buffered; invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> Option<String> {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            return Some(text);
        }
    };
    if valid == 0 {
        return None;
    }
    let rest = pending.split_off(valid);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    Some(text)
}

/// Hand whatever is left in `pending` to the sink, replacing bytes that
/// never formed a complete character.
fn flush_pending(pending: &mut Vec<u8>, sink: &mut dyn FnMut(&str) -> ControlFlow<()>) -> ControlFlow<()> {
    if pending.is_empty() {
        return ControlFlow::Continue(());
    }
    let rest = String::from_utf8_lossy(pending).into_owned();
    pending.clear();
    sink(&rest)
}

fn chatml(messages: &[PromptMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(message.role.as_str());
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn rand_seed() -> u32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ std::process::id()
}
