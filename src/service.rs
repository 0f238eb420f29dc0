//! Inference service
//!
//! Composition root for request handling: owns the model cache and settings
//! and exposes completion, chat, embeddings, tokenization and model
//! management as synchronous calls. Completion and chat take a chunk sink;
//! the async adapters run them on the blocking pool and forward chunks over
//! a channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::cache::{CacheDefaults, ModelCache, ModelView};
use crate::cancel::CancelSignal;
use crate::chat::{build_chat_prompt, ChatMessage};
use crate::config::ServeSettings;
use crate::error::{NativeResultExt, Result, ServeError};
use crate::inference::{
    ChoiceOutput, Chunk, ChunkSink, FinishReason, Generation, GenerationOptions, GenerationOverrides,
    StreamEvent, Usage,
};
use crate::runtime::{NativeRuntime, Token, TokenBatch, TokenizeOptions};
use crate::store::ModelStore;
use crate::task::{ContextOverrides, ModelRequest};

/// Chunks buffered between the generation thread and a stream consumer
const STREAM_BUFFER: usize = 32;

/// Plain text completion request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    /// Prepend BOS; defaults to true
    #[serde(default)]
    pub add_special: Option<bool>,
    #[serde(flatten)]
    pub generation: GenerationOverrides,
    #[serde(default)]
    pub context: ContextOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CompletionResponse {
    pub id: String,
    pub created: DateTime<Utc>,
    pub model: String,
    pub choices: Vec<ChoiceOutput>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub generation: GenerationOverrides,
    #[serde(default)]
    pub context: ContextOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChatResponse {
    pub id: String,
    pub created: DateTime<Utc>,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

impl ChatResponse {
    /// Text of the first choice
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct EmbedRequest {
    pub model: String,
    pub input: Vec<String>,
    /// L2-normalise each vector; defaults to true
    #[serde(default)]
    pub normalize: Option<bool>,
    /// Cut inputs that exceed the context instead of failing
    #[serde(default)]
    pub truncate: Option<bool>,
    #[serde(default)]
    pub context: ContextOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct EmbedResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
    pub prompt_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TokenizeRequest {
    pub model: String,
    pub text: String,
    #[serde(default)]
    pub add_special: Option<bool>,
    #[serde(default)]
    pub parse_special: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TokenizeResponse {
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DetokenizeRequest {
    pub model: String,
    pub tokens: Vec<Token>,
    /// Render special tokens as text
    #[serde(default)]
    pub special: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DetokenizeResponse {
    pub text: String,
}

/// Request-level entry point shared by every caller
pub struct Service {
    cache: Arc<ModelCache>,
    settings: ServeSettings,
}

impl Service {
    pub fn new(cache: Arc<ModelCache>, settings: ServeSettings) -> Self {
        Self { cache, settings }
    }

    /// Builds the store and cache described by `settings`.
    pub fn from_settings(runtime: Arc<dyn NativeRuntime>, settings: ServeSettings) -> Self {
        let store = ModelStore::new(settings.models_directory.clone());
        let cache = ModelCache::new(runtime, store, CacheDefaults::from(&settings));
        Self::new(Arc::new(cache), settings)
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn settings(&self) -> &ServeSettings {
        &self.settings
    }

    pub fn list_models(&self) -> Result<Vec<ModelView>> {
        self.cache.list()
    }

    pub fn load_model(&self, reference: &str) -> Result<ModelView> {
        let entry = self
            .cache
            .load_or_get(reference, &self.cache.defaults().model_params)?;
        Ok(ModelView::loaded(&entry))
    }

    pub fn unload_model(&self, reference: &str) -> Result<ModelView> {
        self.cache.unload(reference)
    }

    /// Runs a completion, passing each filtered chunk to `on_chunk`.
    ///
    /// An error from `on_chunk` stops generation and is returned unchanged.
    pub fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancelSignal,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<CompletionResponse> {
        let mut options = self.options(&request.generation, cancel);
        let model_request = ModelRequest::new(&request.model)
            .with_context(request.context.clone())
            .with_sequences(options.n);
        let tokenize = TokenizeOptions {
            add_special: request.add_special.unwrap_or(true),
            parse_special: true,
        };

        let (model, generation) = self.cache.with_context(&model_request, |task| {
            let name = task.model().model().name.clone();
            let mut guard = task.lock();
            let tokens = guard.tokenize(&request.prompt, tokenize)?;
            let generation = guard.generator()?.run(&tokens, &mut options, on_chunk)?;
            Ok::<_, ServeError>((name, generation))
        })?;

        Ok(CompletionResponse {
            id: format!("cmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now(),
            model,
            choices: generation.choices,
            usage: generation.usage,
        })
    }

    /// Runs a chat turn. The prompt is rendered with the model's template.
    pub fn chat(
        &self,
        request: &ChatRequest,
        cancel: &CancelSignal,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<ChatResponse> {
        if request.messages.is_empty() {
            return Err(ServeError::InvalidArgument(
                "chat request has no messages".to_string(),
            ));
        }

        let mut options = self.options(&request.generation, cancel);
        let model_request = ModelRequest::new(&request.model)
            .with_context(request.context.clone())
            .with_sequences(options.n);

        let (model, generation): (String, Generation) =
            self.cache.with_context(&model_request, |task| {
                let name = task.model().model().name.clone();
                let mut guard = task.lock();
                let prompt = build_chat_prompt(guard.native(), &request.messages)?;
                let tokens = guard.tokenize(
                    &prompt,
                    TokenizeOptions {
                        add_special: true,
                        parse_special: true,
                    },
                )?;
                let generation = guard.generator()?.run(&tokens, &mut options, on_chunk)?;
                Ok::<_, ServeError>((name, generation))
            })?;

        let choices = generation
            .choices
            .into_iter()
            .map(|choice| ChatChoice {
                index: choice.index,
                message: ChatMessage::assistant(choice.text),
                finish_reason: choice.finish_reason,
            })
            .collect();

        Ok(ChatResponse {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now(),
            model,
            choices,
            usage: generation.usage,
        })
    }

    /// Pooled embedding per input, in input order.
    pub fn embed(&self, request: &EmbedRequest) -> Result<EmbedResponse> {
        if request.input.is_empty() {
            return Err(ServeError::InvalidArgument("no input to embed".to_string()));
        }
        let normalize = request.normalize.unwrap_or(true);
        let truncate = request.truncate.unwrap_or(false);
        let model_request = ModelRequest::new(&request.model)
            .with_context(request.context.clone())
            .with_embeddings(true);

        self.cache.with_context(&model_request, |task| {
            let model = task.model().model().name.clone();
            let mut embeddings = Vec::with_capacity(request.input.len());
            let mut prompt_tokens = 0u32;

            for input in &request.input {
                let mut guard = task.lock();
                let label = guard.model_path();
                let mut tokens = guard.tokenize(
                    input,
                    TokenizeOptions {
                        add_special: true,
                        parse_special: false,
                    },
                )?;
                if tokens.is_empty() {
                    return Err(ServeError::InvalidArgument("cannot embed empty input".to_string()));
                }

                let ctx = guard.context()?;
                let limit = ctx.n_batch().min(ctx.n_ctx()) as usize;
                if tokens.len() > limit {
                    if !truncate {
                        return Err(ServeError::InvalidArgument(format!(
                            "input of {} tokens exceeds the limit of {limit}",
                            tokens.len()
                        )));
                    }
                    tracing::debug!(tokens = tokens.len(), limit, "Truncating embedding input");
                    tokens.truncate(limit);
                }

                ctx.memory_clear(false);
                let mut batch = TokenBatch::new(tokens.len());
                for (pos, &token) in tokens.iter().enumerate() {
                    batch.add(token, pos as i32, &[0], true).native("batch", &label)?;
                }
                ctx.decode(&batch).native("decode", &label)?;
                let mut vector = ctx.embeddings_seq(0).native("embeddings", &label)?;

                if normalize {
                    l2_normalize(&mut vector);
                }
                prompt_tokens += tokens.len() as u32;
                embeddings.push(vector);
            }

            Ok(EmbedResponse {
                model,
                embeddings,
                prompt_tokens,
            })
        })
    }

    pub fn tokenize(&self, request: &TokenizeRequest) -> Result<TokenizeResponse> {
        let options = TokenizeOptions {
            add_special: request.add_special.unwrap_or(false),
            parse_special: request.parse_special.unwrap_or(false),
        };
        self.cache
            .with_model(&ModelRequest::new(&request.model), |task| {
                task.lock().tokenize(&request.text, options)
            })
            .map(|tokens| TokenizeResponse { tokens })
    }

    pub fn detokenize(&self, request: &DetokenizeRequest) -> Result<DetokenizeResponse> {
        let special = request.special.unwrap_or(false);
        self.cache
            .with_model(&ModelRequest::new(&request.model), |task| {
                task.lock().detokenize(&request.tokens, special)
            })
            .map(|text| DetokenizeResponse { text })
    }

    /// Streams a completion. Must be called from within a tokio runtime.
    pub fn complete_stream(
        self: &Arc<Self>,
        request: CompletionRequest,
        cancel: CancelSignal,
    ) -> ReceiverStream<StreamEvent<CompletionResponse>> {
        let service = Arc::clone(self);
        spawn_stream(cancel, move |cancel, sink| service.complete(&request, cancel, sink))
    }

    /// Streams a chat turn. Must be called from within a tokio runtime.
    pub fn chat_stream(
        self: &Arc<Self>,
        request: ChatRequest,
        cancel: CancelSignal,
    ) -> ReceiverStream<StreamEvent<ChatResponse>> {
        let service = Arc::clone(self);
        spawn_stream(cancel, move |cancel, sink| service.chat(&request, cancel, sink))
    }

    fn options(&self, overrides: &GenerationOverrides, cancel: &CancelSignal) -> GenerationOptions {
        GenerationOptions::from_overrides(&self.settings.generation, overrides).with_cancel(cancel.clone())
    }
}

/// Runs `work` on the blocking pool and forwards its chunks as stream events.
///
/// A dropped receiver cancels the work. The stream always ends with either
/// `Done` or `Error`, including when the worker panics.
fn spawn_stream<T, F>(cancel: CancelSignal, work: F) -> ReceiverStream<StreamEvent<T>>
where
    T: Send + 'static,
    F: FnOnce(&CancelSignal, &mut ChunkSink<'_>) -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let worker_tx = tx.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let mut sink = |chunk: Chunk| -> Result<()> {
            worker_tx.blocking_send(StreamEvent::Chunk(chunk)).map_err(|_| {
                tracing::debug!("Stream receiver dropped, cancelling generation");
                cancel.cancel();
                ServeError::Cancelled
            })
        };

        let event = match work(&cancel, &mut sink) {
            Ok(result) => StreamEvent::Done(result),
            Err(e) => {
                tracing::warn!("Streaming request failed: {}", e);
                StreamEvent::Error(e.to_string())
            }
        };
        let _ = worker_tx.blocking_send(event);
    });

    tokio::spawn(async move {
        if let Err(e) = handle.await {
            tracing::error!("Generation worker failed: {}", e);
            let error = ServeError::Worker(e.to_string());
            let _ = tx.send(StreamEvent::Error(error.to_string())).await;
        }
    });

    ReceiverStream::new(rx)
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}
