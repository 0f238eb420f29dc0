//! Native inference runtime boundary
//!
//! Everything that touches the tensor-level engine goes through the traits in
//! this module. The engine is not reentrant: no two calls involving the same
//! model (or any context derived from it) may overlap. Nothing here enforces
//! that; callers reach these handles only through [`crate::cache::ModelGuard`]
//! and [`crate::task::TaskGuard`], which hold the model's exclusive lock.

pub mod batch;
#[cfg(feature = "llama")]
pub mod llama;
pub mod sim;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::ChatMessage;

pub use batch::TokenBatch;
#[cfg(feature = "llama")]
pub use llama::LlamaRuntime;
pub use sim::{SimRuntime, SimScript};

/// Vocabulary token id.
pub type Token = i32;

/// KV-cache sequence id, scoped to one context.
pub type SeqId = i32;

/// Handle to a sampler owned by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerId(pub usize);

/// Errors reported by a native backend
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Invalid token id {0}")]
    InvalidToken(Token),

    #[error("No KV cache slot available for batch of {0} tokens")]
    NoKvSlot(usize),

    #[error("Batch is full (capacity {0})")]
    BatchFull(usize),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Embeddings unavailable: {0}")]
    Embeddings(String),

    #[error("Chat template failed: {0}")]
    ChatTemplate(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Parameters applied when a model file is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ModelParams {
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
    /// Memory-map the model file instead of reading it
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            gpu_layers: 99,
            use_mmap: true,
        }
    }
}

/// Parameters for a fresh inference context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_seq_max: u32,
    pub threads: Option<u32>,
    /// Compute embeddings instead of logits
    pub embeddings: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 512,
            n_seq_max: 1,
            threads: None,
            embeddings: false,
        }
    }
}

/// Sampler chain configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerParams {
    /// 0.0 (or below 0.01) selects greedy sampling
    pub temperature: f32,
    /// 0 disables top-k
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub seed: u32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub penalty_last_n: i32,
}

impl SamplerParams {
    pub fn is_greedy(&self) -> bool {
        self.temperature < 0.01
    }
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            seed: 0,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalty_last_n: 64,
        }
    }
}

/// Tokenizer switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenizeOptions {
    /// Prepend BOS (and any other special framing the vocabulary requires)
    pub add_special: bool,
    /// Recognise special-token text such as `</s>` in the input
    pub parse_special: bool,
}

/// Static description of a loaded model, read once from the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ModelDescription {
    pub architecture: String,
    pub description: String,
    /// Training context length (0 when unknown)
    pub n_ctx_train: u32,
    pub n_embd: u32,
    pub n_layer: u32,
    pub n_head: u32,
    pub n_params: u64,
    pub size_bytes: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Abort hook polled by a context between native steps.
pub type AbortCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// Process-wide inference engine.
pub trait NativeRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Loads a model file. Never called concurrently by [`crate::cache::ModelCache`].
    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Box<dyn NativeModel>, RuntimeError>;
}

/// A loaded model. Dropping it releases the native weights.
pub trait NativeModel: Send + Sync {
    fn describe(&self) -> ModelDescription;

    fn tokenize(&self, text: &str, options: TokenizeOptions) -> Result<Vec<Token>, RuntimeError>;

    /// Raw bytes of one token. Multi-byte characters may span several tokens.
    fn token_to_piece(&self, token: Token, special: bool) -> Result<Vec<u8>, RuntimeError>;

    fn detokenize(&self, tokens: &[Token], special: bool) -> Result<String, RuntimeError> {
        let mut bytes = Vec::new();
        for &token in tokens {
            bytes.extend_from_slice(&self.token_to_piece(token, special)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// End-of-generation tokens (EOS, EOT, ...)
    fn is_eog(&self, token: Token) -> bool;

    fn chat_template(&self) -> Option<String>;

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String, RuntimeError>;

    /// Allocates a context (and its KV cache) bound to this model.
    fn new_context(
        &self,
        params: &ContextParams,
    ) -> Result<Box<dyn NativeContext + '_>, RuntimeError>;
}

/// An inference context with its KV-cache memory.
///
/// Contexts are not `Send`; they live on the thread that created them.
pub trait NativeContext {
    fn n_ctx(&self) -> u32;
    fn n_batch(&self) -> u32;
    fn n_seq_max(&self) -> u32;

    /// Runs the forward pass over `batch`. A full cache yields
    /// [`RuntimeError::NoKvSlot`] and leaves the memory unchanged.
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError>;

    fn add_sampler(&mut self, params: &SamplerParams) -> Result<SamplerId, RuntimeError>;

    /// Samples from the logits of `batch_index` in the last decoded batch and
    /// feeds the result back into the sampler's history.
    fn sample(&mut self, sampler: SamplerId, batch_index: i32) -> Result<Token, RuntimeError>;

    /// Pooled embedding of a sequence. Requires `ContextParams::embeddings`.
    fn embeddings_seq(&self, seq: SeqId) -> Result<Vec<f32>, RuntimeError>;

    /// Drops every cached cell; `data` also zeroes the buffers.
    fn memory_clear(&mut self, data: bool);

    /// Evicts positions `[p0, p1)` of `seq` (negative bounds are open, a
    /// negative `seq` matches all sequences). Returns `false` when the memory
    /// type cannot evict a partial range.
    fn memory_seq_rm(&mut self, seq: SeqId, p0: i32, p1: i32) -> Result<bool, RuntimeError>;

    /// Copies cells of `src` in `[p0, p1)` into `dst`.
    fn memory_seq_cp(&mut self, src: SeqId, dst: SeqId, p0: i32, p1: i32)
        -> Result<(), RuntimeError>;

    /// Smallest cached position of `seq`, or -1 when empty.
    fn memory_seq_pos_min(&self, seq: SeqId) -> i32;

    /// Largest cached position of `seq`, or -1 when empty.
    fn memory_seq_pos_max(&self, seq: SeqId) -> i32;

    fn set_abort_callback(&mut self, callback: Option<AbortCallback>);
}

/// Picks the backend compiled into this build.
pub fn default_runtime() -> Result<Arc<dyn NativeRuntime>, RuntimeError> {
    #[cfg(feature = "llama")]
    {
        Ok(Arc::new(LlamaRuntime::init()?))
    }
    #[cfg(not(feature = "llama"))]
    {
        tracing::warn!("Built without the `llama` feature, using the simulated runtime");
        Ok(Arc::new(SimRuntime::new()))
    }
}
