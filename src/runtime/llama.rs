//! llama.cpp backend
//!
//! Thin adapter from the runtime traits onto `llama-cpp-2`. All native state
//! lives in the wrapped handles; the only bookkeeping kept here is the lowest
//! cached position per sequence, which the bindings do not expose.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::DecodeError;

use crate::chat::ChatMessage;
use crate::runtime::{
    AbortCallback, ContextParams, ModelDescription, ModelParams, NativeContext, NativeModel,
    NativeRuntime, RuntimeError, SamplerId, SamplerParams, SeqId, Token, TokenBatch,
    TokenizeOptions,
};

/// llama.cpp's return code for a decode interrupted by the abort callback
const DECODE_ABORTED: i32 = 2;

/// Process-wide llama.cpp backend
pub struct LlamaRuntime {
    backend: Arc<LlamaBackend>,
}

impl LlamaRuntime {
    /// Initializes the backend. llama.cpp allows this once per process.
    pub fn init() -> Result<Self, RuntimeError> {
        let backend = LlamaBackend::init()
            .map_err(|e| RuntimeError::ModelLoad(format!("backend init failed: {e}")))?;
        tracing::info!("LlamaBackend initialized");
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl NativeRuntime for LlamaRuntime {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Box<dyn NativeModel>, RuntimeError> {
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        if !params.use_mmap {
            tracing::debug!("mmap disabled in settings; the bindings always map the file");
        }

        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?;
        let description = describe(&model);

        tracing::info!(
            "Model info extracted: {} ({} params, {} ctx)",
            path.display(),
            description.n_params,
            description.n_ctx_train
        );

        Ok(Box::new(LlamaNativeModel {
            model,
            backend: Arc::clone(&self.backend),
            path: path.to_path_buf(),
            description,
        }))
    }
}

fn describe(model: &LlamaModel) -> ModelDescription {
    let mut metadata = BTreeMap::new();
    for i in 0..model.meta_count() {
        if let (Ok(key), Ok(value)) = (model.meta_key_by_index(i), model.meta_val_str_by_index(i)) {
            metadata.insert(key, value);
        }
    }

    ModelDescription {
        architecture: metadata
            .get("general.architecture")
            .cloned()
            .unwrap_or_default(),
        description: metadata
            .get("general.description")
            .or_else(|| metadata.get("general.name"))
            .cloned()
            .unwrap_or_default(),
        n_ctx_train: model.n_ctx_train(),
        n_embd: u32::try_from(model.n_embd()).unwrap_or(0),
        n_layer: u32::try_from(model.n_layer()).unwrap_or(0),
        n_head: u32::try_from(model.n_head()).unwrap_or(0),
        n_params: u64::try_from(model.n_params()).unwrap_or(0),
        size_bytes: u64::try_from(model.size()).unwrap_or(0),
        metadata,
    }
}

/// Loaded weights. `model` is declared first so it drops before the backend.
struct LlamaNativeModel {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    path: PathBuf,
    description: ModelDescription,
}

impl NativeModel for LlamaNativeModel {
    fn describe(&self) -> ModelDescription {
        self.description.clone()
    }

    fn tokenize(&self, text: &str, options: TokenizeOptions) -> Result<Vec<Token>, RuntimeError> {
        let add_bos = if options.add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        self.model
            .str_to_token(text, add_bos)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| RuntimeError::Tokenization(e.to_string()))
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Result<Vec<u8>, RuntimeError> {
        let special = if special {
            Special::Tokenize
        } else {
            Special::Plaintext
        };
        self.model
            .token_to_bytes(LlamaToken(token), special)
            .map_err(|_| RuntimeError::InvalidToken(token))
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn chat_template(&self) -> Option<String> {
        self.description
            .metadata
            .get("tokenizer.chat_template")
            .filter(|t| !t.is_empty())
            .cloned()
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String, RuntimeError> {
        let template = self
            .model
            .chat_template(None)
            .map_err(|e| RuntimeError::ChatTemplate(format!("Failed to load chat template: {e}")))?;
        let messages = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RuntimeError::ChatTemplate(format!("Failed to build chat message: {e}")))?;
        self.model
            .apply_chat_template(&template, &messages, add_assistant)
            .map_err(|e| RuntimeError::ChatTemplate(format!("Failed to apply chat template: {e}")))
    }

    fn new_context(
        &self,
        params: &ContextParams,
    ) -> Result<Box<dyn NativeContext + '_>, RuntimeError> {
        let n_ctx = NonZeroU32::new(params.n_ctx)
            .ok_or_else(|| RuntimeError::ContextCreate("n_ctx must be positive".to_string()))?;

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_ubatch(params.n_batch)
            .with_n_seq_max(params.n_seq_max)
            .with_embeddings(params.embeddings);
        if let Some(threads) = params.threads {
            let threads = i32::try_from(threads).unwrap_or(i32::MAX);
            ctx_params = ctx_params
                .with_n_threads(threads)
                .with_n_threads_batch(threads);
        }

        let ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| RuntimeError::ContextCreate(e.to_string()))?;
        tracing::debug!(model = %self.path.display(), n_ctx = params.n_ctx, "Context created");

        Ok(Box::new(LlamaNativeContext {
            ctx,
            params: params.clone(),
            samplers: Vec::new(),
            pos_min: HashMap::new(),
            abort: None,
        }))
    }
}

struct LlamaNativeContext<'m> {
    ctx: LlamaContext<'m>,
    params: ContextParams,
    samplers: Vec<LlamaSampler>,
    /// Lowest cached position per sequence
    pos_min: HashMap<SeqId, i32>,
    abort: Option<AbortCallback>,
}

fn open_bound(p: i32) -> Option<u32> {
    u32::try_from(p).ok()
}

impl NativeContext for LlamaNativeContext<'_> {
    fn n_ctx(&self) -> u32 {
        self.params.n_ctx
    }

    fn n_batch(&self) -> u32 {
        self.params.n_batch
    }

    fn n_seq_max(&self) -> u32 {
        self.params.n_seq_max
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError> {
        if let Some(abort) = &self.abort {
            if abort() {
                return Err(RuntimeError::Aborted);
            }
        }

        let n_seq = i32::try_from(self.params.n_seq_max).unwrap_or(1);
        let mut native = LlamaBatch::new(batch.capacity().max(1), n_seq);
        for entry in batch.entries() {
            native
                .add(LlamaToken(entry.token), entry.pos, &entry.seqs, entry.logits)
                .map_err(|_| RuntimeError::BatchFull(batch.capacity()))?;
        }

        match self.ctx.decode(&mut native) {
            Ok(()) => {}
            Err(DecodeError::NoKvCacheSlot) => return Err(RuntimeError::NoKvSlot(batch.len())),
            Err(DecodeError::Unknown(code)) if code == DECODE_ABORTED => {
                return Err(RuntimeError::Aborted)
            }
            Err(e) => return Err(RuntimeError::Decode(e.to_string())),
        }

        for entry in batch.entries() {
            for &seq in &entry.seqs {
                let min = self.pos_min.entry(seq).or_insert(entry.pos);
                *min = (*min).min(entry.pos);
            }
        }
        Ok(())
    }

    fn add_sampler(&mut self, params: &SamplerParams) -> Result<SamplerId, RuntimeError> {
        let mut chain = Vec::new();
        let has_penalties = params.repeat_penalty != 1.0
            || params.frequency_penalty != 0.0
            || params.presence_penalty != 0.0;
        if has_penalties {
            chain.push(LlamaSampler::penalties(
                params.penalty_last_n,
                params.repeat_penalty,
                params.frequency_penalty,
                params.presence_penalty,
            ));
        }

        if params.is_greedy() {
            chain.push(LlamaSampler::greedy());
        } else {
            if params.top_k > 0 {
                chain.push(LlamaSampler::top_k(params.top_k));
            }
            chain.push(LlamaSampler::top_p(params.top_p, 1));
            chain.push(LlamaSampler::min_p(params.min_p, 1));
            chain.push(LlamaSampler::temp(params.temperature));
            chain.push(LlamaSampler::dist(params.seed));
        }

        self.samplers.push(LlamaSampler::chain_simple(chain));
        Ok(SamplerId(self.samplers.len() - 1))
    }

    fn sample(&mut self, sampler: SamplerId, batch_index: i32) -> Result<Token, RuntimeError> {
        let chain = self
            .samplers
            .get_mut(sampler.0)
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("unknown sampler {}", sampler.0)))?;
        // llama_sampler_sample also accepts the token into the chain's history
        Ok(chain.sample(&self.ctx, batch_index).0)
    }

    fn embeddings_seq(&self, seq: SeqId) -> Result<Vec<f32>, RuntimeError> {
        if !self.params.embeddings {
            return Err(RuntimeError::Embeddings(
                "context was created without embeddings".to_string(),
            ));
        }
        self.ctx
            .embeddings_seq_ith(seq)
            .map(|e| e.to_vec())
            .map_err(|e| RuntimeError::Embeddings(e.to_string()))
    }

    fn memory_clear(&mut self, _data: bool) {
        self.ctx.clear_kv_cache();
        self.pos_min.clear();
    }

    fn memory_seq_rm(&mut self, seq: SeqId, p0: i32, p1: i32) -> Result<bool, RuntimeError> {
        let removed = self
            .ctx
            .clear_kv_cache_seq(u32::try_from(seq).ok(), open_bound(p0), open_bound(p1))
            .map_err(|e| RuntimeError::InvalidArgument(e.to_string()))?;
        if !removed {
            return Ok(false);
        }

        let seqs: Vec<SeqId> = if seq < 0 {
            self.pos_min.keys().copied().collect()
        } else {
            vec![seq]
        };
        for s in seqs {
            let max = self.ctx.kv_cache_seq_pos_max(s);
            match self.pos_min.get(&s).copied() {
                _ if max < 0 => {
                    self.pos_min.remove(&s);
                }
                Some(min) if min >= p0.max(0) && (p1 < 0 || min < p1) => {
                    self.pos_min.insert(s, p1.max(0));
                }
                _ => {}
            }
        }
        Ok(true)
    }

    fn memory_seq_cp(
        &mut self,
        src: SeqId,
        dst: SeqId,
        p0: i32,
        p1: i32,
    ) -> Result<(), RuntimeError> {
        self.ctx
            .copy_kv_cache_seq(src, dst, open_bound(p0), open_bound(p1))
            .map_err(|e| RuntimeError::InvalidArgument(e.to_string()))?;
        if let Some(src_min) = self.pos_min.get(&src).copied() {
            let copied_min = src_min.max(p0.max(0));
            let min = self.pos_min.entry(dst).or_insert(copied_min);
            *min = (*min).min(copied_min);
        }
        Ok(())
    }

    fn memory_seq_pos_min(&self, seq: SeqId) -> i32 {
        self.pos_min.get(&seq).copied().unwrap_or(-1)
    }

    fn memory_seq_pos_max(&self, seq: SeqId) -> i32 {
        self.ctx.kv_cache_seq_pos_max(seq)
    }

    fn set_abort_callback(&mut self, callback: Option<AbortCallback>) {
        self.abort = callback;
    }
}
