//! Simulated runtime
//!
//! A deterministic, in-process stand-in for llama.cpp. It has a byte-level
//! vocabulary, a unified KV cache with real per-sequence position bookkeeping,
//! and scripted replies. Every native call passes through a per-model gate that
//! counts overlapping calls, so tests can prove that the model lock (and not
//! the backend) is what keeps concurrent requests apart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::chat::{chatml_prompt, ChatMessage};
use crate::runtime::{
    AbortCallback, ContextParams, ModelDescription, ModelParams, NativeContext, NativeModel,
    NativeRuntime, RuntimeError, SamplerId, SamplerParams, SeqId, Token, TokenBatch,
    TokenizeOptions,
};

pub const BOS: Token = 1;
pub const EOS: Token = 2;
const BYTE_OFFSET: Token = 3;
const N_EMBD: usize = 8;
const MAX_CTX: u32 = 1 << 16;

/// Maps the prompt text seen by a sampler to the reply it will produce.
pub type SimScript = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Simulated backend
pub struct SimRuntime {
    script: SimScript,
    partial_eviction: bool,
    chat_template: bool,
    n_ctx_train: u32,
    call_delay: Option<Duration>,
    failing_loads: Option<String>,
    loads: AtomicUsize,
    overlaps: Arc<AtomicUsize>,
    live_contexts: Arc<AtomicUsize>,
}

impl SimRuntime {
    pub fn new() -> Self {
        Self {
            script: Arc::new(|_| "Hello from the simulated runtime.".to_string()),
            partial_eviction: true,
            chat_template: true,
            n_ctx_train: 2048,
            call_delay: None,
            failing_loads: None,
            loads: AtomicUsize::new(0),
            overlaps: Arc::new(AtomicUsize::new(0)),
            live_contexts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_script<F>(mut self, script: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.script = Arc::new(script);
        self
    }

    /// Replies with `reply` regardless of the prompt.
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        let reply = reply.into();
        self.with_script(move |_| reply.clone())
    }

    /// `false` models a recurrent memory that can only be cleared whole.
    pub fn with_partial_eviction(mut self, supported: bool) -> Self {
        self.partial_eviction = supported;
        self
    }

    pub fn with_chat_template(mut self, enabled: bool) -> Self {
        self.chat_template = enabled;
        self
    }

    pub fn with_n_ctx_train(mut self, n_ctx_train: u32) -> Self {
        self.n_ctx_train = n_ctx_train;
        self
    }

    /// Sleeps inside every native call, widening any race window.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    /// Loads of paths containing `needle` fail.
    pub fn with_failing_loads(mut self, needle: impl Into<String>) -> Self {
        self.failing_loads = Some(needle.into());
        self
    }

    /// Number of successful and failed `load_model` calls.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of native calls that started while another call on the same
    /// model was still running.
    pub fn overlap_count(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRuntime for SimRuntime {
    fn name(&self) -> &str {
        "sim"
    }

    fn load_model(
        &self,
        path: &Path,
        _params: &ModelParams,
    ) -> Result<Box<dyn NativeModel>, RuntimeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        let path_str = path.to_string_lossy().to_string();
        if let Some(needle) = &self.failing_loads {
            if path_str.contains(needle.as_str()) {
                return Err(RuntimeError::ModelLoad(format!(
                    "simulated load failure for {path_str}"
                )));
            }
        }

        let size_bytes = std::fs::metadata(path)
            .map_err(|e| RuntimeError::ModelLoad(e.to_string()))?
            .len();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let mut metadata = BTreeMap::new();
        metadata.insert("general.architecture".to_string(), "sim".to_string());
        metadata.insert("general.name".to_string(), name.clone());

        Ok(Box::new(SimModel {
            path: path.to_path_buf(),
            description: ModelDescription {
                architecture: "sim".to_string(),
                description: format!("simulated byte-level model ({name})"),
                n_ctx_train: self.n_ctx_train,
                n_embd: N_EMBD as u32,
                n_layer: 1,
                n_head: 1,
                n_params: 0,
                size_bytes,
                metadata,
            },
            script: self.script.clone(),
            partial_eviction: self.partial_eviction,
            chat_template: self.chat_template,
            gate: Arc::new(CallGate {
                active: AtomicUsize::new(0),
                overlaps: self.overlaps.clone(),
                delay: self.call_delay,
            }),
            live_contexts: self.live_contexts.clone(),
        }))
    }
}

struct CallGate {
    active: AtomicUsize,
    overlaps: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl CallGate {
    fn enter(&self) -> GateToken<'_> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        GateToken(self)
    }
}

struct GateToken<'g>(&'g CallGate);

impl Drop for GateToken<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SimModel {
    path: PathBuf,
    description: ModelDescription,
    script: SimScript,
    partial_eviction: bool,
    chat_template: bool,
    gate: Arc<CallGate>,
    live_contexts: Arc<AtomicUsize>,
}

fn byte_token(byte: u8) -> Token {
    byte as Token + BYTE_OFFSET
}

fn token_byte(token: Token) -> Option<u8> {
    u8::try_from(token - BYTE_OFFSET).ok()
}

impl NativeModel for SimModel {
    fn describe(&self) -> ModelDescription {
        self.description.clone()
    }

    fn tokenize(&self, text: &str, options: TokenizeOptions) -> Result<Vec<Token>, RuntimeError> {
        let _call = self.gate.enter();
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if options.add_special {
            tokens.push(BOS);
        }

        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let rest = &bytes[i..];
            if options.parse_special && rest.starts_with(b"</s>") {
                tokens.push(EOS);
                i += 4;
            } else if options.parse_special && rest.starts_with(b"<s>") {
                tokens.push(BOS);
                i += 3;
            } else {
                tokens.push(byte_token(bytes[i]));
                i += 1;
            }
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: Token, special: bool) -> Result<Vec<u8>, RuntimeError> {
        let _call = self.gate.enter();
        match token {
            BOS if special => Ok(b"<s>".to_vec()),
            EOS if special => Ok(b"</s>".to_vec()),
            BOS | EOS => Ok(Vec::new()),
            other => token_byte(other)
                .map(|b| vec![b])
                .ok_or(RuntimeError::InvalidToken(other)),
        }
    }

    fn is_eog(&self, token: Token) -> bool {
        let _call = self.gate.enter();
        token == EOS
    }

    fn chat_template(&self) -> Option<String> {
        self.chat_template.then(|| "chatml".to_string())
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
    ) -> Result<String, RuntimeError> {
        let _call = self.gate.enter();
        if !self.chat_template {
            return Err(RuntimeError::ChatTemplate(
                "model has no chat template".to_string(),
            ));
        }
        Ok(chatml_prompt(messages, add_assistant))
    }

    fn new_context(
        &self,
        params: &ContextParams,
    ) -> Result<Box<dyn NativeContext + '_>, RuntimeError> {
        let _call = self.gate.enter();
        if params.n_ctx == 0 || params.n_ctx > MAX_CTX {
            return Err(RuntimeError::ContextCreate(format!(
                "n_ctx {} outside 1..={MAX_CTX}",
                params.n_ctx
            )));
        }
        if params.n_batch == 0 || params.n_seq_max == 0 {
            return Err(RuntimeError::ContextCreate(
                "n_batch and n_seq_max must be positive".to_string(),
            ));
        }
        self.live_contexts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(model = %self.path.display(), n_ctx = params.n_ctx, "Simulated context created");
        Ok(Box::new(SimContext {
            model: self,
            params: params.clone(),
            cells: Vec::new(),
            outputs: Vec::new(),
            samplers: Vec::new(),
            abort: None,
        }))
    }
}

struct SimCell {
    pos: i32,
    token: Token,
    seqs: BTreeSet<SeqId>,
}

struct SimSampler {
    reply: Option<Vec<u8>>,
    cursor: usize,
}

struct SimContext<'m> {
    model: &'m SimModel,
    params: ContextParams,
    cells: Vec<SimCell>,
    /// Per entry of the last decoded batch: the sequence whose logits exist
    outputs: Vec<Option<SeqId>>,
    samplers: Vec<SimSampler>,
    abort: Option<AbortCallback>,
}

impl SimContext<'_> {
    fn seq_positions(&self, seq: SeqId) -> impl Iterator<Item = &SimCell> {
        self.cells.iter().filter(move |c| c.seqs.contains(&seq))
    }

    fn seq_text(&self, seq: SeqId) -> String {
        let mut cells: Vec<&SimCell> = self.seq_positions(seq).collect();
        cells.sort_by_key(|c| c.pos);
        let bytes: Vec<u8> = cells.iter().filter_map(|c| token_byte(c.token)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn check_seq(&self, seq: SeqId) -> Result<(), RuntimeError> {
        if seq < 0 || seq as u32 >= self.params.n_seq_max {
            return Err(RuntimeError::InvalidArgument(format!(
                "sequence id {seq} outside 0..{}",
                self.params.n_seq_max
            )));
        }
        Ok(())
    }
}

fn range_bounds(p0: i32, p1: i32) -> (i32, i32) {
    let start = if p0 < 0 { 0 } else { p0 };
    let end = if p1 < 0 { i32::MAX } else { p1 };
    (start, end)
}

impl NativeContext for SimContext<'_> {
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
        let _call = self.model.gate.enter();

        if let Some(abort) = &self.abort {
            if abort() {
                return Err(RuntimeError::Aborted);
            }
        }
        if batch.is_empty() {
            return Err(RuntimeError::Decode("empty batch".to_string()));
        }
        if batch.len() > self.params.n_batch as usize {
            return Err(RuntimeError::Decode(format!(
                "batch of {} exceeds n_batch {}",
                batch.len(),
                self.params.n_batch
            )));
        }

        let mut next_pos: HashMap<SeqId, i32> = HashMap::new();
        for entry in batch.entries() {
            if entry.seqs.is_empty() {
                return Err(RuntimeError::Decode("entry without sequence".to_string()));
            }
            if token_byte(entry.token).is_none() && entry.token != BOS && entry.token != EOS {
                return Err(RuntimeError::InvalidToken(entry.token));
            }
            for &seq in &entry.seqs {
                self.check_seq(seq)?;
                let expected = *next_pos
                    .entry(seq)
                    .or_insert_with(|| self.memory_seq_pos_max(seq) + 1);
                if entry.pos != expected {
                    return Err(RuntimeError::Decode(format!(
                        "sequence {seq} expected position {expected}, got {}",
                        entry.pos
                    )));
                }
                next_pos.insert(seq, expected + 1);
            }
        }

        if self.cells.len() + batch.len() > self.params.n_ctx as usize {
            return Err(RuntimeError::NoKvSlot(batch.len()));
        }

        self.outputs.clear();
        for entry in batch.entries() {
            self.cells.push(SimCell {
                pos: entry.pos,
                token: entry.token,
                seqs: entry.seqs.iter().copied().collect(),
            });
            self.outputs.push(entry.logits.then(|| entry.seqs[0]));
        }
        Ok(())
    }

    fn add_sampler(&mut self, _params: &SamplerParams) -> Result<SamplerId, RuntimeError> {
        self.samplers.push(SimSampler {
            reply: None,
            cursor: 0,
        });
        Ok(SamplerId(self.samplers.len() - 1))
    }

    fn sample(&mut self, sampler: SamplerId, batch_index: i32) -> Result<Token, RuntimeError> {
        let _call = self.model.gate.enter();

        let index = if batch_index < 0 {
            self.outputs.len() as i32 + batch_index
        } else {
            batch_index
        };
        let seq = usize::try_from(index)
            .ok()
            .and_then(|i| self.outputs.get(i).copied().flatten())
            .ok_or_else(|| {
                RuntimeError::Sampling(format!("no logits for batch index {batch_index}"))
            })?;

        if sampler.0 >= self.samplers.len() {
            return Err(RuntimeError::InvalidArgument(format!(
                "unknown sampler {}",
                sampler.0
            )));
        }
        if self.samplers[sampler.0].reply.is_none() {
            let prompt = self.seq_text(seq);
            self.samplers[sampler.0].reply = Some((self.model.script)(&prompt).into_bytes());
        }

        let state = &mut self.samplers[sampler.0];
        let reply = state.reply.as_deref().unwrap_or_default();
        let token = reply.get(state.cursor).map(|&b| byte_token(b)).unwrap_or(EOS);
        state.cursor += 1;
        Ok(token)
    }

    fn embeddings_seq(&self, seq: SeqId) -> Result<Vec<f32>, RuntimeError> {
        let _call = self.model.gate.enter();
        if !self.params.embeddings {
            return Err(RuntimeError::Embeddings(
                "context was created without embeddings".to_string(),
            ));
        }
        let mut vector = vec![0.0f32; N_EMBD];
        let mut seen = false;
        for cell in self.seq_positions(seq) {
            vector[cell.token as usize % N_EMBD] += 1.0;
            seen = true;
        }
        if !seen {
            return Err(RuntimeError::Embeddings(format!("sequence {seq} is empty")));
        }
        Ok(vector)
    }

    fn memory_clear(&mut self, _data: bool) {
        let _call = self.model.gate.enter();
        self.cells.clear();
        self.outputs.clear();
    }

    fn memory_seq_rm(&mut self, seq: SeqId, p0: i32, p1: i32) -> Result<bool, RuntimeError> {
        let _call = self.model.gate.enter();
        let partial = p0 > 0 || p1 >= 0;
        if partial && !self.model.partial_eviction {
            return Ok(false);
        }

        let (start, end) = range_bounds(p0, p1);
        for cell in self.cells.iter_mut() {
            if cell.pos < start || cell.pos >= end {
                continue;
            }
            if seq < 0 {
                cell.seqs.clear();
            } else {
                cell.seqs.remove(&seq);
            }
        }
        self.cells.retain(|c| !c.seqs.is_empty());
        Ok(true)
    }

    fn memory_seq_cp(
        &mut self,
        src: SeqId,
        dst: SeqId,
        p0: i32,
        p1: i32,
    ) -> Result<(), RuntimeError> {
        let _call = self.model.gate.enter();
        self.check_seq(src)?;
        self.check_seq(dst)?;
        let (start, end) = range_bounds(p0, p1);
        for cell in self.cells.iter_mut() {
            if cell.seqs.contains(&src) && cell.pos >= start && cell.pos < end {
                cell.seqs.insert(dst);
            }
        }
        Ok(())
    }

    fn memory_seq_pos_min(&self, seq: SeqId) -> i32 {
        self.seq_positions(seq).map(|c| c.pos).min().unwrap_or(-1)
    }

    fn memory_seq_pos_max(&self, seq: SeqId) -> i32 {
        self.seq_positions(seq).map(|c| c.pos).max().unwrap_or(-1)
    }

    fn set_abort_callback(&mut self, callback: Option<AbortCallback>) {
        self.abort = callback;
    }
}

impl Drop for SimContext<'_> {
    fn drop(&mut self) {
        let _call = self.model.gate.enter();
        self.model.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn model_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(b"sim").unwrap();
        file
    }

    #[test]
    fn test_tokenize_round_trip() {
        let runtime = SimRuntime::new();
        let file = model_file();
        let model = runtime.load_model(file.path(), &ModelParams::default()).unwrap();

        let text = "The quick brown fox.";
        let tokens = model.tokenize(text, TokenizeOptions::default()).unwrap();
        assert_eq!(tokens.len(), text.len());
        assert_eq!(model.detokenize(&tokens, false).unwrap(), text);
    }

    #[test]
    fn test_tokenize_special() {
        let runtime = SimRuntime::new();
        let file = model_file();
        let model = runtime.load_model(file.path(), &ModelParams::default()).unwrap();

        let options = TokenizeOptions {
            add_special: true,
            parse_special: true,
        };
        let tokens = model.tokenize("a</s>", options).unwrap();
        assert_eq!(tokens, vec![BOS, byte_token(b'a'), EOS]);
        assert_eq!(model.detokenize(&tokens, true).unwrap(), "<s>a</s>");
        assert_eq!(model.detokenize(&tokens, false).unwrap(), "a");
    }

    #[test]
    fn test_decode_rejects_position_gap() {
        let runtime = SimRuntime::new();
        let file = model_file();
        let model = runtime.load_model(file.path(), &ModelParams::default()).unwrap();
        let mut ctx = model.new_context(&ContextParams::default()).unwrap();

        let mut batch = TokenBatch::new(4);
        batch.add(byte_token(b'a'), 1, &[0], true).unwrap();
        assert!(matches!(ctx.decode(&batch), Err(RuntimeError::Decode(_))));
    }

    #[test]
    fn test_decode_no_kv_slot_leaves_memory() {
        let runtime = SimRuntime::new();
        let file = model_file();
        let model = runtime.load_model(file.path(), &ModelParams::default()).unwrap();
        let params = ContextParams {
            n_ctx: 2,
            ..ContextParams::default()
        };
        let mut ctx = model.new_context(&params).unwrap();

        let mut batch = TokenBatch::new(4);
        for pos in 0..3 {
            batch.add(byte_token(b'x'), pos, &[0], false).unwrap();
        }
        assert_eq!(ctx.decode(&batch), Err(RuntimeError::NoKvSlot(3)));
        assert_eq!(ctx.memory_seq_pos_max(0), -1);
    }

    #[test]
    fn test_live_context_count() {
        let runtime = SimRuntime::new();
        let file = model_file();
        let model = runtime.load_model(file.path(), &ModelParams::default()).unwrap();
        {
            let _ctx = model.new_context(&ContextParams::default()).unwrap();
            assert_eq!(runtime.live_contexts(), 1);
        }
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[test]
    fn test_failing_load() {
        let runtime = SimRuntime::new().with_failing_loads("broken");
        let result = runtime.load_model(Path::new("/models/broken.gguf"), &ModelParams::default());
        assert!(matches!(result, Err(RuntimeError::ModelLoad(_))));
        assert_eq!(runtime.load_count(), 1);
    }
}
