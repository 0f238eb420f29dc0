//! Task scoping
//!
//! A [`Task`] pairs a cached model with, optionally, a fresh inference context
//! for the duration of one callback. The task does not lock anything by
//! itself: the callback calls [`Task::lock`] around its native work. Because
//! native handles are only reachable through the returned [`TaskGuard`], no
//! native call can happen without the model's exclusive lock.
//!
//! Contexts are never reused across operations. `with_context` creates one,
//! runs the callback, and releases it on every exit path, including panics.

use serde::{Deserialize, Serialize};

use crate::cache::{CacheDefaults, CachedModel, Model, ModelCache, ModelGuard};
use crate::error::{NativeResultExt, Result, ServeError};
use crate::inference::Generator;
use crate::prefix::PrefixCache;
use crate::runtime::{ContextParams, ModelParams, NativeContext, NativeModel, Token, TokenizeOptions};

/// Per-request context sizing overrides; `None` falls back to defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(default)]
pub struct ContextOverrides {
    pub n_ctx: Option<u32>,
    pub n_batch: Option<u32>,
    pub threads: Option<u32>,
}

/// Which model an operation needs and how its context should look
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub model_params: Option<ModelParams>,
    pub context: ContextOverrides,
    pub sequences: u32,
    pub embeddings: bool,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            model_params: None,
            context: ContextOverrides::default(),
            sequences: 1,
            embeddings: false,
        }
    }

    pub fn with_context(mut self, context: ContextOverrides) -> Self {
        self.context = context;
        self
    }

    pub fn with_model_params(mut self, params: ModelParams) -> Self {
        self.model_params = Some(params);
        self
    }

    pub fn with_sequences(mut self, sequences: u32) -> Self {
        self.sequences = sequences.max(1);
        self
    }

    pub fn with_embeddings(mut self, embeddings: bool) -> Self {
        self.embeddings = embeddings;
        self
    }

    /// Layers request overrides over the model's training context over the
    /// configured defaults.
    pub fn context_params(&self, defaults: &CacheDefaults, model: &Model) -> ContextParams {
        let trained = (model.context_size > 0).then(|| model.context_size.min(defaults.max_context_size));
        let n_ctx = self
            .context
            .n_ctx
            .or(trained)
            .unwrap_or(defaults.context_size);

        // Non-causal embedding models need the whole input in one batch.
        let default_batch = if self.embeddings { n_ctx } else { defaults.batch_size };
        let n_batch = self.context.n_batch.unwrap_or(default_batch).min(n_ctx).max(1);

        ContextParams {
            n_ctx,
            n_batch,
            n_seq_max: self.sequences.max(1),
            threads: self.context.threads.or(defaults.threads),
            embeddings: self.embeddings,
        }
    }
}

/// One operation's view of a cached model and its optional context
pub struct Task<'a> {
    model: &'a CachedModel,
    context: Option<Box<dyn NativeContext + 'a>>,
}

impl<'a> Task<'a> {
    pub fn model(&self) -> &'a CachedModel {
        self.model
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Takes the model's exclusive lock. Hold the guard for every native call.
    pub fn lock(&mut self) -> TaskGuard<'_, 'a> {
        TaskGuard {
            model: self.model.lock(),
            context: self.context.as_mut(),
        }
    }

    fn close(&mut self) {
        if let Some(context) = self.context.take() {
            let _exclusive = self.model.lock();
            drop(context);
            tracing::debug!(model = %self.model.path().display(), "Context released");
        }
    }
}

impl Drop for Task<'_> {
    fn drop(&mut self) {
        if self.context.is_some() {
            tracing::warn!(
                model = %self.model.path().display(),
                panicking = std::thread::panicking(),
                "Task dropped with a live context; releasing it"
            );
            self.close();
        }
    }
}

/// Locked access to a task's native model and context
pub struct TaskGuard<'t, 'a> {
    model: ModelGuard<'a>,
    context: Option<&'t mut Box<dyn NativeContext + 'a>>,
}

impl<'t, 'a> TaskGuard<'t, 'a> {
    pub fn native(&self) -> &dyn NativeModel {
        self.model.native()
    }

    pub fn model_path(&self) -> String {
        self.model.path_str()
    }

    pub fn context(&mut self) -> Result<&mut (dyn NativeContext + 'a)> {
        match self.context.as_mut() {
            Some(context) => Ok(&mut ***context),
            None => Err(ServeError::InvalidContext(
                "task was created without a context".to_string(),
            )),
        }
    }

    /// Model and context together, for loops that need both.
    pub fn parts(&mut self) -> Result<(&dyn NativeModel, &mut (dyn NativeContext + 'a))> {
        let native = self.model.native();
        match self.context.as_mut() {
            Some(context) => Ok((native, &mut ***context)),
            None => Err(ServeError::InvalidContext(
                "task was created without a context".to_string(),
            )),
        }
    }

    pub fn prefix_cache(&mut self) -> Result<PrefixCache<'_, dyn NativeContext + 'a>> {
        Ok(PrefixCache::new(self.context()?))
    }

    pub fn generator(&mut self) -> Result<Generator<'_, dyn NativeContext + 'a>> {
        let label = self.model_path();
        let (native, context) = self.parts()?;
        Ok(Generator::new(native, context, label))
    }

    pub fn tokenize(&self, text: &str, options: TokenizeOptions) -> Result<Vec<Token>> {
        self.native()
            .tokenize(text, options)
            .native("tokenize", &self.model_path())
    }

    pub fn detokenize(&self, tokens: &[Token], special: bool) -> Result<String> {
        self.native()
            .detokenize(tokens, special)
            .native("detokenize", &self.model_path())
    }
}

impl ModelCache {
    /// Runs `f` with the model loaded and no context.
    ///
    /// Errors returned by `f` come back unchanged; load failures are
    /// converted into `E` without calling `f`.
    pub fn with_model<T, E, F>(&self, request: &ModelRequest, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Task<'_>) -> std::result::Result<T, E>,
        E: From<ServeError>,
    {
        let model = self.load_or_get(&request.model, self.model_params_for(request))?;
        let mut task = Task {
            model: &model,
            context: None,
        };
        f(&mut task)
    }

    /// Runs `f` with the model loaded and a fresh context, which is released
    /// once `f` returns or unwinds. Context allocation failures are returned
    /// without calling `f`.
    pub fn with_context<T, E, F>(&self, request: &ModelRequest, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Task<'_>) -> std::result::Result<T, E>,
        E: From<ServeError>,
    {
        let model = self.load_or_get(&request.model, self.model_params_for(request))?;
        let params = request.context_params(self.defaults(), model.model());

        let context = {
            let guard = model.lock();
            guard
                .native_for_context()
                .new_context(&params)
                .native("new_context", &guard.path_str())?
        };
        tracing::debug!(
            model = %model.path().display(),
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_seq_max = params.n_seq_max,
            "Context created"
        );

        let mut task = Task {
            model: &model,
            context: Some(context),
        };
        let result = f(&mut task);
        task.close();
        result
    }

    fn model_params_for<'r>(&'r self, request: &'r ModelRequest) -> &'r ModelParams {
        request
            .model_params
            .as_ref()
            .unwrap_or(&self.defaults().model_params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{SamplerParams, SimRuntime, TokenBatch};
    use crate::store::gguf::empty_header;
    use crate::store::ModelStore;
    use std::collections::BTreeMap;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fixture(runtime: SimRuntime) -> (TempDir, Arc<SimRuntime>, Arc<ModelCache>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), empty_header()).unwrap();
        std::fs::write(dir.path().join("other.gguf"), empty_header()).unwrap();
        let runtime = Arc::new(runtime);
        let cache = ModelCache::new(
            runtime.clone(),
            ModelStore::new(dir.path()),
            CacheDefaults::default(),
        );
        (dir, runtime, Arc::new(cache))
    }

    fn model_with_ctx(context_size: u32) -> Model {
        Model {
            path: "m.gguf".into(),
            name: "m".to_string(),
            architecture: "sim".to_string(),
            description: String::new(),
            context_size,
            embedding_size: 8,
            layers: 1,
            heads: 1,
            parameters: 0,
            size_bytes: 0,
            metadata: BTreeMap::new(),
        }
    }

    #[derive(Debug)]
    enum TestError {
        Infra(ServeError),
        Mine(&'static str),
    }

    impl From<ServeError> for TestError {
        fn from(e: ServeError) -> Self {
            TestError::Infra(e)
        }
    }

    #[test]
    fn test_context_params_layering() {
        let defaults = CacheDefaults {
            context_size: 1024,
            max_context_size: 8192,
            batch_size: 256,
            ..CacheDefaults::default()
        };

        let request = ModelRequest::new("m");
        assert_eq!(request.context_params(&defaults, &model_with_ctx(4096)).n_ctx, 4096);
        assert_eq!(request.context_params(&defaults, &model_with_ctx(131072)).n_ctx, 8192);
        assert_eq!(request.context_params(&defaults, &model_with_ctx(0)).n_ctx, 1024);

        let overridden = ModelRequest::new("m").with_context(ContextOverrides {
            n_ctx: Some(512),
            n_batch: Some(4096),
            threads: Some(2),
        });
        let params = overridden.context_params(&defaults, &model_with_ctx(4096));
        assert_eq!(params.n_ctx, 512);
        assert_eq!(params.n_batch, 512);
        assert_eq!(params.threads, Some(2));

        let embed = ModelRequest::new("m").with_embeddings(true).with_sequences(0);
        let params = embed.context_params(&defaults, &model_with_ctx(2048));
        assert_eq!(params.n_batch, 2048);
        assert_eq!(params.n_seq_max, 1);
        assert!(params.embeddings);
    }

    #[test]
    fn test_with_model_has_no_context() {
        let (_dir, runtime, cache) = fixture(SimRuntime::new());

        let tokens = cache
            .with_model(&ModelRequest::new("tiny"), |task| {
                assert!(!task.has_context());
                let mut guard = task.lock();
                assert!(matches!(guard.context(), Err(ServeError::InvalidContext(_))));
                guard.tokenize("hi", TokenizeOptions::default())
            })
            .unwrap();

        assert_eq!(tokens.len(), 2);
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[test]
    fn test_with_context_releases_on_success_and_error() {
        let (_dir, runtime, cache) = fixture(SimRuntime::new());
        let request = ModelRequest::new("tiny");

        let n_ctx = cache
            .with_context(&request, |task| -> Result<u32> {
                assert_eq!(runtime.live_contexts(), 1);
                Ok(task.lock().context()?.n_ctx())
            })
            .unwrap();
        assert_eq!(n_ctx, 2048);
        assert_eq!(runtime.live_contexts(), 0);

        let err = cache
            .with_context(&request, |_task| -> std::result::Result<(), TestError> {
                Err(TestError::Mine("boom"))
            })
            .unwrap_err();
        assert!(matches!(err, TestError::Mine("boom")));
        assert_eq!(runtime.live_contexts(), 0);
        assert!(!cache.get("tiny").unwrap().is_locked());
    }

    #[test]
    fn test_context_creation_failure_skips_callback() {
        let (_dir, runtime, cache) = fixture(SimRuntime::new());
        let request = ModelRequest::new("tiny").with_context(ContextOverrides {
            n_ctx: Some(1 << 20),
            ..ContextOverrides::default()
        });

        let mut called = false;
        let err = cache
            .with_context(&request, |_task| -> std::result::Result<(), TestError> {
                called = true;
                Ok(())
            })
            .unwrap_err();

        assert!(!called);
        assert!(matches!(
            err,
            TestError::Infra(ServeError::Native { op: "new_context", .. })
        ));
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[test]
    fn test_missing_model_skips_callback() {
        let (_dir, _runtime, cache) = fixture(SimRuntime::new());
        let mut called = false;
        let err = cache
            .with_model(&ModelRequest::new("ghost"), |_task| -> Result<()> {
                called = true;
                Ok(())
            })
            .unwrap_err();
        assert!(!called);
        assert!(matches!(err, ServeError::NotFound(_)));
    }

    #[test]
    fn test_context_released_on_panic() {
        let (_dir, runtime, cache) = fixture(SimRuntime::new());
        let request = ModelRequest::new("tiny");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            cache.with_context(&request, |task| -> Result<()> {
                let _guard = task.lock();
                panic!("callback exploded");
            })
        }));

        assert!(outcome.is_err());
        assert_eq!(runtime.live_contexts(), 0);
        assert!(!cache.get("tiny").unwrap().is_locked());
    }

    #[test]
    fn test_guard_holds_model_lock() {
        let (_dir, _runtime, cache) = fixture(SimRuntime::new());
        cache
            .with_context(&ModelRequest::new("tiny"), |task| -> Result<()> {
                let model = task.model();
                {
                    let _guard = task.lock();
                    assert!(model.is_locked());
                    assert!(model.try_lock().is_none());
                }
                assert!(!model.is_locked());
                Ok(())
            })
            .unwrap();
    }

    fn decode_and_sample(cache: &ModelCache, model: &str, text: &str) -> Result<Vec<Token>> {
        cache.with_context(&ModelRequest::new(model), |task| {
            let mut guard = task.lock();
            let tokens = guard.tokenize(text, TokenizeOptions::default())?;
            let (_, ctx) = guard.parts()?;
            let mut batch = TokenBatch::new(64);
            for (i, &token) in tokens.iter().enumerate() {
                batch
                    .add(token, i as i32, &[0], i == tokens.len() - 1)
                    .native("batch", model)?;
            }
            ctx.decode(&batch).native("decode", model)?;
            let sampler = ctx.add_sampler(&SamplerParams::default()).native("sampler", model)?;
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(ctx.sample(sampler, -1).native("sample", model)?);
            }
            Ok(out)
        })
    }

    #[test]
    fn test_concurrent_tasks_on_same_model_never_overlap() {
        let (_dir, runtime, cache) = fixture(
            SimRuntime::new()
                .with_reply("abc")
                .with_call_delay(Duration::from_millis(1)),
        );

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || decode_and_sample(&cache, "tiny", &format!("prompt {i}")))
            })
            .collect();

        for handle in handles {
            let sampled = handle.join().unwrap().unwrap();
            assert_eq!(sampled.len(), 3);
        }
        assert_eq!(runtime.overlap_count(), 0);
        assert_eq!(runtime.live_contexts(), 0);
    }

    #[test]
    fn test_distinct_models_run_independently() {
        let (_dir, runtime, cache) = fixture(SimRuntime::new().with_reply("xyz"));

        let handles: Vec<_> = ["tiny", "other", "tiny", "other"]
            .into_iter()
            .map(|name| {
                let cache = cache.clone();
                thread::spawn(move || decode_and_sample(&cache, name, "hello"))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(runtime.overlap_count(), 0);
        assert_eq!(cache.len(), 2);
    }
}
