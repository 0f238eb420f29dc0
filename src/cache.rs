//! Model cache
//!
//! Loads each model file at most once and hands out the shared entry. The map
//! is guarded by its own lock; every cached model carries a separate exclusive
//! lock that callers must hold for the whole duration of any native call on
//! that model. The native handle is only reachable through [`ModelGuard`], so
//! forgetting the lock is a compile error rather than a data race.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::config::ServeSettings;
use crate::error::{NativeResultExt, Result};
use crate::runtime::{ModelDescription, ModelParams, NativeModel, NativeRuntime};
use crate::store::ModelStore;

/// Identity and static dimensions of a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Model {
    pub path: PathBuf,
    pub name: String,
    pub architecture: String,
    pub description: String,
    /// Training context length
    pub context_size: u32,
    pub embedding_size: u32,
    pub layers: u32,
    pub heads: u32,
    pub parameters: u64,
    pub size_bytes: u64,
    pub metadata: BTreeMap<String, String>,
}

impl Model {
    fn new(path: &Path, description: ModelDescription) -> Self {
        let name = description
            .metadata
            .get("general.name")
            .cloned()
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            path: path.to_path_buf(),
            name,
            architecture: description.architecture,
            description: description.description,
            context_size: description.n_ctx_train,
            embedding_size: description.n_embd,
            layers: description.n_layer,
            heads: description.n_head,
            parameters: description.n_params,
            size_bytes: description.size_bytes,
            metadata: description.metadata,
        }
    }
}

/// A loaded model together with its exclusive-access lock
pub struct CachedModel {
    model: Model,
    loaded_at: DateTime<Utc>,
    params: ModelParams,
    // Used as a mutex: only write guards are ever taken.
    exclusive: RwLock<()>,
    native: Box<dyn NativeModel>,
}

impl CachedModel {
    fn new(model: Model, params: ModelParams, native: Box<dyn NativeModel>) -> Self {
        Self {
            model,
            loaded_at: Utc::now(),
            params,
            exclusive: RwLock::new(()),
            native,
        }
    }

    /// Metadata read at load time. Needs no lock.
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn path(&self) -> &Path {
        &self.model.path
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Blocks until this thread has exclusive access to the native model.
    pub fn lock(&self) -> ModelGuard<'_> {
        ModelGuard {
            _exclusive: self.exclusive.write(),
            model: self,
        }
    }

    pub fn try_lock(&self) -> Option<ModelGuard<'_>> {
        self.exclusive.try_write().map(|guard| ModelGuard {
            _exclusive: guard,
            model: self,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.exclusive.is_locked()
    }

    fn path_str(&self) -> String {
        self.model.path.display().to_string()
    }
}

impl std::fmt::Debug for CachedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedModel")
            .field("model", &self.model.path)
            .field("loaded_at", &self.loaded_at)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Drop for CachedModel {
    fn drop(&mut self) {
        tracing::info!(model = %self.model.path.display(), "Closing model handle");
    }
}

/// Exclusive access to a cached model's native handle
pub struct ModelGuard<'a> {
    _exclusive: RwLockWriteGuard<'a, ()>,
    model: &'a CachedModel,
}

impl<'a> ModelGuard<'a> {
    pub fn native(&self) -> &dyn NativeModel {
        self.model.native.as_ref()
    }

    /// The handle with the model's lifetime, for binding contexts that
    /// outlive this guard. Contexts are only driven under a later lock.
    pub(crate) fn native_for_context(&self) -> &'a dyn NativeModel {
        self.model.native.as_ref()
    }

    pub fn cached(&self) -> &'a CachedModel {
        self.model
    }

    pub(crate) fn path_str(&self) -> String {
        self.model.path_str()
    }
}

/// Loaded/not-loaded view of a model, for listings and unload results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ModelView {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    /// Another request still held the model when it was unloaded
    pub in_use: bool,
    pub details: Option<Model>,
}

impl ModelView {
    pub fn loaded(entry: &CachedModel) -> Self {
        Self {
            name: entry.model.name.clone(),
            path: entry.model.path.clone(),
            size_bytes: entry.model.size_bytes,
            loaded: true,
            loaded_at: Some(entry.loaded_at),
            in_use: false,
            details: Some(entry.model.clone()),
        }
    }

    fn uncached(name: String, path: PathBuf, size_bytes: u64) -> Self {
        Self {
            name,
            path,
            size_bytes,
            loaded: false,
            loaded_at: None,
            in_use: false,
            details: None,
        }
    }
}

/// Context sizing and load defaults shared by every request
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDefaults {
    pub model_params: ModelParams,
    pub context_size: u32,
    pub max_context_size: u32,
    pub batch_size: u32,
    pub threads: Option<u32>,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self::from(&ServeSettings::default())
    }
}

impl From<&ServeSettings> for CacheDefaults {
    fn from(settings: &ServeSettings) -> Self {
        Self {
            model_params: settings.model_params(),
            context_size: settings.context_size,
            max_context_size: settings.max_context_size,
            batch_size: settings.batch_size,
            threads: settings.threads,
        }
    }
}

/// Keyed store of loaded models
pub struct ModelCache {
    runtime: Arc<dyn NativeRuntime>,
    store: ModelStore,
    defaults: CacheDefaults,
    entries: RwLock<HashMap<PathBuf, Arc<CachedModel>>>,
}

impl ModelCache {
    pub fn new(runtime: Arc<dyn NativeRuntime>, store: ModelStore, defaults: CacheDefaults) -> Self {
        tracing::info!(runtime = runtime.name(), root = %store.root().display(), "Model cache initialized");
        Self {
            runtime,
            store,
            defaults,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn defaults(&self) -> &CacheDefaults {
        &self.defaults
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the cached entry for `reference`, loading it first if needed.
    ///
    /// The store decides which file `reference` names; the cache is keyed by
    /// that resolved path only. Loads are serialized under the map lock. A
    /// second call for the same model returns the same entry and ignores
    /// `params`.
    pub fn load_or_get(&self, reference: &str, params: &ModelParams) -> Result<Arc<CachedModel>> {
        let path = self.store.resolve(reference)?;
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get(&path) {
            return Ok(entry.clone());
        }

        let path_str = path.display().to_string();
        tracing::info!(model = %path_str, gpu_layers = params.gpu_layers, "Loading model");

        let native = self
            .runtime
            .load_model(&path, params)
            .native("load_model", &path_str)?;
        let model = Model::new(&path, native.describe());

        tracing::info!(
            model = %path_str,
            architecture = %model.architecture,
            context_size = model.context_size,
            "Model loaded"
        );

        let entry = Arc::new(CachedModel::new(model, params.clone(), native));
        entries.insert(path, entry.clone());
        Ok(entry)
    }

    /// Cached entry for `reference` without loading.
    pub fn get(&self, reference: &str) -> Option<Arc<CachedModel>> {
        let resolved = self.store.resolve(reference).ok();
        let entries = self.entries.read();
        lookup_key(&entries, resolved, reference).and_then(|key| entries.get(&key).cloned())
    }

    /// Removes a model from the cache.
    ///
    /// Unloading a model that is not loaded succeeds with an uncached view.
    /// This never waits for the model lock, so it is safe to call while the
    /// current thread holds a guard on the same model. When another holder
    /// remains the view reports `in_use` and the native handle is released
    /// by the last holder.
    pub fn unload(&self, reference: &str) -> Result<ModelView> {
        let resolved = self.store.resolve(reference).ok();
        let removed = {
            let mut entries = self.entries.write();
            lookup_key(&entries, resolved, reference).and_then(|key| entries.remove(&key))
        };

        let Some(entry) = removed else {
            tracing::debug!(model = reference, "Unload requested for a model that is not loaded");
            return Ok(self.uncached_view(reference));
        };

        let mut view = ModelView::loaded(&entry);
        view.loaded = false;
        view.loaded_at = None;
        view.in_use = Arc::strong_count(&entry) > 1 || entry.is_locked();

        if view.in_use {
            tracing::warn!(
                model = %entry.path().display(),
                "Unloading a model that is still in use; release deferred to the last holder"
            );
        }
        drop(entry);

        tracing::info!(model = %view.path.display(), "Model unloaded");
        Ok(view)
    }

    /// Disk models merged with loaded entries.
    pub fn list(&self) -> Result<Vec<ModelView>> {
        let stored = self.store.scan()?;
        let entries = self.entries.read();

        let mut seen = Vec::new();
        let mut views: Vec<ModelView> = stored
            .into_iter()
            .map(|model| {
                let key = std::fs::canonicalize(&model.path).unwrap_or_else(|_| model.path.clone());
                match entries.get(&key) {
                    Some(entry) => {
                        seen.push(key);
                        ModelView::loaded(entry)
                    }
                    None => ModelView::uncached(model.name, model.path, model.size_bytes),
                }
            })
            .collect();

        let mut extra: Vec<ModelView> = entries
            .iter()
            .filter(|(key, _)| !seen.contains(key))
            .map(|(_, entry)| ModelView::loaded(entry))
            .collect();
        extra.sort_by(|a, b| a.name.cmp(&b.name));
        views.extend(extra);

        Ok(views)
    }

    /// Unloads everything. In-flight requests finish first.
    pub fn close(&self) {
        let drained: Vec<Arc<CachedModel>> = self.entries.write().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            drop(entry.lock());
        }
        tracing::info!("Model cache closed ({} model(s) released)", count);
    }

    fn uncached_view(&self, reference: &str) -> ModelView {
        match self.store.resolve(reference) {
            Ok(path) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| reference.to_string());
                ModelView::uncached(name, path, size)
            }
            Err(_) => ModelView::uncached(reference.to_string(), PathBuf::from(reference), 0),
        }
    }
}

impl Drop for ModelCache {
    fn drop(&mut self) {
        if !self.entries.get_mut().is_empty() {
            self.close();
        }
    }
}

/// Key for `reference`: the store's resolution when it has one, otherwise a
/// loose match for entries loaded from outside the store root.
fn lookup_key(
    entries: &HashMap<PathBuf, Arc<CachedModel>>,
    resolved: Option<PathBuf>,
    reference: &str,
) -> Option<PathBuf> {
    match resolved {
        Some(path) => entries.contains_key(&path).then_some(path),
        None => find_key(entries, reference),
    }
}

fn find_key(entries: &HashMap<PathBuf, Arc<CachedModel>>, reference: &str) -> Option<PathBuf> {
    if reference.is_empty() {
        return None;
    }
    let as_path = Path::new(reference);
    if entries.contains_key(as_path) {
        return Some(as_path.to_path_buf());
    }
    entries
        .iter()
        .find(|(key, entry)| {
            entry.model.name == reference
                || key.file_stem().is_some_and(|s| s == reference)
                || key.file_name().is_some_and(|s| s == reference)
                || key.ends_with(as_path)
        })
        .map(|(key, _)| key.clone())
}
