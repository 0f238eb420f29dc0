//! Model store
//!
//! Discovers GGUF files under a models directory and resolves model
//! references (absolute path, path relative to the directory, or bare name)
//! to the file that should be loaded.

pub mod gguf;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServeError};

pub use gguf::{read_header, GgufError, GgufHeader, GGUF_MAGIC};

/// A model file found on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModel {
    /// File stem, used as the model's short name
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

impl StoredModel {
    fn from_path(path: PathBuf) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(&path)?;
        let name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            name,
            path,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?.into(),
        })
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        const UNITS: [&str; 3] = ["KB", "MB", "GB"];
        let mut size = self.size_bytes as f64;
        if size < 1024.0 {
            return format!("{} B", self.size_bytes);
        }
        let mut unit = "B";
        for next in UNITS {
            if size < 1024.0 {
                break;
            }
            size /= 1024.0;
            unit = next;
        }
        format!("{size:.2} {unit}")
    }
}

/// Directory-backed model store
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists every `.gguf` file below the root, sorted by name.
    pub fn scan(&self) -> Result<Vec<StoredModel>> {
        if !self.root.is_dir() {
            tracing::warn!("Models directory does not exist: {}", self.root.display());
            return Ok(vec![]);
        }

        let pattern = format!(
            "{}/**/*.gguf",
            glob::Pattern::escape(&self.root.to_string_lossy())
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| ServeError::InvalidArgument(format!("bad models directory: {e}")))?;

        let mut models = vec![];
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            match StoredModel::from_path(path.clone()) {
                Ok(model) => {
                    tracing::debug!("Found model: {}", model.name);
                    models.push(model);
                }
                Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
            }
        }

        models.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
        tracing::debug!("Found {} model(s) in {}", models.len(), self.root.display());
        Ok(models)
    }

    /// Resolves a reference to a canonical, header-checked model path.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf> {
        if reference.trim().is_empty() {
            return Err(ServeError::InvalidArgument("empty model reference".to_string()));
        }

        let candidate = Path::new(reference);
        let direct = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        if direct.is_file() {
            return validate(&direct);
        }

        let by_name = self
            .scan()?
            .into_iter()
            .find(|m| m.name == reference || m.path.file_name().is_some_and(|f| f == reference));

        match by_name {
            Some(model) => validate(&model.path),
            None => Err(ServeError::NotFound(reference.to_string())),
        }
    }
}

fn validate(path: &Path) -> Result<PathBuf> {
    let open_failed = |reason: String| ServeError::OpenFailed {
        path: path.to_path_buf(),
        reason,
    };

    read_header(path).map_err(|e| open_failed(e.to_string()))?;
    std::fs::canonicalize(path).map_err(|e| open_failed(e.to_string()))
}
