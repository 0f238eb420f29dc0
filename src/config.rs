//! Settings storage
//!
//! Defaults for model loading, context sizing and generation, persisted as
//! JSON in the platform data directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::ModelParams;

/// Settings-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access data directory: {0}")]
    DataDir(String),
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize settings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// - Windows: `C:\Users\{user}\AppData\Roaming\llamaserve\llamaserve`
/// - macOS: `/Users/{user}/Library/Application Support/dev.llamaserve.llamaserve`
/// - Linux: `/home/{user}/.local/share/llamaserve`
pub fn get_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("dev", "llamaserve", "llamaserve")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DataDir("Could not determine data directory".to_string()))
}

/// Generation defaults applied when a request leaves a field unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub penalty_last_n: i32,
    /// 0 picks a random seed per request
    pub seed: u32,
    pub stop: Vec<String>,
    pub prefix_caching: bool,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalty_last_n: 64,
            seed: 0,
            stop: Vec::new(),
            prefix_caching: true,
        }
    }
}

/// Server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeSettings {
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    pub use_mmap: bool,
    /// Context size used when a model reports no training context
    pub context_size: u32,
    /// Upper bound applied to a model's training context
    pub max_context_size: u32,
    pub batch_size: u32,
    pub threads: Option<u32>,
    pub generation: GenerationDefaults,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            gpu_layers: 99, // Offload all layers to GPU by default
            use_mmap: true,
            context_size: 4096,
            max_context_size: 32768,
            batch_size: 512,
            threads: None,
            generation: GenerationDefaults::default(),
        }
    }
}

impl ServeSettings {
    /// Clamp values into their accepted ranges
    pub fn validate(&mut self) {
        let generation = &mut self.generation;
        generation.temperature = generation.temperature.clamp(0.0, 2.0);
        generation.top_p = generation.top_p.clamp(0.0, 1.0);
        generation.min_p = generation.min_p.clamp(0.0, 1.0);
        generation.top_k = generation.top_k.max(0);

        if generation.repeat_penalty <= 0.0 {
            generation.repeat_penalty = 1.0;
        }

        if generation.max_tokens == 0 {
            generation.max_tokens = 512;
        }

        generation.stop.retain(|s| !s.is_empty());

        if self.context_size == 0 {
            self.context_size = 4096;
        }

        if self.max_context_size == 0 {
            self.max_context_size = 32768;
        }

        if self.batch_size == 0 {
            self.batch_size = 512;
        }

        if self.threads == Some(0) {
            self.threads = None;
        }
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            gpu_layers: self.gpu_layers,
            use_mmap: self.use_mmap,
        }
    }
}

fn get_settings_path() -> Result<PathBuf, ConfigError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the data directory
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> ServeSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            ServeSettings::default()
        }
    }
}

/// Load settings from an explicit path
pub fn load_settings_from(path: &Path) -> Result<ServeSettings, ConfigError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(ServeSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: ServeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the data directory
pub fn save_settings(settings: &ServeSettings) -> Result<(), ConfigError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &ServeSettings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
