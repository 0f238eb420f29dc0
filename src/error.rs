//! Error taxonomy
//!
//! Infrastructure failures (missing model, context allocation) are produced by
//! the cache and task wrappers; caller callback errors pass through as-is;
//! native failures are wrapped with the operation and model path.

use std::path::PathBuf;

use thiserror::Error;

use crate::runtime::RuntimeError;

pub type Result<T, E = ServeError> = std::result::Result<T, E>;

/// Errors surfaced by the serving layer
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Failed to open model {}: {reason}", path.display())]
    OpenFailed { path: PathBuf, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid model handle: {0}")]
    InvalidModel(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("No KV cache slot for a batch of {0} tokens; retry with a smaller batch or a larger context")]
    NoKvSlot(usize),

    #[error("Batch is full (capacity {0})")]
    BatchFull(usize),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("{op} failed for {model}: {source}")]
    Native {
        op: &'static str,
        model: String,
        #[source]
        source: RuntimeError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl ServeError {
    /// Wraps an arbitrary caller error raised inside a chunk callback.
    pub fn callback<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ServeError::Callback(error.into())
    }

    /// True for conditions the caller may retry with different sizing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServeError::NoKvSlot(_))
    }
}

/// Attaches operation and model context to backend errors.
pub trait NativeResultExt<T> {
    fn native(self, op: &'static str, model: &str) -> Result<T>;
}

impl<T> NativeResultExt<T> for std::result::Result<T, RuntimeError> {
    fn native(self, op: &'static str, model: &str) -> Result<T> {
        self.map_err(|source| match source {
            RuntimeError::NoKvSlot(n) => ServeError::NoKvSlot(n),
            RuntimeError::BatchFull(n) => ServeError::BatchFull(n),
            RuntimeError::Aborted => ServeError::Cancelled,
            source => ServeError::Native {
                op,
                model: model.to_string(),
                source,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_context() {
        let result: std::result::Result<(), RuntimeError> =
            Err(RuntimeError::Decode("bad batch".to_string()));
        let err = result.native("decode", "/models/a.gguf").unwrap_err();
        assert_eq!(
            err.to_string(),
            "decode failed for /models/a.gguf: Decode failed: bad batch"
        );
    }

    #[test]
    fn test_native_error_dedicated_variants() {
        let no_slot: std::result::Result<(), RuntimeError> = Err(RuntimeError::NoKvSlot(8));
        let err = no_slot.native("decode", "m").unwrap_err();
        assert!(matches!(err, ServeError::NoKvSlot(8)));
        assert!(err.is_retryable());

        let aborted: std::result::Result<(), RuntimeError> = Err(RuntimeError::Aborted);
        assert!(matches!(
            aborted.native("decode", "m"),
            Err(ServeError::Cancelled)
        ));
    }

    #[test]
    fn test_callback_error_message() {
        let err = ServeError::callback("client went away");
        assert_eq!(err.to_string(), "Callback failed: client went away");
    }
}
