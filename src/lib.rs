//! llamaserve library
//!
//! Local model serving on top of a non-reentrant inference engine: a model
//! cache with per-model exclusive locks, scoped inference contexts, streaming
//! generation with stop sequences, and KV-cache prefix sharing across choices.

pub mod cache;
pub mod cancel;
pub mod chat;
pub mod config;
pub mod error;
pub mod inference;
pub mod prefix;
pub mod runtime;
pub mod service;
pub mod store;
pub mod task;

pub use cache::{CachedModel, Model, ModelCache, ModelView};
pub use cancel::CancelSignal;
pub use config::ServeSettings;
pub use error::{Result, ServeError};
pub use service::Service;
pub use task::{ModelRequest, Task, TaskGuard};
