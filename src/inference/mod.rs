//! Text generation
//!
//! The decode/sample loop, stop sequence filtering, UTF-8 assembly of token
//! pieces, and the options and accounting around them.

pub mod engine;
pub mod options;
pub mod stop;
pub mod streaming;
pub mod utf8;

// Re-export main types for convenience
pub use engine::{ChoiceOutput, ChunkSink, Generation, Generator};
pub use options::{
    finish_reason, FinishReason, GenerationOptions, GenerationOverrides, TokenCallback, TokenEvent,
    Usage,
};
pub use stop::StopMarkerFilter;
pub use streaming::{Chunk, StreamEvent};
pub use utf8::Utf8Buffer;
