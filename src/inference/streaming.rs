//! Streaming inference support
//!
//! Chunks emitted while a generation runs, and the events an async stream
//! carries to its consumer.

use serde::{Deserialize, Serialize};

/// Filtered text for one choice, in generation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
}

impl Chunk {
    pub fn new(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// Represents an event emitted during streaming inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamEvent<T> {
    /// A piece of generated text
    Chunk(Chunk),
    /// Generation completed successfully with its final result
    Done(T),
    /// An error ended the stream
    Error(String),
}

impl<T> StreamEvent<T> {
    /// Returns true if this is a chunk variant
    pub fn is_chunk(&self) -> bool {
        matches!(self, StreamEvent::Chunk(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error(_))
    }

    /// Extracts the chunk text if this is a Chunk variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StreamEvent::Chunk(chunk) => Some(&chunk.text),
            _ => None,
        }
    }

    /// Extracts the error message if this is an Error variant
    pub fn as_error(&self) -> Option<&str> {
        match self {
            StreamEvent::Error(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_variants() {
        let chunk: StreamEvent<()> = StreamEvent::Chunk(Chunk::new(0, "hello"));
        assert!(chunk.is_chunk());
        assert!(!chunk.is_done());
        assert!(!chunk.is_error());
        assert_eq!(chunk.as_text(), Some("hello"));

        let done: StreamEvent<u32> = StreamEvent::Done(7);
        assert!(!done.is_chunk());
        assert!(done.is_done());
        assert!(!done.is_error());

        let error: StreamEvent<()> = StreamEvent::Error("test error".to_string());
        assert!(!error.is_chunk());
        assert!(!error.is_done());
        assert!(error.is_error());
        assert_eq!(error.as_error(), Some("test error"));
    }

    #[test]
    fn test_stream_event_json_shape() {
        let chunk: StreamEvent<()> = StreamEvent::Chunk(Chunk::new(1, "hi"));
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["data"]["index"], 1);
        assert_eq!(json["data"]["text"], "hi");
    }
}
