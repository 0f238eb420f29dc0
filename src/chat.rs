//! Chat message types
//!
//! Defines chat roles and messages, and turns a conversation into a prompt
//! using the model's own template when it has one.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServeError};
use crate::runtime::NativeModel;

/// Role of a message sender
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// Message from the user
    User,
    /// Message from the assistant
    Assistant,
    /// Output of a tool call
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// ChatML rendering used when the model carries no usable template.
pub fn chatml_prompt(messages: &[ChatMessage], add_assistant: bool) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(message.role.as_str());
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    if add_assistant {
        prompt.push_str("<|im_start|>assistant\n");
    }
    prompt
}

/// Renders `messages` with the model's template, falling back to ChatML.
///
/// Must be called while holding the model lock.
pub fn build_chat_prompt(model: &dyn NativeModel, messages: &[ChatMessage]) -> Result<String> {
    if messages.is_empty() {
        return Err(ServeError::InvalidArgument(
            "chat request has no messages".to_string(),
        ));
    }

    if model.chat_template().is_none() {
        tracing::warn!("Model has no chat template, using ChatML");
        return Ok(chatml_prompt(messages, true));
    }

    match model.apply_chat_template(messages, true) {
        Ok(prompt) => Ok(prompt),
        Err(error) => {
            tracing::warn!("Chat template not applied: {error}");
            Ok(chatml_prompt(messages, true))
        }
    }
}
