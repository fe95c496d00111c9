//! Model abstraction layer for Kestrel.
//!
//! This module defines the backend-neutral types for streaming chat completions
//! with tool calling, and the [`Model`] trait every backend implements.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Represents an error that can occur when interacting with an AI model.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// An error occurred during the API request (e.g., network issues, invalid request).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The model returned an error (e.g., unknown model, out of memory).
    #[error("Model Response Error: {0}")]
    ModelResponseError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// The request was cancelled by the caller.
    #[error("Request cancelled")]
    Cancelled,

    /// Other unexpected errors.
    #[error("Other Model Error: {0}")]
    Other(String),
}

impl ModelError {
    /// Returns `true` if this error only signals a cooperative cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions and context.
    System,
    /// A human turn.
    User,
    /// A model turn.
    Assistant,
    /// Output of a tool invocation fed back to the model.
    Tool,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a message in a conversation with a chat model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender.
    pub role: Role,
    /// The content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Creates a message with the given role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a tool message.
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

/// Parameters for controlling the model's generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// What sampling temperature to use, between 0 and 2.
    pub temperature: Option<f32>,

    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,
}

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (used in function calls)
    pub name: String,
    /// Tool description
    pub description: String,
    /// JSON schema of the parameters object
    pub parameters: Value,
}

impl ToolDefinition {
    /// Creates a new tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self { name: name.into(), description: description.into(), parameters }
    }
}

/// A tool invocation requested by the model.
///
/// Arguments stay a dynamic key-value map: their schema is owned by the tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    /// Name of the tool to invoke
    pub name: String,
    /// Arguments for the tool
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// One increment of a streamed chat completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Text produced since the previous chunk (may be empty).
    pub content: String,
    /// Whether the backend marked this chunk as the last one.
    pub done: bool,
    /// Tool calls carried by this chunk.
    #[serde(default)]
    pub tool_calls: Vec<ModelToolCall>,
}

impl ChatChunk {
    /// A content-only chunk.
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), done: false, tool_calls: Vec::new() }
    }

    /// Marks this chunk as final.
    #[must_use]
    pub fn finished(mut self) -> Self {
        self.done = true;
        self
    }

    /// Attaches a tool call to this chunk.
    #[must_use]
    pub fn with_tool_call(mut self, call: ModelToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// Everything a backend needs to produce one streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Backend model name (e.g. "qwen2.5-coder:7b").
    pub model: String,
    /// Conversation, already ordered for the model.
    pub messages: Vec<ChatMessage>,
    /// Tools the model may call.
    pub tools: Vec<ToolDefinition>,
    /// Optional generation parameters.
    pub parameters: Option<ModelParameters>,
}

/// Stream of chunks produced by a backend for one request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, ModelError>> + Send>>;

/// A trait for interacting with different AI model backends.
///
/// All models must be `Send + Sync` to allow concurrent use across tasks.
#[async_trait]
pub trait Model: Send + Sync {
    /// Starts a streamed chat completion.
    ///
    /// The returned stream yields chunks in backend order; the caller cancels
    /// the request by dropping the stream.
    ///
    /// # Errors
    /// Returns a `ModelError` if the request cannot be established.
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, ModelError>;

    /// Returns the ID of the model.
    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::tool("ok")).unwrap();
        assert_eq!(json, r#"{"role":"tool","content":"ok"}"#);
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn test_chunk_builders() {
        let call = ModelToolCall { name: "list_directory".to_string(), arguments: Map::new() };
        let chunk = ChatChunk::text("lo").finished().with_tool_call(call);
        assert!(chunk.done);
        assert_eq!(chunk.content, "lo");
        assert_eq!(chunk.tool_calls.len(), 1);
    }

    #[test]
    fn test_tool_call_arguments_default_to_empty() {
        let call: ModelToolCall = serde_json::from_str(r#"{"name":"read_file"}"#).unwrap();
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn test_cancelled_error() {
        assert!(ModelError::Cancelled.is_cancelled());
        assert!(!ModelError::Other("x".to_string()).is_cancelled());
    }

    #[test]
    fn test_error_messages() {
        let messages: Vec<String> = [
            ModelError::RequestError("refused".to_string()),
            ModelError::ModelResponseError("no model".to_string()),
            ModelError::SerializationError("bad line".to_string()),
            ModelError::Cancelled,
            ModelError::Other("odd".to_string()),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            messages,
            vec![
                "Request Error: refused",
                "Model Response Error: no model",
                "Serialization Error: bad line",
                "Request cancelled",
                "Other Model Error: odd",
            ]
        );
    }
}
