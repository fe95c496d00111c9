//! Ollama model implementation.
//!
//! This module provides an implementation of the `Model` trait for Ollama's local
//! `/api/chat` endpoint, streaming newline-delimited JSON with tool calls.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use kestrel_abstraction::{
    ChatChunk, ChatMessage, ChatRequest, ChunkStream, Model, ModelError, ModelParameters,
    ModelToolCall, ToolDefinition,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

/// Default address of a local Ollama server.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama model implementation.
#[derive(Debug, Clone)]
pub struct OllamaModel {
    /// The model ID (e.g., "qwen2.5-coder:7b").
    model_id: String,
    /// The base URL for the Ollama API (default: "http://localhost:11434").
    base_url: String,
    /// HTTP client for making requests.
    client: Client,
}

impl OllamaModel {
    /// Creates a new `OllamaModel` with the given model ID.
    ///
    /// Uses the default Ollama server URL: `http://localhost:11434`
    pub fn new(model_id: impl Into<String>) -> Self {
        Self::with_base_url(model_id, DEFAULT_BASE_URL)
    }

    /// Creates a new `OllamaModel` with a custom base URL.
    ///
    /// # Arguments
    /// * `model_id` - The Ollama model ID to use
    /// * `base_url` - The base URL for the Ollama API (e.g., "http://192.168.1.100:11434")
    pub fn with_base_url(model_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            model_id: model_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    /// The server this model talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

// Ollama API request/response structures
#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>, // max_tokens equivalent
}

#[derive(Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OllamaTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OllamaFunction,
}

#[derive(Serialize)]
struct OllamaFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct OllamaStreamLine {
    #[serde(default)]
    message: Option<OllamaResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Deserialize)]
struct OllamaToolCall {
    function: OllamaCalledFunction,
}

#[derive(Deserialize)]
struct OllamaCalledFunction {
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

#[derive(Deserialize)]
struct OllamaError {
    error: String,
}

impl OllamaModel {
    /// Build OllamaOptions from ModelParameters
    fn build_options(parameters: Option<ModelParameters>) -> Option<OllamaOptions> {
        parameters.map(|p| OllamaOptions { temperature: p.temperature, num_predict: p.max_tokens })
    }

    /// Convert ChatMessage to OllamaMessage format
    fn to_ollama_message(msg: &ChatMessage) -> OllamaMessage {
        OllamaMessage { role: msg.role.as_str(), content: msg.content.clone() }
    }

    fn to_ollama_tool(tool: &ToolDefinition) -> OllamaTool {
        OllamaTool {
            kind: "function",
            function: OllamaFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }
    }

    /// Map a non-success HTTP status and body to a model error.
    fn status_error(&self, status: reqwest::StatusCode, error_text: &str) -> ModelError {
        if let Ok(error_json) = serde_json::from_str::<OllamaError>(error_text) {
            if error_json.error.contains("model") && error_json.error.contains("not found") {
                return ModelError::ModelResponseError(format!(
                    "Model '{}' not found. Pull it with 'ollama pull {}'.",
                    self.model_id, self.model_id
                ));
            }
            if error_json.error.contains("out of memory") || error_json.error.contains("OOM") {
                return ModelError::ModelResponseError(
                    "Insufficient memory to load model. Try a smaller variant.".to_string(),
                );
            }
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return ModelError::ModelResponseError(format!(
                "Model '{}' not found. Pull it with 'ollama pull {}'.",
                self.model_id, self.model_id
            ));
        }

        ModelError::ModelResponseError(format!("API error ({}): {}", status, error_text))
    }
}

#[async_trait]
impl Model for OllamaModel {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, ModelError> {
        debug!(
            model_id = %request.model,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "OllamaModel streaming chat completion"
        );

        let url = format!("{}/api/chat", self.base_url);
        let model = if request.model.is_empty() { self.model_id.clone() } else { request.model };

        let request_body = OllamaChatRequest {
            model,
            messages: request.messages.iter().map(Self::to_ollama_message).collect(),
            tools: request.tools.iter().map(Self::to_ollama_tool).collect(),
            stream: true,
            options: Self::build_options(request.parameters),
        };

        let response = self.client.post(&url).json(&request_body).send().await.map_err(|e| {
            error!(error = %e, base_url = %self.base_url, "Failed to connect to Ollama");
            if e.is_connect() {
                ModelError::RequestError(format!(
                    "Ollama server not reachable at {}. Start it with 'ollama serve'.",
                    self.base_url
                ))
            } else {
                ModelError::RequestError(format!("Network error: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(status = %status, error = %error_text, "Ollama API returned error status");
            return Err(self.status_error(status, &error_text));
        }

        Ok(Box::pin(NdjsonStream::new(response)))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Parses one NDJSON line into a chunk; `Ok(None)` for blank lines.
fn parse_line(line: &str) -> Result<Option<ChatChunk>, ModelError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: OllamaStreamLine = serde_json::from_str(line).map_err(|e| {
        ModelError::SerializationError(format!("Failed to parse stream line: {}", e))
    })?;

    if let Some(message) = parsed.error {
        return Err(ModelError::ModelResponseError(message));
    }

    let (content, tool_calls) = match parsed.message {
        Some(message) => (
            message.content,
            message
                .tool_calls
                .into_iter()
                .map(|c| ModelToolCall { name: c.function.name, arguments: c.function.arguments })
                .collect(),
        ),
        None => (String::new(), Vec::new()),
    };

    Ok(Some(ChatChunk { content, done: parsed.done, tool_calls }))
}

// Streaming response parser for newline-delimited JSON
struct NdjsonStream {
    stream: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl NdjsonStream {
    fn new(response: reqwest::Response) -> Self {
        Self { stream: Box::pin(response.bytes_stream()), buffer: Vec::new(), finished: false }
    }

    /// Pops the next complete line out of the buffer, if any.
    fn next_line(&mut self) -> Option<Result<String, ModelError>> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(String::from_utf8(line).map_err(|e| {
            ModelError::SerializationError(format!("Failed to decode stream line: {}", e))
        }))
    }
}

impl Stream for NdjsonStream {
    type Item = Result<ChatChunk, ModelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }

            // Drain complete lines before polling for more bytes
            while let Some(line) = self.next_line() {
                match line.and_then(|l| parse_line(&l)) {
                    Ok(Some(chunk)) => {
                        if chunk.done {
                            self.finished = true;
                        }
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.finished = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                }
            }

            match self.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(ModelError::RequestError(format!(
                        "Stream error: {}",
                        e
                    )))));
                }
                Poll::Ready(None) => {
                    // Trailing line without a newline terminator
                    self.finished = true;
                    let rest = std::mem::take(&mut self.buffer);
                    let rest = String::from_utf8_lossy(&rest);
                    return Poll::Ready(parse_line(&rest).transpose());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_model_new() {
        let model = OllamaModel::new("llama3.1");
        assert_eq!(model.model_id(), "llama3.1");
        assert_eq!(model.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn test_ollama_model_with_base_url_trims_slash() {
        let model = OllamaModel::with_base_url("llama3.1", "http://192.168.1.100:11434/");
        assert_eq!(model.base_url(), "http://192.168.1.100:11434");
    }

    #[test]
    fn test_parse_line_with_tool_call() {
        let line = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"list_directory","arguments":{"path":"."}}}]},"done":false}"#;
        let chunk = parse_line(line).unwrap().unwrap();
        assert!(!chunk.done);
        assert_eq!(chunk.tool_calls.len(), 1);
        assert_eq!(chunk.tool_calls[0].name, "list_directory");
        assert_eq!(chunk.tool_calls[0].arguments.get("path"), Some(&Value::from(".")));
    }

    #[test]
    fn test_parse_line_blank_and_error() {
        assert!(parse_line("   ").unwrap().is_none());
        let err = parse_line(r#"{"error":"model crashed"}"#).unwrap_err();
        assert_eq!(err, ModelError::ModelResponseError("model crashed".to_string()));
        assert!(matches!(parse_line("{not json"), Err(ModelError::SerializationError(_))));
    }

    #[test]
    fn test_status_error_model_not_found() {
        let model = OllamaModel::new("ghost");
        let err = model.status_error(
            reqwest::StatusCode::NOT_FOUND,
            r#"{"error":"model \"ghost\" not found, try pulling it first"}"#,
        );
        assert!(err.to_string().contains("ollama pull ghost"));
    }
}
