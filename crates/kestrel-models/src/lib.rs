//! Model implementations for Kestrel.
//!
//! This crate provides concrete implementations of the `Model` trait.
//!
//! # Supported Providers
//!
//! - **Mock**: Scripted turns for testing and offline runs
//! - **Ollama**: Local models via Ollama (no API key, local execution)

pub mod ollama;

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use kestrel_abstraction::{ChatChunk, ChatRequest, ChunkStream, Model, ModelError, Role};
use tracing::debug;

pub use ollama::OllamaModel;

/// One scripted reply of a [`MockModel`].
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Yield these chunks, then end the stream.
    Chunks(Vec<ChatChunk>),
    /// Yield these chunks, then never finish (until the stream is dropped).
    Stall(Vec<ChatChunk>),
    /// Fail while establishing the stream.
    Fail(ModelError),
}

/// A mock implementation of the `Model` trait for testing and demonstration.
///
/// Turns are consumed in order, one per `stream_chat` call. Once the script is
/// exhausted the model echoes the last user message in a single final chunk.
#[derive(Debug, Default)]
pub struct MockModel {
    id: String,
    turns: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockModel {
    /// Creates a new `MockModel` with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    /// Appends a scripted turn.
    #[must_use]
    pub fn with_turn(self, turn: MockTurn) -> Self {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner).push_back(turn);
        self
    }

    /// Appends a turn that streams `chunks` and ends.
    #[must_use]
    pub fn with_chunks(self, chunks: Vec<ChatChunk>) -> Self {
        self.with_turn(MockTurn::Chunks(chunks))
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of `stream_chat` calls received so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn echo(request: &ChatRequest) -> ChatChunk {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str());
        ChatChunk::text(format!("Mock response for: {last_user}")).finished()
    }
}

#[async_trait]
impl Model for MockModel {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, ModelError> {
        debug!(
            model_id = %self.id,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "MockModel streaming chat completion"
        );

        let turn = self.turns.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let turn = turn.unwrap_or_else(|| MockTurn::Chunks(vec![Self::echo(&request)]));
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request);

        match turn {
            MockTurn::Chunks(chunks) => Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed()),
            MockTurn::Stall(chunks) => Ok(futures::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            MockTurn::Fail(err) => Err(err),
        }
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}
