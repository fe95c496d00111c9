//! Conversation state used to build the next model request.
//!
//! Three buckets, returned in a fixed order: system messages, the environment
//! snapshot, then a sliding window of user/assistant/tool turns.

use std::collections::VecDeque;
use std::fmt;

use kestrel_abstraction::{ChatMessage, Role};
use tokio::sync::RwLock;
use tracing::trace;

/// Prefix of the environment message.
pub const ENVIRONMENT_BANNER: &str = "Current environment information:\n";

#[derive(Debug, Default)]
struct HistoryState {
    system: Vec<ChatMessage>,
    environment: Option<ChatMessage>,
    conversation: VecDeque<ChatMessage>,
}

/// Message history with a bounded conversation window.
pub struct MessageHistory {
    state: RwLock<HistoryState>,
    limit: usize,
}

impl fmt::Debug for MessageHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHistory")
            .field("limit", &self.limit)
            .field(
                "conversation_len",
                &self.state.try_read().map(|s| s.conversation.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl MessageHistory {
    /// Creates an empty history keeping at most `limit` conversation entries.
    #[must_use]
    pub fn new(limit: usize, capacity: usize) -> Self {
        let state = HistoryState {
            conversation: VecDeque::with_capacity(capacity.min(limit.saturating_add(1))),
            ..HistoryState::default()
        };
        Self { state: RwLock::new(state), limit }
    }

    /// Appends a system message. System messages are never trimmed.
    pub async fn add_system_message(&self, content: impl Into<String>) {
        self.state.write().await.system.push(ChatMessage::system(content));
    }

    /// Replaces the environment snapshot.
    pub async fn set_environment_message(&self, environment: &str) {
        let message = ChatMessage::system(format!("{ENVIRONMENT_BANNER}{environment}"));
        self.state.write().await.environment = Some(message);
    }

    /// Appends a user turn.
    pub async fn add_user_message(&self, content: impl Into<String>) {
        self.push(ChatMessage::new(Role::User, content)).await;
    }

    /// Appends an assistant turn.
    pub async fn add_assistant_message(&self, content: impl Into<String>) {
        self.push(ChatMessage::new(Role::Assistant, content)).await;
    }

    /// Appends a tool result.
    pub async fn add_tool_message(&self, content: impl Into<String>) {
        self.push(ChatMessage::new(Role::Tool, content)).await;
    }

    async fn push(&self, message: ChatMessage) {
        let mut state = self.state.write().await;
        state.conversation.push_back(message);

        let excess = state.conversation.len().saturating_sub(self.limit);
        if excess > 0 {
            state.conversation.drain(..excess);
            trace!(dropped = excess, "Trimmed conversation window");
        }
    }

    /// System messages, then the environment message, then the conversation window.
    pub async fn get_messages(&self) -> Vec<ChatMessage> {
        let state = self.state.read().await;
        let mut messages = Vec::with_capacity(
            state.system.len() + usize::from(state.environment.is_some()) + state.conversation.len(),
        );
        messages.extend(state.system.iter().cloned());
        messages.extend(state.environment.iter().cloned());
        messages.extend(state.conversation.iter().cloned());
        messages
    }

    /// Empties the conversation window. System and environment messages stay.
    pub async fn clear(&self) {
        self.state.write().await.conversation.clear();
    }

    /// Number of entries in the conversation window.
    pub async fn conversation_len(&self) -> usize {
        self.state.read().await.conversation.len()
    }

    /// Maximum size of the conversation window.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}
