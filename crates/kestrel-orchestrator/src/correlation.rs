//! Per-request bookkeeping of outstanding tool calls.
//!
//! The driver uses this to decide when every tool result of a turn has arrived
//! and the model should be invoked again. It is unrelated to human approval,
//! which lives in [`crate::tool_manager`].

use std::collections::HashMap;
use std::fmt;

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::id::{RequestId, ToolCallId};

/// Result of [`ToolCorrelationManager::complete_tool_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The pair was not registered (late, duplicate, or cleared by cancellation).
    Unknown,
    /// The call was completed; this many calls are still outstanding.
    Pending(usize),
    /// This completion emptied the request. Its context has been dropped.
    Drained,
}

/// Outstanding tool calls of one request.
#[derive(Debug, Default)]
struct RequestContext {
    tool_calls: HashMap<ToolCallId, String>,
}

/// Tracks which tool calls each request is still waiting on.
pub struct ToolCorrelationManager {
    requests: RwLock<HashMap<RequestId, RequestContext>>,
}

impl fmt::Debug for ToolCorrelationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCorrelationManager")
            .field("active_requests", &self.requests.try_read().map(|r| r.len()).unwrap_or(0))
            .finish()
    }
}

impl Default for ToolCorrelationManager {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ToolCorrelationManager {
    /// Creates an empty manager, reserving room for `capacity` requests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { requests: RwLock::new(HashMap::with_capacity(capacity)) }
    }

    /// Registers a pending tool call, creating the request context if needed.
    pub async fn register_tool_call(
        &self,
        request_id: RequestId,
        tool_call_id: ToolCallId,
        tool_name: impl Into<String>,
    ) {
        let tool_name = tool_name.into();
        trace!(request_id = %request_id, tool_call_id = %tool_call_id, tool = %tool_name, "Registering tool call");

        let mut requests = self.requests.write().await;
        requests.entry(request_id).or_default().tool_calls.insert(tool_call_id, tool_name);
    }

    /// Whether `tool_call_id` is outstanding under `request_id`.
    pub async fn has_tool_call(&self, request_id: RequestId, tool_call_id: ToolCallId) -> bool {
        let requests = self.requests.read().await;
        requests.get(&request_id).is_some_and(|ctx| ctx.tool_calls.contains_key(&tool_call_id))
    }

    /// Whether `request_id` has any outstanding tool call.
    pub async fn has_pending_calls(&self, request_id: RequestId) -> bool {
        self.pending_count(request_id).await > 0
    }

    /// Number of outstanding tool calls for `request_id`.
    pub async fn pending_count(&self, request_id: RequestId) -> usize {
        let requests = self.requests.read().await;
        requests.get(&request_id).map_or(0, |ctx| ctx.tool_calls.len())
    }

    /// Marks a tool call as completed.
    ///
    /// Completing an unknown pair is a no-op. When the last call of a request
    /// completes, the context is dropped under the same lock, so exactly one
    /// caller ever observes [`CompletionOutcome::Drained`] for it.
    pub async fn complete_tool_call(
        &self,
        request_id: RequestId,
        tool_call_id: ToolCallId,
    ) -> CompletionOutcome {
        let mut requests = self.requests.write().await;

        let Some(ctx) = requests.get_mut(&request_id) else {
            return CompletionOutcome::Unknown;
        };
        if ctx.tool_calls.remove(&tool_call_id).is_none() {
            return CompletionOutcome::Unknown;
        }

        let remaining = ctx.tool_calls.len();
        if remaining == 0 {
            requests.remove(&request_id);
            debug!(request_id = %request_id, "All tool calls completed");
            CompletionOutcome::Drained
        } else {
            CompletionOutcome::Pending(remaining)
        }
    }

    /// Drops the whole context of `request_id`. Returns whether one existed.
    pub async fn clear_request(&self, request_id: RequestId) -> bool {
        let removed = self.requests.write().await.remove(&request_id).is_some();
        if removed {
            debug!(request_id = %request_id, "Cleared request context");
        }
        removed
    }

    /// Number of requests with outstanding tool calls.
    pub async fn active_requests(&self) -> usize {
        self.requests.read().await.len()
    }
}
