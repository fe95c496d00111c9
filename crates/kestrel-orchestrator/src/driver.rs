//! Orchestration driver wiring history, correlation and streaming to the bus.
//!
//! One turn: the user message lands in history, fresh environment and tool
//! snapshots are requested, and the model is streamed. Tool calls the model
//! makes are registered per request; once every result is back the model is
//! called again with the results in history.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_abstraction::{ChatRequest, Model, ModelToolCall, ToolDefinition};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::{ModelSettings, RuntimeConfig};
use crate::correlation::{CompletionOutcome, ToolCorrelationManager};
use crate::error::Result;
use crate::event::{
    ComponentTag, EnvironmentRequest, Event, StreamStart, ToolCallEvent, ToolListRequest,
    ToolResultEvent, UserInput,
};
use crate::history::MessageHistory;
use crate::id::{CreateId, RequestId, ToolCallId};
use crate::stream::{StreamManager, StreamSink};

/// The LLM module: drives model calls for every turn.
pub struct LlmModule {
    bus: EventBus,
    settings: ModelSettings,
    history: Arc<MessageHistory>,
    correlation: Arc<ToolCorrelationManager>,
    streams: StreamManager,
    tools: RwLock<Vec<ToolDefinition>>,
}

impl fmt::Debug for LlmModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmModule")
            .field("model", &self.settings.name)
            .field("streams", &self.streams)
            .field("tool_count", &self.tools.try_read().map(|t| t.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl LlmModule {
    /// Creates a driver over existing managers.
    pub fn new(
        bus: EventBus,
        model: Arc<dyn Model>,
        settings: ModelSettings,
        history: Arc<MessageHistory>,
        correlation: Arc<ToolCorrelationManager>,
    ) -> Self {
        let streams = StreamManager::new(bus.clone(), model);
        Self { bus, settings, history, correlation, streams, tools: RwLock::new(Vec::new()) }
    }

    /// Creates a driver with fresh managers sized by `config`, seeded with
    /// the configured system prompt.
    pub async fn from_config(bus: EventBus, model: Arc<dyn Model>, config: &RuntimeConfig) -> Self {
        let history = Arc::new(MessageHistory::new(config.history.limit, config.capacity.messages));
        if !config.system_prompt.is_empty() {
            history.add_system_message(config.system_prompt.clone()).await;
        }
        let correlation = Arc::new(ToolCorrelationManager::new(config.capacity.requests));
        Self::new(bus, model, config.model.clone(), history, correlation)
    }

    /// Installs every driver handler under [`ComponentTag::Llm`].
    ///
    /// # Errors
    /// Returns `OrchestrationError::BusClosed` if the bus was already closed.
    pub fn subscribe(self: &Arc<Self>) -> Result<()> {
        self.bus.ensure_open()?;

        let module = Arc::clone(self);
        self.bus.user_input.subscribe(ComponentTag::Llm, move |event| {
            let module = Arc::clone(&module);
            async move { module.on_user_input(event.data).await }
        });

        let module = Arc::clone(self);
        self.bus.environment_update.subscribe(ComponentTag::Llm, move |event| {
            let module = Arc::clone(&module);
            async move { module.history.set_environment_message(&event.data.environment).await }
        });

        let module = Arc::clone(self);
        self.bus.tool_list_update.subscribe(ComponentTag::Llm, move |event| {
            let module = Arc::clone(&module);
            async move {
                debug!(tools = event.data.tools.len(), "Tool list updated");
                *module.tools.write().await = event.data.tools;
            }
        });

        let module = Arc::clone(self);
        self.bus.tool_result.subscribe(ComponentTag::Llm, move |event| {
            let module = Arc::clone(&module);
            async move { module.on_tool_result(event.data).await }
        });

        let module = Arc::clone(self);
        self.bus.stream_cancel.subscribe(ComponentTag::Llm, move |event| {
            let module = Arc::clone(&module);
            async move {
                let request_id = event.data.request_id;
                let cancelled = module.streams.cancel_stream(request_id);
                module.correlation.clear_request(request_id).await;
                info!(request_id = %request_id, cancelled, "Turn cancelled");
            }
        });

        let module = Arc::clone(self);
        self.bus.stream_error.subscribe(ComponentTag::Llm, move |event| {
            let module = Arc::clone(&module);
            async move {
                module.correlation.clear_request(event.data.request_id).await;
            }
        });

        debug!(model = %self.settings.name, "LLM module subscribed");
        Ok(())
    }

    async fn on_user_input(self: &Arc<Self>, input: UserInput) {
        let request_id = input.request_id;
        debug!(request_id = %request_id, "User input received");

        self.history.add_user_message(input.message).await;

        self.bus.environment_request.publish(Event::new(
            ComponentTag::Llm,
            EnvironmentRequest { request_id, create_id: CreateId::new() },
        ));
        self.bus.tool_list_request.publish(Event::new(
            ComponentTag::Llm,
            ToolListRequest { request_id, create_id: CreateId::new() },
        ));

        self.call_api(request_id).await;
    }

    async fn on_tool_result(self: &Arc<Self>, result: ToolResultEvent) {
        let ToolResultEvent { request_id, tool_call_id, tool_result } = result;

        if !self.correlation.has_tool_call(request_id, tool_call_id).await {
            warn!(request_id = %request_id, tool_call_id = %tool_call_id, "Dropping result for unknown tool call");
            return;
        }

        self.history.add_tool_message(tool_result).await;

        match self.correlation.complete_tool_call(request_id, tool_call_id).await {
            CompletionOutcome::Drained => {
                debug!(request_id = %request_id, "Tool results complete, calling model again");
                self.call_api(request_id).await;
            }
            CompletionOutcome::Pending(remaining) => {
                debug!(request_id = %request_id, remaining, "Waiting for more tool results");
            }
            // Cleared between the check and the completion, e.g. by a cancel.
            CompletionOutcome::Unknown => {
                debug!(request_id = %request_id, tool_call_id = %tool_call_id, "Tool call cleared concurrently");
            }
        }
    }

    /// Streams the model with the current history and tool list.
    pub async fn call_api(self: &Arc<Self>, request_id: RequestId) {
        self.bus.stream_start.publish(Event::new(ComponentTag::Llm, StreamStart { request_id }));

        let request = ChatRequest {
            model: self.settings.name.clone(),
            messages: self.history.get_messages().await,
            tools: self.tools.read().await.clone(),
            parameters: self.settings.parameters(),
        };
        let sink: Arc<dyn StreamSink> = Arc::clone(self) as Arc<dyn StreamSink>;
        self.streams.start_stream(request_id, request, sink);
    }

    /// Conversation history.
    pub fn history(&self) -> &Arc<MessageHistory> {
        &self.history
    }

    /// Per-request tool call bookkeeping.
    pub fn correlation(&self) -> &Arc<ToolCorrelationManager> {
        &self.correlation
    }

    /// Stream handles.
    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Tool list the next model call will offer.
    pub async fn tools(&self) -> Vec<ToolDefinition> {
        self.tools.read().await.clone()
    }
}

#[async_trait]
impl StreamSink for LlmModule {
    async fn on_tool_calls(&self, request_id: RequestId, calls: Vec<ModelToolCall>) {
        if !self.streams.is_streaming(request_id) {
            debug!(request_id = %request_id, dropped = calls.len(), "Ignoring tool calls of cancelled turn");
            return;
        }

        let mut events = Vec::with_capacity(calls.len());
        // Register every call before publishing any, so an early result
        // cannot drain the request while siblings are still unregistered.
        for call in calls {
            let tool_call_id = ToolCallId::new();
            self.correlation.register_tool_call(request_id, tool_call_id, call.name.clone()).await;
            events.push(ToolCallEvent {
                request_id,
                tool_call_id,
                tool_name: call.name,
                parameters: call.arguments,
            });
        }

        for event in events {
            info!(
                request_id = %request_id,
                tool_call_id = %event.tool_call_id,
                tool = %event.tool_name,
                "Model requested tool"
            );
            self.bus.tool_call.publish(Event::new(ComponentTag::Llm, event));
        }
    }

    async fn has_pending_calls(&self, request_id: RequestId) -> bool {
        self.correlation.has_pending_calls(request_id).await
    }

    async fn on_done(&self, request_id: RequestId, text: String) {
        debug!(request_id = %request_id, chars = text.len(), "Response finished");
        if !text.is_empty() {
            self.history.add_assistant_message(text).await;
        }
    }
}
