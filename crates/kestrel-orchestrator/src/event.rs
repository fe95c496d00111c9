//! Event envelope and payload shapes carried by the bus.
//!
//! Every channel carries exactly one payload type. Payloads are closed structs;
//! only tool parameters stay a dynamic JSON map, since their schema belongs to
//! the tool.

use chrono::{DateTime, Utc};
use kestrel_abstraction::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::id::{CreateId, RequestId, ToolCallId};

/// Component that produced an event.
///
/// Used for diagnostics and as the subscription key on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentTag {
    /// Terminal front-end
    Ui,
    /// Orchestration driver
    Llm,
    /// Global pending-tool queue
    ToolManager,
    /// Tool executor
    ToolExecutor,
    /// Raw tool result normalizer
    ToolAdapter,
    /// Environment probe
    Environment,
    /// The bus itself (fail-safe broadcasts)
    Bus,
}

impl ComponentTag {
    /// Lower-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Llm => "llm",
            Self::ToolManager => "tool_manager",
            Self::ToolExecutor => "tool_executor",
            Self::ToolAdapter => "tool_adapter",
            Self::Environment => "environment",
            Self::Bus => "bus",
        }
    }
}

impl fmt::Display for ComponentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope around a payload. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    /// Payload
    pub data: T,
    /// When the event was created
    pub timestamp: DateTime<Utc>,
    /// Producer
    pub source: ComponentTag,
}

impl<T> Event<T> {
    /// Wraps `data`, stamping it with the current time.
    pub fn new(source: ComponentTag, data: T) -> Self {
        Self { data, timestamp: Utc::now(), source }
    }
}

/// A line of user input starting a new turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInput {
    /// Turn identifier
    pub request_id: RequestId,
    /// What the user typed
    pub message: String,
}

/// Asks the environment provider for a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    /// Turn that needs the snapshot
    pub request_id: RequestId,
    /// Request correlation
    pub create_id: CreateId,
}

/// Environment snapshot, treated as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentUpdate {
    /// Correlates with the request that produced it
    pub create_id: CreateId,
    /// Snapshot text
    pub environment: String,
}

/// Asks the tool provider for the current tool list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolListRequest {
    /// Turn that needs the list
    pub request_id: RequestId,
    /// Request correlation
    pub create_id: CreateId,
}

/// Current tool list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolListUpdate {
    /// Correlates with the request that produced it
    pub create_id: CreateId,
    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,
}

/// A model call was started for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStart {
    /// Turn identifier
    pub request_id: RequestId,
}

/// A piece of streamed assistant text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Turn identifier
    pub request_id: RequestId,
    /// Text delta
    pub content: String,
}

/// The backend finished streaming a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamComplete {
    /// Turn identifier
    pub request_id: RequestId,
    /// `false` while the turn still has tool calls outstanding, even though
    /// the token stream itself has ended. Front-ends end the turn only on
    /// `true`.
    pub is_complete: bool,
}

/// The backend call for a turn failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    /// Turn identifier
    pub request_id: RequestId,
    /// Rendered error
    pub error: String,
}

/// The user asked to abort a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCancel {
    /// Turn identifier
    pub request_id: RequestId,
}

/// A tool invocation. Carried by both the tool-call and accept-tool channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    /// Turn identifier
    pub request_id: RequestId,
    /// Invocation identifier
    pub tool_call_id: ToolCallId,
    /// Tool to run
    pub tool_name: String,
    /// Backend-defined arguments
    pub parameters: Map<String, Value>,
}

/// Unnormalized tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawToolOutput {
    /// Whether the tool failed
    pub is_error: bool,
    /// Output text
    pub content: String,
}

/// Tool output as produced by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRawResult {
    /// Turn identifier
    pub request_id: RequestId,
    /// Invocation identifier
    pub tool_call_id: ToolCallId,
    /// Output
    pub result: RawToolOutput,
}

/// Tool output normalized to text for the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    /// Turn identifier
    pub request_id: RequestId,
    /// Invocation identifier
    pub tool_call_id: ToolCallId,
    /// Text fed back to the model
    pub tool_result: String,
}

/// Lifecycle status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Requested, not finished
    Call,
    /// Finished successfully
    Success,
    /// Finished with an error
    Error,
}

/// Status report for one tool invocation, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUseReport {
    /// Invocation identifier
    pub tool_call_id: ToolCallId,
    /// New status
    pub status: ToolStatus,
    /// Human-readable detail
    pub info: String,
}

/// The set of changed tool statuses should be re-rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateView;

/// Input mode of the front-end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// The user may type a new message
    #[default]
    FreeInput,
    /// The assistant is working on the turn
    AwaitingAssistant,
    /// A tool call waits for accept/reject
    AwaitingToolDecision,
}

/// The front-end input mode changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateUserStatus {
    /// New mode
    pub status: UserStatus,
}

/// Human verdict on a pending tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Run the tool
    Accept,
    /// Do not run the tool
    Reject,
}

/// A pending tool call was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDecision {
    /// Turn identifier
    pub request_id: RequestId,
    /// Invocation identifier
    pub tool_call_id: ToolCallId,
    /// Verdict
    pub decision: Decision,
}

/// Fail-safe broadcast: some handler panicked and the system state is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ragnarok;
