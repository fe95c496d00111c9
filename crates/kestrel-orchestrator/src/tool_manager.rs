//! Session-wide queue of tool calls waiting for a human decision.
//!
//! This is the front-end's view of tools: the FIFO of calls needing
//! accept/reject, the last known status of every invocation, and the input
//! mode those imply. It never talks to the model.
//!
//! All state sits behind one mutex. Nothing is published while it is held;
//! follow-up work re-enters through the bus instead of calling handlers inline.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::{CapacityConfig, ToolsConfig};
use crate::error::Result;
use crate::event::{
    ComponentTag, Decision, Event, ToolCallEvent, ToolRawResult, ToolStatus, ToolUseReport,
    UpdateUserStatus, UpdateView, UserDecision, UserStatus,
};
use crate::id::{RequestId, ToolCallId};

/// Longest tool summary shown in a report.
const MAX_INFO_LEN: usize = 120;

/// Last known state of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTool {
    /// Invocation identifier
    pub tool_call_id: ToolCallId,
    /// Human-readable detail
    pub info: String,
    /// Current status
    pub status: ToolStatus,
}

/// A tool call waiting for accept/reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTool {
    /// Turn identifier
    pub request_id: RequestId,
    /// Invocation identifier
    pub tool_call_id: ToolCallId,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<PendingTool>,
    active: HashMap<ToolCallId, ActiveTool>,
    changed: Vec<ActiveTool>,
    status: UserStatus,
}

/// Global pending-tool queue.
pub struct ToolManager {
    bus: EventBus,
    tools: ToolsConfig,
    state: Mutex<QueueState>,
}

impl fmt::Debug for ToolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolManager")
            .field("auto_approve", &self.tools.auto_approve)
            .field("pending", &self.state.try_lock().map(|s| s.pending.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl ToolManager {
    /// Creates an empty queue publishing on `bus`.
    pub fn new(bus: EventBus, tools: ToolsConfig, capacity: &CapacityConfig) -> Self {
        Self {
            bus,
            tools,
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity.pending_tools),
                active: HashMap::with_capacity(capacity.active_tools),
                changed: Vec::with_capacity(capacity.active_tools),
                status: UserStatus::default(),
            }),
        }
    }

    /// Installs the tool-call, tool-report, raw-result and cancel handlers.
    ///
    /// # Errors
    /// Returns `OrchestrationError::BusClosed` if the bus was already closed.
    pub fn subscribe(self: &Arc<Self>) -> Result<()> {
        self.bus.ensure_open()?;

        let manager = Arc::clone(self);
        self.bus.tool_call.subscribe(ComponentTag::ToolManager, move |event| {
            let manager = Arc::clone(&manager);
            async move { manager.on_tool_call(event.data).await }
        });

        let manager = Arc::clone(self);
        self.bus.tool_use_report.subscribe(ComponentTag::ToolManager, move |event| {
            let manager = Arc::clone(&manager);
            async move { manager.process_report_event(event.data).await }
        });

        let manager = Arc::clone(self);
        self.bus.tool_raw_result.subscribe(ComponentTag::ToolManager, move |event| {
            let manager = Arc::clone(&manager);
            async move { manager.on_raw_result(event.data) }
        });

        let manager = Arc::clone(self);
        self.bus.stream_cancel.subscribe(ComponentTag::ToolManager, move |event| {
            let manager = Arc::clone(&manager);
            async move {
                manager.cancel_request(event.data.request_id).await;
            }
        });

        debug!("Tool manager subscribed");
        Ok(())
    }

    async fn on_tool_call(&self, call: ToolCallEvent) {
        let info = format!("{} {}", call.tool_name, summarize(&Value::Object(call.parameters.clone()).to_string()));
        let tool_call_id = call.tool_call_id;

        if self.tools.is_auto_approved(&call.tool_name) {
            info!(tool = %call.tool_name, tool_call_id = %tool_call_id, "Auto-approving tool call");
            self.bus.accept_tool.publish(Event::new(ComponentTag::ToolManager, call));
        } else {
            self.process_request_event(call.request_id, tool_call_id).await;
        }

        self.report(ToolUseReport { tool_call_id, status: ToolStatus::Call, info });
    }

    fn on_raw_result(&self, raw: ToolRawResult) {
        let status = if raw.result.is_error { ToolStatus::Error } else { ToolStatus::Success };
        self.report(ToolUseReport {
            tool_call_id: raw.tool_call_id,
            status,
            info: summarize(&raw.result.content),
        });
    }

    fn report(&self, report: ToolUseReport) {
        self.bus.tool_use_report.publish(Event::new(ComponentTag::ToolManager, report));
    }

    fn set_status(&self, status: UserStatus) {
        self.bus
            .update_user_status
            .publish(Event::new(ComponentTag::ToolManager, UpdateUserStatus { status }));
    }

    /// Queues a tool call for a human decision.
    ///
    /// The first entry of an empty queue switches the front-end to
    /// [`UserStatus::AwaitingToolDecision`].
    pub async fn process_request_event(&self, request_id: RequestId, tool_call_id: ToolCallId) {
        let became_busy = {
            let mut state = self.state.lock().await;
            let was_empty = state.pending.is_empty();
            state.pending.push_back(PendingTool { request_id, tool_call_id });
            if was_empty {
                state.status = UserStatus::AwaitingToolDecision;
            }
            was_empty
        };

        debug!(request_id = %request_id, tool_call_id = %tool_call_id, "Queued tool call for decision");
        if became_busy {
            self.set_status(UserStatus::AwaitingToolDecision);
        }
    }

    /// Records a status report. Unchanged reports are ignored.
    pub async fn process_report_event(&self, report: ToolUseReport) {
        let changed = {
            let mut state = self.state.lock().await;
            let unchanged = state
                .active
                .get(&report.tool_call_id)
                .is_some_and(|tool| tool.status == report.status && tool.info == report.info);
            if unchanged {
                false
            } else {
                let tool = ActiveTool {
                    tool_call_id: report.tool_call_id,
                    info: report.info,
                    status: report.status,
                };
                state.active.insert(tool.tool_call_id, tool.clone());
                state.changed.push(tool);
                true
            }
        };

        if changed {
            self.bus.update_view.publish(Event::new(ComponentTag::ToolManager, UpdateView));
        }
    }

    /// Decides the head of the queue: index 0 accepts, anything else rejects.
    ///
    /// Returns the decided entry, or `None` if the queue was empty.
    pub async fn select(&self, index: usize) -> Option<PendingTool> {
        let decision = if index == 0 { Decision::Accept } else { Decision::Reject };
        self.decide(decision).await
    }

    /// Rejects the head of the queue.
    pub async fn quit(&self) -> Option<PendingTool> {
        self.decide(Decision::Reject).await
    }

    async fn decide(&self, decision: Decision) -> Option<PendingTool> {
        let (head, drained) = {
            let mut state = self.state.lock().await;
            let Some(head) = state.pending.pop_front() else {
                warn!("No pending tool call to decide");
                return None;
            };
            let drained = state.pending.is_empty();
            if drained {
                state.status = UserStatus::AwaitingAssistant;
            }
            (head, drained)
        };

        info!(
            request_id = %head.request_id,
            tool_call_id = %head.tool_call_id,
            decision = ?decision,
            "Tool call decided"
        );
        self.bus.user_decision.publish(Event::new(
            ComponentTag::ToolManager,
            UserDecision { request_id: head.request_id, tool_call_id: head.tool_call_id, decision },
        ));
        if drained {
            self.set_status(UserStatus::AwaitingAssistant);
        }
        Some(head)
    }

    /// Rejects every queued call of a cancelled turn.
    ///
    /// If that empties the queue the front-end returns to
    /// [`UserStatus::FreeInput`]. Returns how many entries were dropped.
    pub async fn cancel_request(&self, request_id: RequestId) -> usize {
        let (dropped, drained) = {
            let mut state = self.state.lock().await;
            let mut dropped = Vec::new();
            state.pending.retain(|pending| {
                let stale = pending.request_id == request_id;
                if stale {
                    dropped.push(*pending);
                }
                !stale
            });
            let drained = !dropped.is_empty() && state.pending.is_empty();
            if drained {
                state.status = UserStatus::FreeInput;
            }
            (dropped, drained)
        };

        if dropped.is_empty() {
            return 0;
        }
        info!(request_id = %request_id, dropped = dropped.len(), "Rejecting queued calls of cancelled turn");
        for pending in &dropped {
            self.bus.user_decision.publish(Event::new(
                ComponentTag::ToolManager,
                UserDecision {
                    request_id: pending.request_id,
                    tool_call_id: pending.tool_call_id,
                    decision: Decision::Reject,
                },
            ));
        }
        if drained {
            self.set_status(UserStatus::FreeInput);
        }
        dropped.len()
    }

    /// Drains the tool states changed since the previous call.
    ///
    /// Finished invocations are forgotten once they have been handed out.
    pub async fn changed_active_tools(&self) -> Vec<ActiveTool> {
        let mut state = self.state.lock().await;
        let changed = std::mem::take(&mut state.changed);
        for tool in &changed {
            if tool.status != ToolStatus::Call {
                state.active.remove(&tool.tool_call_id);
            }
        }
        changed
    }

    /// Queued entries, head first.
    pub async fn pending_tools(&self) -> Vec<PendingTool> {
        self.state.lock().await.pending.iter().copied().collect()
    }

    /// Number of queued entries.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// The entry the next decision applies to.
    pub async fn head(&self) -> Option<PendingTool> {
        self.state.lock().await.pending.front().copied()
    }

    /// Input mode last announced by this queue.
    pub async fn user_status(&self) -> UserStatus {
        self.state.lock().await.status
    }

    /// Known tool states.
    pub async fn active_tools(&self) -> Vec<ActiveTool> {
        self.state.lock().await.active.values().cloned().collect()
    }
}

fn summarize(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > MAX_INFO_LEN {
        let cut: String = line.chars().take(MAX_INFO_LEN).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
