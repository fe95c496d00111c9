//! Event bus: one typed channel per event shape over a shared worker pool.
//!
//! The bus is cheap to clone; every clone shares the same channels and pool.
//! Components never call each other directly. They publish an event and let
//! the pool dispatch it, which keeps lock scopes local to each component.

pub mod channel;
pub mod pool;

use std::sync::Arc;

use tracing::{debug, warn};

pub use channel::EventChannel;
pub use pool::WorkerPool;

use self::channel::FailSafe;
use crate::config::RuntimeConfig;
use crate::error::{OrchestrationError, Result};
use crate::event::{
    ComponentTag, EnvironmentRequest, EnvironmentUpdate, Event, Ragnarok, StreamCancel,
    StreamChunk, StreamComplete, StreamError, StreamStart, ToolCallEvent, ToolListRequest,
    ToolListUpdate, ToolRawResult, ToolResultEvent, ToolUseReport, UpdateUserStatus, UpdateView,
    UserDecision, UserInput,
};

/// Default number of handler slots reserved per channel.
const DEFAULT_HANDLER_CAPACITY: usize = 4;

/// All channels used by the application.
#[derive(Debug, Clone)]
pub struct EventBus {
    /// User typed a message
    pub user_input: EventChannel<UserInput>,
    /// Environment snapshot requested
    pub environment_request: EventChannel<EnvironmentRequest>,
    /// Environment snapshot delivered
    pub environment_update: EventChannel<EnvironmentUpdate>,
    /// Tool list requested
    pub tool_list_request: EventChannel<ToolListRequest>,
    /// Tool list delivered
    pub tool_list_update: EventChannel<ToolListUpdate>,
    /// Model call started
    pub stream_start: EventChannel<StreamStart>,
    /// Streamed text
    pub stream_chunk: EventChannel<StreamChunk>,
    /// Model call finished
    pub stream_complete: EventChannel<StreamComplete>,
    /// Model call failed
    pub stream_error: EventChannel<StreamError>,
    /// User aborted a turn
    pub stream_cancel: EventChannel<StreamCancel>,
    /// Model requested a tool
    pub tool_call: EventChannel<ToolCallEvent>,
    /// Tool call approved for execution
    pub accept_tool: EventChannel<ToolCallEvent>,
    /// Executor output
    pub tool_raw_result: EventChannel<ToolRawResult>,
    /// Normalized tool output
    pub tool_result: EventChannel<ToolResultEvent>,
    /// Tool status change
    pub tool_use_report: EventChannel<ToolUseReport>,
    /// View refresh
    pub update_view: EventChannel<UpdateView>,
    /// Front-end input mode change
    pub update_user_status: EventChannel<UpdateUserStatus>,
    /// Human accept/reject
    pub user_decision: EventChannel<UserDecision>,
    /// Fail-safe broadcast after a handler panic
    pub ragnarok: EventChannel<Ragnarok>,
    pool: WorkerPool,
}

impl EventBus {
    /// Creates a bus whose handlers run on a pool of `pool_size` workers.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InvalidPoolSize` if the pool cannot be built.
    pub fn new(pool_size: usize) -> Result<Self> {
        Self::with_capacity(pool_size, DEFAULT_HANDLER_CAPACITY)
    }

    /// Creates a bus from the runtime configuration.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Self::with_capacity(config.bus.pool_size, config.capacity.handlers)
    }

    /// Creates a bus reserving `handler_capacity` handler slots per channel.
    pub fn with_capacity(pool_size: usize, handler_capacity: usize) -> Result<Self> {
        let pool = WorkerPool::new(pool_size)?;
        let ragnarok: EventChannel<Ragnarok> =
            EventChannel::new("ragnarok", pool.clone(), handler_capacity, None);

        let fail_safe: FailSafe = {
            let ragnarok = ragnarok.clone();
            Arc::new(move |channel: &'static str, tag: ComponentTag| {
                warn!(channel, subscriber = %tag, "Broadcasting fail-safe after handler panic");
                ragnarok.publish(Event::new(ComponentTag::Bus, Ragnarok));
            })
        };

        macro_rules! typed {
            ($name:literal) => {
                EventChannel::new($name, pool.clone(), handler_capacity, Some(Arc::clone(&fail_safe)))
            };
        }

        debug!(pool_size, handler_capacity, "Event bus created");

        Ok(Self {
            user_input: typed!("user_input"),
            environment_request: typed!("environment_request"),
            environment_update: typed!("environment_update"),
            tool_list_request: typed!("tool_list_request"),
            tool_list_update: typed!("tool_list_update"),
            stream_start: typed!("stream_start"),
            stream_chunk: typed!("stream_chunk"),
            stream_complete: typed!("stream_complete"),
            stream_error: typed!("stream_error"),
            stream_cancel: typed!("stream_cancel"),
            tool_call: typed!("tool_call"),
            accept_tool: typed!("accept_tool"),
            tool_raw_result: typed!("tool_raw_result"),
            tool_result: typed!("tool_result"),
            tool_use_report: typed!("tool_use_report"),
            update_view: typed!("update_view"),
            update_user_status: typed!("update_user_status"),
            user_decision: typed!("user_decision"),
            ragnarok,
            pool,
        })
    }

    /// Publishes a fail-safe broadcast.
    pub fn ragnarok(&self) -> usize {
        self.ragnarok.publish(Event::new(ComponentTag::Bus, Ragnarok))
    }

    /// Releases the worker pool. In-flight and future publishes are dropped.
    /// Safe to call more than once.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Fails with `OrchestrationError::BusClosed` once the bus is closed.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(OrchestrationError::BusClosed);
        }
        Ok(())
    }

    /// The shared worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
