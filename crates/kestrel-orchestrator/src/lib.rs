//! Orchestration core for Kestrel.
//!
//! Components talk only through the [`EventBus`]: the [`LlmModule`] drives
//! model calls for each turn, the [`ToolManager`] queues tool calls waiting
//! for a human decision, and front-ends, tool executors and environment
//! probes plug in as ordinary subscribers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kestrel_models::MockModel;
//! use kestrel_orchestrator::{EventBus, LlmModule, RuntimeConfig, ToolManager};
//!
//! # async fn run() -> kestrel_orchestrator::Result<()> {
//! let config = RuntimeConfig::default();
//! let bus = EventBus::from_config(&config)?;
//! let llm = Arc::new(LlmModule::from_config(bus.clone(), Arc::new(MockModel::new("mock")), &config).await);
//! llm.subscribe()?;
//! let tools = Arc::new(ToolManager::new(bus.clone(), config.tools.clone(), &config.capacity));
//! tools.subscribe()?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod correlation;
pub mod driver;
pub mod error;
pub mod event;
pub mod history;
pub mod id;
pub mod stream;
pub mod tool_manager;

pub use bus::{EventBus, EventChannel, WorkerPool};
pub use config::{ConfigError, ModelProvider, ModelSettings, RuntimeConfig, ToolsConfig};
pub use correlation::{CompletionOutcome, ToolCorrelationManager};
pub use driver::LlmModule;
pub use error::{OrchestrationError, Result};
pub use event::{ComponentTag, Event};
pub use history::{MessageHistory, ENVIRONMENT_BANNER};
pub use id::{CreateId, RequestId, SessionId, ToolCallId};
pub use stream::{StreamManager, StreamSink};
pub use tool_manager::{ActiveTool, PendingTool, ToolManager};
