// Error types for orchestration

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The worker pool cannot be built with the requested size
    #[error("Invalid worker pool size: {0} (must be at least 1)")]
    InvalidPoolSize(usize),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Model error
    #[error("Model error: {0}")]
    Model(#[from] kestrel_abstraction::ModelError),

    /// Handlers cannot be registered on a closed event bus
    #[error("Event bus is closed")]
    BusClosed,
}
