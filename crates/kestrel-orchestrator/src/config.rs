//! Runtime configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty file (or no file
//! at all) yields a runnable configuration.

use std::fmt;
use std::path::{Path, PathBuf};

use kestrel_abstraction::ModelParameters;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Name of the project-local configuration file.
pub const LOCAL_CONFIG_FILE: &str = ".kestrel.toml";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    Read(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// First system message of every conversation
    pub system_prompt: String,
    /// Event bus settings
    pub bus: BusConfig,
    /// Message history settings
    pub history: HistoryConfig,
    /// Initial capacities of internal maps and queues
    pub capacity: CapacityConfig,
    /// Model backend settings
    pub model: ModelSettings,
    /// Tool approval settings
    pub tools: ToolsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            bus: BusConfig::default(),
            history: HistoryConfig::default(),
            capacity: CapacityConfig::default(),
            model: ModelSettings::default(),
            tools: ToolsConfig::default(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are Kestrel, a coding assistant running in the user's terminal. \
     Use the available tools to inspect the workspace before answering questions about it. \
     Keep answers short and precise."
        .to_string()
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum number of handlers running at once
    pub pool_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { pool_size: 32 }
    }
}

/// Message history settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of user/assistant/tool messages kept
    pub limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { limit: 64 }
    }
}

/// Initial capacities. Hints only; nothing is bounded by them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Handler slots per channel
    pub handlers: usize,
    /// Pending-tool queue
    pub pending_tools: usize,
    /// Active-tool map
    pub active_tools: usize,
    /// Request-context table
    pub requests: usize,
    /// Conversation window
    pub messages: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self { handlers: 4, pending_tools: 8, active_tools: 16, requests: 8, messages: 64 }
    }
}

/// Which backend serves the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    /// Local Ollama server
    #[default]
    Ollama,
    /// Scripted offline backend
    Mock,
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Model backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Backend kind
    pub provider: ModelProvider,
    /// Model name passed to the backend
    pub name: String,
    /// Backend base URL
    pub endpoint: String,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Ollama,
            name: "qwen2.5-coder:7b".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ModelSettings {
    /// Generation parameters, or `None` when nothing is overridden.
    #[must_use]
    pub fn parameters(&self) -> Option<ModelParameters> {
        if self.temperature.is_none() && self.max_tokens.is_none() {
            return None;
        }
        Some(ModelParameters { temperature: self.temperature, max_tokens: self.max_tokens })
    }
}

/// Tool approval settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tools that run without asking the user
    pub auto_approve: Vec<String>,
}

impl ToolsConfig {
    /// Whether `tool_name` runs without a human decision.
    #[must_use]
    pub fn is_auto_approved(&self, tool_name: &str) -> bool {
        self.auto_approve.iter().any(|name| name == tool_name)
    }
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the file is missing, unreadable, or malformed.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        Self::from_toml_str(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
    }

    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Project-local configuration path.
    #[must_use]
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(LOCAL_CONFIG_FILE)
    }

    /// Per-user configuration path (`~/.kestrel/config.toml`).
    #[must_use]
    pub fn default_global_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".kestrel").join("config.toml"))
    }

    /// Finds and loads the configuration, then validates it.
    ///
    /// An explicit path must exist. Otherwise the first existing file among
    /// `./.kestrel.toml` and `~/.kestrel/config.toml` is used, falling back to
    /// defaults when neither exists.
    pub fn discover_and_load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let candidates: Vec<PathBuf> = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => std::iter::once(Self::default_local_path())
                .chain(Self::default_global_path())
                .filter(|path| path.exists())
                .collect(),
        };

        let config = match candidates.first() {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration");
                Self::load_from_file(path)?
            }
            None => {
                debug!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the runtime unusable.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.pool_size == 0 {
            return Err(ConfigError::Invalid("bus.pool_size must be at least 1".to_string()));
        }
        if self.history.limit == 0 {
            return Err(ConfigError::Invalid("history.limit must be at least 1".to_string()));
        }
        if self.model.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model.name must not be empty".to_string()));
        }
        if let Some(temperature) = self.model.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::Invalid(format!(
                    "model.temperature must be between 0 and 2, got {temperature}"
                )));
            }
        }
        Ok(())
    }

    /// Renders the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(format!("Failed to serialize: {e}")))
    }
}
