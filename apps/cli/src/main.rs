//! Kestrel CLI - interactive coding assistant in the terminal
//!
//! Wires a model backend, the orchestration core, the built-in tools and a
//! line-oriented front-end together over one event bus.

mod environment;
mod terminal;
mod tools;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use kestrel_abstraction::Model;
use kestrel_models::{MockModel, OllamaModel};
use kestrel_orchestrator::{EventBus, LlmModule, ModelProvider, ModelSettings, RuntimeConfig, ToolManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Kestrel - a local coding assistant
///
/// Chats with a local model that can inspect your workspace through tools.
/// Tool calls that are not auto-approved ask for confirmation first.
#[derive(Parser, Debug)]
#[command(
    name = "kestrel",
    author,
    version,
    about = "Kestrel - a local coding assistant",
    long_about = "Kestrel chats with a local model that can read files and list directories in your workspace.\nTool calls that are not auto-approved ask for confirmation first."
)]
struct Args {
    /// Configuration file (defaults to ./.kestrel.toml, then ~/.kestrel/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model name (overrides the configuration)
    #[arg(short, long)]
    model: Option<String>,

    /// Backend endpoint (overrides the configuration)
    #[arg(long)]
    endpoint: Option<String>,

    /// Workspace directory the tools operate in (defaults to the current directory)
    #[arg(short = 'w', long)]
    workspace: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error, or a RUST_LOG directive)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Use the scripted offline model instead of a real backend
    #[arg(long)]
    mock: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(ref model) = self.model {
            config.model.name = model.clone();
        }
        if let Some(ref endpoint) = self.endpoint {
            config.model.endpoint = endpoint.clone();
        }
        if self.mock {
            config.model.provider = ModelProvider::Mock;
        }
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = match args.log_level {
        Some(ref level) => EnvFilter::try_new(level).with_context(|| format!("Invalid log filter: {level}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match args.log_file {
        Some(ref path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn build_model(settings: &ModelSettings) -> Arc<dyn Model> {
    match settings.provider {
        ModelProvider::Ollama => Arc::new(OllamaModel::with_base_url(settings.name.clone(), settings.endpoint.clone())),
        ModelProvider::Mock => Arc::new(MockModel::new(settings.name.clone())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mut config =
        RuntimeConfig::discover_and_load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid command-line overrides")?;

    if args.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let workspace = match args.workspace {
        Some(ref path) => path.clone(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Workspace not found: {}", workspace.display()))?;

    info!(
        provider = %config.model.provider,
        model = %config.model.name,
        workspace = %workspace.display(),
        "Starting session"
    );

    let bus = EventBus::from_config(&config)?;

    let llm = Arc::new(LlmModule::from_config(bus.clone(), build_model(&config.model), &config).await);
    llm.subscribe()?;

    let tool_manager = Arc::new(ToolManager::new(bus.clone(), config.tools.clone(), &config.capacity));
    tool_manager.subscribe()?;

    let executor = Arc::new(tools::ToolExecutor::new(bus.clone(), workspace.clone()));
    executor.subscribe()?;
    tools::subscribe_adapter(&bus)?;
    environment::subscribe(&bus, workspace)?;

    let result = terminal::Terminal::new(bus.clone(), tool_manager)?.run().await;

    bus.close();
    info!("Session ended");
    result
}
