//! Built-in tools and the executor that runs them on approval.
//!
//! The executor remembers every tool call it sees, runs it once it is
//! approved (automatically or by the user), and publishes the raw output.
//! The adapter turns raw output into the text fed back to the model.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use kestrel_abstraction::ToolDefinition;
use kestrel_orchestrator::event::{
    Decision, RawToolOutput, ToolCallEvent, ToolListUpdate, ToolRawResult, ToolResultEvent,
    UserDecision,
};
use kestrel_orchestrator::{ComponentTag, Event, EventBus, ToolCallId};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Largest file `read_file` returns in full.
const MAX_READ_BYTES: usize = 64 * 1024;

/// Directory listings are cut after this many entries.
const MAX_LIST_ENTRIES: usize = 500;

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListDirectoryArgs {
    #[serde(default)]
    path: Option<String>,
}

/// Definitions advertised to the model.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "read_file",
            "Read a UTF-8 text file from the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path relative to the workspace root" }
                },
                "required": ["path"]
            }),
        ),
        ToolDefinition::new(
            "list_directory",
            "List the entries of a workspace directory. Directories end with '/'.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory relative to the workspace root (default: root)" }
                }
            }),
        ),
    ]
}

/// Runs approved tool calls inside one workspace directory.
#[derive(Debug)]
pub struct ToolExecutor {
    bus: EventBus,
    workspace: PathBuf,
    calls: Mutex<HashMap<ToolCallId, ToolCallEvent>>,
}

impl ToolExecutor {
    /// Creates an executor confined to `workspace`.
    pub fn new(bus: EventBus, workspace: PathBuf) -> Self {
        Self { bus, workspace, calls: Mutex::new(HashMap::new()) }
    }

    /// Subscribes the executor to tool calls, approvals, decisions and tool list requests.
    pub fn subscribe(self: &Arc<Self>) -> kestrel_orchestrator::Result<()> {
        self.bus.ensure_open()?;

        let executor = Arc::clone(self);
        self.bus.tool_call.subscribe(ComponentTag::ToolExecutor, move |event| {
            let executor = Arc::clone(&executor);
            async move {
                let call = event.data;
                executor.calls.lock().await.insert(call.tool_call_id, call);
            }
        });

        let executor = Arc::clone(self);
        self.bus.accept_tool.subscribe(ComponentTag::ToolExecutor, move |event| {
            let executor = Arc::clone(&executor);
            async move {
                // The tool-call dispatch for this id already ran in this lane.
                executor.calls.lock().await.remove(&event.data.tool_call_id);
                executor.execute(event.data).await;
            }
        });

        let executor = Arc::clone(self);
        self.bus.user_decision.subscribe(ComponentTag::ToolExecutor, move |event| {
            let executor = Arc::clone(&executor);
            async move { executor.on_decision(event.data).await }
        });

        let bus = self.bus.clone();
        self.bus.tool_list_request.subscribe(ComponentTag::ToolExecutor, move |event| {
            let bus = bus.clone();
            async move {
                bus.tool_list_update.publish(Event::new(
                    ComponentTag::ToolExecutor,
                    ToolListUpdate { create_id: event.data.create_id, tools: definitions() },
                ));
            }
        });

        Ok(())
    }

    async fn on_decision(&self, decision: UserDecision) {
        let Some(call) = self.calls.lock().await.remove(&decision.tool_call_id) else {
            warn!(tool_call_id = %decision.tool_call_id, "Decision for unknown tool call");
            return;
        };

        match decision.decision {
            Decision::Accept => self.execute(call).await,
            Decision::Reject => {
                info!(tool = %call.tool_name, tool_call_id = %call.tool_call_id, "Tool call rejected");
                self.publish(&call, RawToolOutput { is_error: true, content: "rejected by user".to_string() });
            }
        }
    }

    async fn execute(&self, call: ToolCallEvent) {
        debug!(tool = %call.tool_name, tool_call_id = %call.tool_call_id, "Executing tool");
        let output = match run_tool(&self.workspace, &call.tool_name, &call.parameters).await {
            Ok(content) => RawToolOutput { is_error: false, content },
            Err(err) => {
                warn!(tool = %call.tool_name, error = %err, "Tool failed");
                RawToolOutput { is_error: true, content: format!("{err:#}") }
            }
        };
        self.publish(&call, output);
    }

    fn publish(&self, call: &ToolCallEvent, result: RawToolOutput) {
        self.bus.tool_raw_result.publish(Event::new(
            ComponentTag::ToolExecutor,
            ToolRawResult { request_id: call.request_id, tool_call_id: call.tool_call_id, result },
        ));
    }
}

/// Republishes raw tool output as model-facing tool results.
pub fn subscribe_adapter(bus: &EventBus) -> kestrel_orchestrator::Result<()> {
    bus.ensure_open()?;
    let publisher = bus.clone();
    bus.tool_raw_result.subscribe(ComponentTag::ToolAdapter, move |event| {
        let bus = publisher.clone();
        async move {
            let raw = event.data;
            bus.tool_result.publish(Event::new(
                ComponentTag::ToolAdapter,
                ToolResultEvent {
                    request_id: raw.request_id,
                    tool_call_id: raw.tool_call_id,
                    tool_result: normalize(&raw.result),
                },
            ));
        }
    });
    Ok(())
}

/// Text the model sees for a raw tool output.
pub fn normalize(output: &RawToolOutput) -> String {
    if output.is_error { format!("Error: {}", output.content) } else { output.content.clone() }
}

async fn run_tool(workspace: &Path, name: &str, parameters: &Map<String, Value>) -> Result<String> {
    let arguments = Value::Object(parameters.clone());
    match name {
        "read_file" => {
            let args: ReadFileArgs =
                serde_json::from_value(arguments).context("read_file requires a string 'path' argument")?;
            read_file(workspace, &args.path).await
        }
        "list_directory" => {
            let args: ListDirectoryArgs =
                serde_json::from_value(arguments).context("invalid list_directory arguments")?;
            list_directory(workspace, args.path.as_deref().unwrap_or(".")).await
        }
        other => bail!("unknown tool: {other}"),
    }
}

/// Resolves `relative` inside `workspace`, refusing anything that escapes it.
fn resolve(workspace: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        bail!("path must be relative to the workspace: {relative}");
    }

    let mut resolved = workspace.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if resolved == workspace || !resolved.pop() {
                    bail!("path escapes the workspace: {relative}");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("path must be relative to the workspace: {relative}");
            }
        }
    }
    Ok(resolved)
}

async fn read_file(workspace: &Path, relative: &str) -> Result<String> {
    let path = resolve(workspace, relative)?;
    let bytes = tokio::fs::read(&path).await.with_context(|| format!("cannot read {relative}"))?;

    let truncated = bytes.len() > MAX_READ_BYTES;
    let slice = if truncated { &bytes[..MAX_READ_BYTES] } else { &bytes[..] };
    let mut content = String::from_utf8_lossy(slice).into_owned();
    if truncated {
        content.push_str(&format!("\n[truncated at {MAX_READ_BYTES} of {} bytes]", bytes.len()));
    }
    Ok(content)
}

async fn list_directory(workspace: &Path, relative: &str) -> Result<String> {
    let path = resolve(workspace, relative)?;
    let mut reader = tokio::fs::read_dir(&path).await.with_context(|| format!("cannot list {relative}"))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();

    let total = entries.len();
    entries.truncate(MAX_LIST_ENTRIES);
    let mut listing = entries.join("\n");
    if total > MAX_LIST_ENTRIES {
        listing.push_str(&format!("\n[{} more entries]", total - MAX_LIST_ENTRIES));
    }
    if listing.is_empty() {
        listing.push_str("(empty directory)");
    }
    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_orchestrator::RequestId;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_read_and_list() {
        let dir = workspace();

        let content = run_tool(dir.path(), "read_file", &args(json!({ "path": "notes.txt" }))).await.unwrap();
        assert_eq!(content, "hello");

        let listing = run_tool(dir.path(), "list_directory", &Map::new()).await.unwrap();
        assert_eq!(listing, "notes.txt\nsrc/");

        let listing = run_tool(dir.path(), "list_directory", &args(json!({ "path": "src" }))).await.unwrap();
        assert_eq!(listing, "(empty directory)");
    }

    #[tokio::test]
    async fn test_bad_calls_are_errors() {
        let dir = workspace();
        assert!(run_tool(dir.path(), "read_file", &Map::new()).await.is_err());
        assert!(run_tool(dir.path(), "delete_everything", &Map::new()).await.is_err());
        assert!(run_tool(dir.path(), "read_file", &args(json!({ "path": "missing.txt" }))).await.is_err());
    }

    #[test]
    fn test_resolve_stays_inside_workspace() {
        let root = Path::new("/work");
        assert_eq!(resolve(root, "src/../notes.txt").unwrap(), PathBuf::from("/work/notes.txt"));
        assert_eq!(resolve(root, "./src").unwrap(), PathBuf::from("/work/src"));
        assert!(resolve(root, "../etc/passwd").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
    }

    #[test]
    fn test_normalize_prefixes_errors() {
        let ok = RawToolOutput { is_error: false, content: "data".to_string() };
        let err = RawToolOutput { is_error: true, content: "rejected by user".to_string() };
        assert_eq!(normalize(&ok), "data");
        assert_eq!(normalize(&err), "Error: rejected by user");
    }

    #[tokio::test]
    async fn test_rejection_produces_error_result() {
        let dir = workspace();
        let bus = EventBus::new(2).unwrap();
        let executor = Arc::new(ToolExecutor::new(bus.clone(), dir.path().to_path_buf()));
        executor.subscribe().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.tool_raw_result.subscribe(ComponentTag::Ui, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.data);
            }
        });

        let call = ToolCallEvent {
            request_id: RequestId::new(),
            tool_call_id: ToolCallId::new(),
            tool_name: "read_file".to_string(),
            parameters: args(json!({ "path": "notes.txt" })),
        };
        executor.calls.lock().await.insert(call.tool_call_id, call.clone());
        bus.user_decision.publish(Event::new(
            ComponentTag::ToolManager,
            UserDecision { request_id: call.request_id, tool_call_id: call.tool_call_id, decision: Decision::Reject },
        ));

        let raw = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(raw.result.is_error);
        assert_eq!(raw.result.content, "rejected by user");
    }

    #[tokio::test]
    async fn test_accept_tool_runs_call() {
        let dir = workspace();
        let bus = EventBus::new(2).unwrap();
        let executor = Arc::new(ToolExecutor::new(bus.clone(), dir.path().to_path_buf()));
        executor.subscribe().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.tool_raw_result.subscribe(ComponentTag::Ui, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.data);
            }
        });

        let call = ToolCallEvent {
            request_id: RequestId::new(),
            tool_call_id: ToolCallId::new(),
            tool_name: "read_file".to_string(),
            parameters: args(json!({ "path": "notes.txt" })),
        };
        bus.accept_tool.publish(Event::new(ComponentTag::ToolManager, call));

        let raw = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(!raw.result.is_error);
        assert_eq!(raw.result.content, "hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_auto_approved_calls_are_not_retained() {
        let dir = workspace();
        let bus = EventBus::new(8).unwrap();
        let executor = Arc::new(ToolExecutor::new(bus.clone(), dir.path().to_path_buf()));
        executor.subscribe().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.tool_raw_result.subscribe(ComponentTag::Ui, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.data.tool_call_id);
            }
        });

        for _ in 0..50 {
            let call = ToolCallEvent {
                request_id: RequestId::new(),
                tool_call_id: ToolCallId::new(),
                tool_name: "list_directory".to_string(),
                parameters: Map::new(),
            };
            bus.tool_call.publish(Event::new(ComponentTag::Llm, call.clone()));
            bus.accept_tool.publish(Event::new(ComponentTag::ToolManager, call));
        }

        for _ in 0..50 {
            timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        }
        assert!(executor.calls.lock().await.is_empty());
    }
}
