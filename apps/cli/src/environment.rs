//! Environment probe answering snapshot requests.

use std::path::{Path, PathBuf};

use chrono::Local;
use kestrel_orchestrator::event::EnvironmentUpdate;
use kestrel_orchestrator::{ComponentTag, Event, EventBus};
use tracing::debug;

/// Top-level entries listed in a snapshot.
const MAX_ENTRIES: usize = 40;

/// Subscribes the probe for `workspace`.
pub fn subscribe(bus: &EventBus, workspace: PathBuf) -> kestrel_orchestrator::Result<()> {
    bus.ensure_open()?;
    let publisher = bus.clone();
    bus.environment_request.subscribe(ComponentTag::Environment, move |event| {
        let bus = publisher.clone();
        let workspace = workspace.clone();
        async move {
            let environment = snapshot(&workspace).await;
            debug!(request_id = %event.data.request_id, bytes = environment.len(), "Environment snapshot taken");
            bus.environment_update.publish(Event::new(
                ComponentTag::Environment,
                EnvironmentUpdate { create_id: event.data.create_id, environment },
            ));
        }
    });
    Ok(())
}

/// Describes the workspace and host for the model.
pub async fn snapshot(workspace: &Path) -> String {
    let mut lines = vec![
        format!("Working directory: {}", workspace.display()),
        format!("Operating system: {} ({})", std::env::consts::OS, std::env::consts::ARCH),
        format!("Local time: {}", Local::now().format("%Y-%m-%d %H:%M:%S %Z")),
    ];

    match top_level_entries(workspace).await {
        Ok((entries, total)) => {
            lines.push(format!("Top-level entries ({total}):"));
            lines.extend(entries.into_iter().map(|entry| format!("  {entry}")));
            if total > MAX_ENTRIES {
                lines.push(format!("  ... {} more", total - MAX_ENTRIES));
            }
        }
        Err(err) => lines.push(format!("Top-level entries unavailable: {err}")),
    }

    lines.join("\n")
}

async fn top_level_entries(workspace: &Path) -> std::io::Result<(Vec<String>, usize)> {
    let mut reader = tokio::fs::read_dir(workspace).await?;
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
    entries.truncate(MAX_ENTRIES);
    Ok((entries, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_lists_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let text = snapshot(dir.path()).await;
        assert!(text.contains("Working directory:"));
        assert!(text.contains(std::env::consts::OS));
        assert!(text.contains("Top-level entries (2):"));
        assert!(text.contains("  Cargo.toml\n  src/"));
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_directory() {
        let dir = TempDir::new().unwrap();
        let text = snapshot(&dir.path().join("gone")).await;
        assert!(text.contains("Top-level entries unavailable"));
    }

    #[tokio::test]
    async fn test_snapshot_caps_entries() {
        let dir = TempDir::new().unwrap();
        for i in 0..(MAX_ENTRIES + 5) {
            std::fs::write(dir.path().join(format!("f{i:03}")), "").unwrap();
        }
        let text = snapshot(dir.path()).await;
        assert!(text.contains("... 5 more"));
    }
}
