//! Inbox delivery and sandbox scaffolding.

use std::path::{Path, PathBuf};

use crate::store::{Task, WorkerDefinition};

pub const INBOX_DIR: &str = "inbox";
pub const OUTPUT_DIR: &str = "output";

/// Write `task` as pretty JSON to `<sandbox>/inbox/<task-id>.json`.
pub async fn deliver(sandbox: &Path, task: &Task) -> std::io::Result<PathBuf> {
    let inbox = sandbox.join(INBOX_DIR);
    tokio::fs::create_dir_all(&inbox).await?;

    let path = inbox.join(format!("{}.json", task.id));
    let body = serde_json::to_string_pretty(task).map_err(std::io::Error::other)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// Create the inbox and output directories plus a README describing the worker.
pub async fn scaffold(sandbox: &Path, worker: &WorkerDefinition) -> std::io::Result<()> {
    tokio::fs::create_dir_all(sandbox.join(INBOX_DIR)).await?;
    tokio::fs::create_dir_all(sandbox.join(OUTPUT_DIR)).await?;

    let mut readme = format!(
        "# {} {}\n\n{}\n",
        worker.icon.as_deref().unwrap_or(""),
        worker.name,
        worker.description.as_deref().unwrap_or("")
    );
    if !worker.triggers.is_empty() {
        readme.push_str("\n## Triggers\n");
        for t in &worker.triggers {
            readme.push_str(&format!("- {t}\n"));
        }
    }
    readme.push_str(&format!("\n## Instructions\n{}\n", worker.instruction_template));
    tokio::fs::write(sandbox.join("README.md"), readme).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewTask, TaskPriority};

    #[tokio::test]
    async fn test_deliver_writes_task_json() {
        let dir = tempfile::tempdir().unwrap();
        let task = Task::new(NewTask {
            title: "Kampanya metni".to_string(),
            description: "Yeni ürün için".to_string(),
            assigned_to: "writer".to_string(),
            priority: TaskPriority::High,
            created_by: "commander".to_string(),
        });

        let path = deliver(dir.path(), &task).await.unwrap();
        assert_eq!(path, dir.path().join("inbox").join(format!("{}.json", task.id)));

        let raw = std::fs::read_to_string(path).unwrap();
        let back: Task = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, task);
        assert!(raw.contains("Kampanya metni"));
    }

    #[tokio::test]
    async fn test_scaffold_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().join("seo");
        let worker = WorkerDefinition::new("seo", "SEO")
            .with_triggers(["seo"])
            .with_instructions("You are {name}.");

        scaffold(&sandbox, &worker).await.unwrap();
        assert!(sandbox.join("inbox").is_dir());
        assert!(sandbox.join("output").is_dir());
        let readme = std::fs::read_to_string(sandbox.join("README.md")).unwrap();
        assert!(readme.contains("- seo"));
    }
}
