//! File operation tools: read, write and list inside a sandbox.
//!
//! Size ceilings are enforced in both directions; content above the ceiling
//! is rejected with a size error rather than silently truncated.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use crate::tools::sandbox::Sandbox;
use crate::tools::tool::{Tool, ToolError, optional_str, require_str};

impl Sandbox {
    /// Read a whole file as text (invalid UTF-8 is replaced).
    pub async fn read(&self, path_str: &str) -> Result<String, ToolError> {
        let path = self.resolve(path_str)?;

        let metadata = fs::metadata(&path)
            .await
            .map_err(|_| ToolError::NotFound(format!("File not found: {path_str}")))?;
        if !metadata.is_file() {
            return Err(ToolError::ExecutionFailed(format!(
                "Not a file: {path_str}"
            )));
        }

        let max = self.limits().max_file_bytes;
        if metadata.len() > max {
            return Err(ToolError::TooLarge {
                what: format!("File {path_str}"),
                size: metadata.len(),
                max,
            });
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to read {path_str}: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write `content`, creating parent directories.
    pub async fn write(&self, path_str: &str, content: &str) -> Result<String, ToolError> {
        let max = self.limits().max_file_bytes;
        if content.len() as u64 > max {
            return Err(ToolError::TooLarge {
                what: "Content".to_string(),
                size: content.len() as u64,
                max,
            });
        }

        let path = self.resolve(path_str)?;
        if path.as_path() == self.root() || path.is_dir() {
            return Err(ToolError::ExecutionFailed(format!(
                "Cannot write to a directory: {path_str}"
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!("Failed to create directories: {e}"))
            })?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write {path_str}: {e}")))?;

        Ok(format!(
            "OK: Wrote {} chars ({} bytes) to {}",
            content.chars().count(),
            content.len(),
            self.display_path(&path)
        ))
    }

    /// List the immediate entries of a directory, sorted by name.
    pub async fn list(&self, path_str: &str) -> Result<String, ToolError> {
        let path = self.resolve(path_str)?;
        let shown = self.display_path(&path);

        let metadata = fs::metadata(&path)
            .await
            .map_err(|_| ToolError::NotFound(format!("Directory not found: {shown}")))?;
        if !metadata.is_dir() {
            return Err(ToolError::ExecutionFailed(format!("Not a directory: {shown}")));
        }

        let mut reader = fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to list {shown}: {e}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to list {shown}: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let line = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => format!("{name}/"),
                Ok(ft) if ft.is_symlink() => format!("{name}@"),
                _ => {
                    let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                    format!("{name} ({size} bytes)")
                }
            };
            entries.push((name, line));
        }

        if entries.is_empty() {
            return Ok(format!("(empty directory: {shown})"));
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let total = entries.len();
        let cap = self.limits().max_list_entries;

        let mut lines: Vec<String> = entries.into_iter().take(cap).map(|(_, l)| l).collect();
        if total > cap {
            lines.push(format!("... ({} more entries not shown)", total - cap));
        }
        Ok(lines.join("\n"))
    }
}

// ── ReadFileTool ────────────────────────────────────────────────────

/// Read a file inside the sandbox.
pub struct ReadFileTool {
    sandbox: Arc<Sandbox>,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in your workspace. Paths are relative to the workspace root."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String, ToolError> {
        let path = require_str(&params, "path")?;
        self.sandbox.read(path).await
    }
}

// ── WriteFileTool ───────────────────────────────────────────────────

/// Create or overwrite a file inside the sandbox.
pub struct WriteFileTool {
    sandbox: Arc<Sandbox>,
}

impl WriteFileTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in your workspace. Parent directories are created as needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Full content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String, ToolError> {
        let path = require_str(&params, "path")?;
        let content = require_str(&params, "content")?;
        self.sandbox.write(path, content).await
    }
}

// ── ListDirectoryTool ───────────────────────────────────────────────

/// List a directory inside the sandbox.
pub struct ListDirectoryTool {
    sandbox: Arc<Sandbox>,
}

impl ListDirectoryTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories at a path in your workspace. Defaults to the workspace root."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, relative to the workspace root (default \".\")"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String, ToolError> {
        let path = optional_str(&params, "path").unwrap_or(".");
        self.sandbox.list(path).await
    }
}
