//! Fixed tool catalog bound to one sandbox.

use std::sync::Arc;

use crate::llm::ToolDefinition;
use crate::tools::builtin::{
    ListDirectoryTool, ReadFileTool, RunCommandTool, SearchCodeTool, WriteFileTool,
};
use crate::tools::sandbox::Sandbox;
use crate::tools::tool::{Tool, ToolError};

/// The tools a session may call, in catalog order.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// The standard catalog: read_file, write_file, list_directory, search_code, run_command.
    pub fn for_sandbox(sandbox: Arc<Sandbox>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReadFileTool::new(sandbox.clone())));
        registry.register(Arc::new(WriteFileTool::new(sandbox.clone())));
        registry.register(Arc::new(ListDirectoryTool::new(sandbox.clone())));
        registry.register(Arc::new(SearchCodeTool::new(sandbox.clone())));
        registry.register(Arc::new(RunCommandTool::new(sandbox)));
        registry
    }

    /// Register a tool, replacing any tool with the same name in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Some(slot) = self.tools.iter_mut().find(|t| t.name() == name) {
            *slot = tool;
        } else {
            self.tools.push(tool);
        }
        tracing::debug!("Registered tool: {}", name);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// List all tool names in catalog order.
    pub fn list(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Tool definitions for LLM function calling.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// Run a tool call and render the outcome as the tool-result payload.
    ///
    /// Never fails: unknown tools and tool errors come back as `ERROR:` strings.
    pub async fn execute(&self, name: &str, params: serde_json::Value) -> String {
        let Some(tool) = self.get(name) else {
            return ToolError::UnknownTool(name.to_string()).to_tool_result();
        };
        match tool.execute(params).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(tool = name, error = %e, "Tool call failed");
                e.to_tool_result()
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxLimits;
    use async_trait::async_trait;

    struct MockTool {
        name: String,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A mock tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _params: serde_json::Value) -> Result<String, ToolError> {
            Ok("mock".to_string())
        }
    }

    fn registry() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path(), SandboxLimits::default()).unwrap();
        (dir, ToolRegistry::for_sandbox(Arc::new(sandbox)))
    }

    #[test]
    fn test_standard_catalog_order() {
        let (_dir, registry) = registry();
        assert_eq!(
            registry.list(),
            vec![
                "read_file",
                "write_file",
                "list_directory",
                "search_code",
                "run_command"
            ]
        );
        let defs = registry.tool_definitions();
        assert_eq!(defs.len(), 5);
        assert_eq!(defs[4].parameters["required"][0], "command");
    }

    #[test]
    fn test_register_replaces_in_place() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool { name: "a".to_string() }));
        registry.register(Arc::new(MockTool { name: "b".to_string() }));
        registry.register(Arc::new(MockTool { name: "a".to_string() }));
        assert_eq!(registry.list(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failures_become_tagged_strings() {
        let (_dir, registry) = registry();

        let unknown = registry.execute("delete_everything", serde_json::json!({})).await;
        assert_eq!(unknown, "ERROR: Unknown tool: delete_everything");

        let escape = registry
            .execute("read_file", serde_json::json!({"path": "../../etc/passwd"}))
            .await;
        assert!(escape.starts_with("ERROR: Path escapes sandbox"));

        let blocked = registry
            .execute("run_command", serde_json::json!({"command": "sudo ls"}))
            .await;
        assert!(blocked.starts_with("ERROR: Command blocked"));

        let missing = registry.execute("write_file", serde_json::json!({})).await;
        assert!(missing.starts_with("ERROR: Invalid parameters"));
    }

    #[tokio::test]
    async fn test_success_passes_output_through() {
        let (_dir, registry) = registry();
        let out = registry
            .execute(
                "write_file",
                serde_json::json!({"path": "a.txt", "content": "hi"}),
            )
            .await;
        assert!(out.starts_with("OK: Wrote 2 chars"));
        assert_eq!(
            registry
                .execute("read_file", serde_json::json!({"path": "a.txt"}))
                .await,
            "hi"
        );
    }
}
