//! Regex search across a sandbox subtree.
//!
//! The walk is blocking I/O, so it runs on the blocking pool and the session
//! awaits its result.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};

use crate::tools::sandbox::Sandbox;
use crate::tools::tool::{Tool, ToolError, optional_str, require_str};

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    ".next",
    "venv",
    ".venv",
    "target",
];

/// Files larger than this are not searched.
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

impl Sandbox {
    /// Case-insensitive regex search under `path_str`, optionally filtered by a file-name glob.
    pub async fn search(
        &self,
        pattern: &str,
        path_str: &str,
        glob_filter: Option<&str>,
    ) -> Result<String, ToolError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ToolError::InvalidPattern(format!("regex '{pattern}': {e}")))?;
        let glob = glob_filter
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::InvalidPattern(format!("glob: {e}")))?;

        let dir = self.resolve(path_str)?;
        if !dir.exists() {
            return Err(ToolError::NotFound(format!("Path not found: {path_str}")));
        }

        let root = self.root().to_path_buf();
        let max_matches = self.limits().max_search_matches;
        let preview_chars = self.limits().search_preview_chars;

        let (matches, capped) = tokio::task::spawn_blocking(move || {
            walk_and_match(&root, &dir, &regex, glob.as_ref(), max_matches, preview_chars)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("Search task failed: {e}")))?;

        if matches.is_empty() {
            return Ok(format!("(no matches for '{pattern}')"));
        }

        let mut out = matches.join("\n");
        if capped {
            out.push_str(&format!("\n(results capped at {max_matches} matches)"));
        }
        Ok(out)
    }
}

fn walk_and_match(
    root: &Path,
    dir: &Path,
    regex: &Regex,
    glob: Option<&glob::Pattern>,
    max_matches: usize,
    preview_chars: usize,
) -> (Vec<String>, bool) {
    let mut matches = Vec::new();

    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
        })
        .filter_map(|e| e.ok());

    for entry in walker {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(pattern) = glob
            && !pattern.matches(&entry.file_name().to_string_lossy())
        {
            continue;
        }
        if entry
            .metadata()
            .map(|m| m.len() > MAX_SEARCH_FILE_BYTES)
            .unwrap_or(true)
        {
            continue;
        }

        // Binary and non-UTF-8 files are skipped.
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .display()
            .to_string();

        for (idx, line) in content.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if matches.len() >= max_matches {
                return (matches, true);
            }
            let preview: String = line.trim().chars().take(preview_chars).collect();
            matches.push(format!("{}:{}: {}", rel, idx + 1, preview));
        }
    }

    (matches, false)
}

/// `search_code` tool.
pub struct SearchCodeTool {
    sandbox: Arc<Sandbox>,
}

impl SearchCodeTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for SearchCodeTool {
    fn name(&self) -> &str {
        "search_code"
    }

    fn description(&self) -> &str {
        "Search file contents in your workspace with a case-insensitive regular expression. \
         Returns matching lines as path:line: text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search, relative to the workspace root (default \".\")"
                },
                "glob": {
                    "type": "string",
                    "description": "Only search files whose name matches this glob, e.g. \"*.rs\""
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String, ToolError> {
        let pattern = require_str(&params, "pattern")?;
        let path = optional_str(&params, "path").unwrap_or(".");
        let glob = optional_str(&params, "glob");
        self.sandbox.search(pattern, path, glob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxLimits;

    async fn seeded() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sb = Sandbox::new(dir.path().join("ws"), SandboxLimits::default()).unwrap();
        sb.write("src/main.rs", "fn main() {\n    println!(\"Hello\");\n}\n")
            .await
            .unwrap();
        sb.write("notes.md", "hello from notes\n").await.unwrap();
        sb.write("node_modules/pkg/index.js", "hello hidden\n")
            .await
            .unwrap();
        (dir, sb)
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_skips_vendor_dirs() {
        let (_dir, sb) = seeded().await;
        let out = sb.search("HELLO", ".", None).await.unwrap();

        assert!(out.contains("notes.md:1: hello from notes"));
        assert!(out.contains("src/main.rs:2: println!(\"Hello\");"));
        assert!(!out.contains("node_modules"));
    }

    #[tokio::test]
    async fn test_search_glob_filter() {
        let (_dir, sb) = seeded().await;
        let out = sb.search("hello", ".", Some("*.rs")).await.unwrap();
        assert!(out.contains("src/main.rs"));
        assert!(!out.contains("notes.md"));
    }

    #[tokio::test]
    async fn test_search_invalid_regex_is_tagged_error() {
        let (_dir, sb) = seeded().await;
        let err = sb.search("([unclosed", ".", None).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidPattern(_)));
        assert!(err.to_tool_result().starts_with("ERROR: Invalid pattern"));
    }

    #[tokio::test]
    async fn test_search_cap_and_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        let limits = SandboxLimits {
            max_search_matches: 3,
            ..SandboxLimits::default()
        };
        let sb = Sandbox::new(dir.path(), limits).unwrap();
        sb.write("many.txt", &"match\n".repeat(10)).await.unwrap();

        let out = sb.search("match", ".", None).await.unwrap();
        assert_eq!(out.lines().filter(|l| l.starts_with("many.txt:")).count(), 3);
        assert!(out.ends_with("(results capped at 3 matches)"));

        assert_eq!(
            sb.search("absent", ".", None).await.unwrap(),
            "(no matches for 'absent')"
        );
    }

    #[tokio::test]
    async fn test_search_outside_root_is_rejected() {
        let (_dir, sb) = seeded().await;
        assert!(matches!(
            sb.search("root", "../..", None).await,
            Err(ToolError::PathEscape(_))
        ));
    }
}
