//! Shell execution inside a sandbox.
//!
//! Provides controlled command execution with:
//! - Blocked command patterns, checked before anything is spawned
//! - The sandbox root as working directory
//! - Hard timeout enforcement (the child is killed when it expires)
//! - Output capture and truncation

use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{RegexSet, RegexSetBuilder};
use tokio::process::Command;

use crate::tools::sandbox::Sandbox;
use crate::tools::tool::{Tool, ToolError, require_str};

/// Commands that are never run: destructive filesystem operations,
/// privilege escalation, shutdown/reboot and disk formatting.
const BLOCKED_PATTERNS: &[&str] = &[
    r"rm\s+-[a-z]*r[a-z]*f[a-z]*\s+/",
    r"rm\s+-[a-z]*f[a-z]*r[a-z]*\s+/",
    r"\bsudo\b",
    r"\bdoas\b",
    r"\bsu\s+-",
    r"\bmkfs",
    r"\bdd\s+if=",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bpoweroff\b",
    r"\bhalt\b",
    r"\binit\s+[06]\b",
    r"\bformat\b\s+[a-z]:",
    r"\bdel\s+/[sfq]",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r">\s*/dev/sd[a-z]",
    r"\bchmod\s+(-r\s+)?777\s+/\s*$",
];

/// Compiled, case-insensitive blocked-pattern set.
static BLOCKED: LazyLock<Result<RegexSet, regex::Error>> = LazyLock::new(|| {
    RegexSetBuilder::new(BLOCKED_PATTERNS)
        .case_insensitive(true)
        .build()
});

/// Return the first blocked pattern a command matches.
///
/// Fails closed: if the pattern set could not be compiled every command is blocked.
pub fn blocked_pattern(command: &str) -> Option<&'static str> {
    match BLOCKED.as_ref() {
        Ok(set) => set
            .matches(command)
            .iter()
            .next()
            .map(|idx| BLOCKED_PATTERNS[idx]),
        Err(_) => Some("blocked-pattern set unavailable"),
    }
}

impl Sandbox {
    /// Run `command` with `sh -c` in the sandbox root.
    pub async fn execute(&self, command: &str) -> Result<String, ToolError> {
        if let Some(pattern) = blocked_pattern(command) {
            tracing::warn!(pattern, "Blocked command: {}", truncate_for_error(command));
            return Err(ToolError::Blocked(truncate_for_error(command)));
        }

        let limits = self.limits();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to spawn command: {e}")))?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(limits.command_timeout, child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed(format!(
                    "Command execution failed: {e}"
                )));
            }
            Err(_) => return Err(ToolError::Timeout(limits.command_timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut result = truncate_chars(&stdout, limits.max_output_chars);
        if !stderr.trim().is_empty() {
            if !result.is_empty() && !result.ends_with('\n') {
                result.push('\n');
            }
            result.push_str("STDERR: ");
            result.push_str(&truncate_chars(&stderr, limits.max_stderr_chars));
        }
        match output.status.code() {
            Some(0) => {}
            Some(code) => {
                if !result.is_empty() && !result.ends_with('\n') {
                    result.push('\n');
                }
                result.push_str(&format!("(exit code: {code})"));
            }
            None => {
                if !result.is_empty() && !result.ends_with('\n') {
                    result.push('\n');
                }
                result.push_str("(terminated by signal)");
            }
        }

        if result.trim().is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(result)
    }
}

/// Keep at most `max` characters, signalling how much was dropped.
fn truncate_chars(s: &str, max: usize) -> String {
    let total = s.chars().count();
    if total <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max).collect();
    format!("{kept}\n... (truncated, {total} chars total)")
}

/// Truncate command for error messages.
fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}

/// `run_command` tool.
pub struct RunCommandTool {
    sandbox: Arc<Sandbox>,
}

impl RunCommandTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in your workspace directory. Commands have a timeout and \
         destructive or privileged commands are refused."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String, ToolError> {
        let command = require_str(&params, "command")?;
        self.sandbox.execute(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxLimits;
    use std::time::Duration;

    fn sandbox(limits: SandboxLimits) -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sb = Sandbox::new(dir.path().join("ws"), limits).unwrap();
        (dir, sb)
    }

    #[test]
    fn test_blocked_commands() {
        assert!(blocked_pattern("rm -rf /").is_some());
        assert!(blocked_pattern("rm -fr /home").is_some());
        assert!(blocked_pattern("sudo apt install x").is_some());
        assert!(blocked_pattern("SUDO reboot").is_some());
        assert!(blocked_pattern("mkfs.ext4 /dev/sdb1").is_some());
        assert!(blocked_pattern("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(blocked_pattern("shutdown -h now").is_some());
        assert!(blocked_pattern("format C:").is_some());
        assert!(blocked_pattern("del /s /q C:\\").is_some());
        assert!(blocked_pattern(":(){ :|:& };:").is_some());

        assert!(blocked_pattern("echo hello").is_none());
        assert!(blocked_pattern("rm -rf build").is_none());
        assert!(blocked_pattern("cargo build").is_none());
        assert!(blocked_pattern("ls -la").is_none());
    }

    #[tokio::test]
    async fn test_blocked_command_has_no_side_effect() {
        let (_dir, sb) = sandbox(SandboxLimits::default());
        let err = sb.execute("sudo touch marker").await.unwrap_err();

        assert!(matches!(err, ToolError::Blocked(_)));
        assert!(!sb.root().join("marker").exists());
    }

    #[tokio::test]
    async fn test_echo_runs_in_sandbox_root() {
        let (_dir, sb) = sandbox(SandboxLimits::default());
        let out = sb.execute("echo hello && touch created.txt").await.unwrap();
        assert_eq!(out.trim(), "hello");
        assert!(sb.root().join("created.txt").exists());
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr_are_reported() {
        let (_dir, sb) = sandbox(SandboxLimits::default());
        let out = sb.execute("echo oops >&2; exit 3").await.unwrap();
        assert!(out.contains("STDERR: oops"));
        assert!(out.ends_with("(exit code: 3)"));
    }

    #[tokio::test]
    async fn test_no_output() {
        let (_dir, sb) = sandbox(SandboxLimits::default());
        assert_eq!(sb.execute("true").await.unwrap(), "(no output)");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let (_dir, sb) = sandbox(SandboxLimits {
            command_timeout: Duration::from_millis(200),
            ..SandboxLimits::default()
        });
        let started = std::time::Instant::now();
        let result = sb.execute("sleep 10").await;

        assert!(matches!(result, Err(ToolError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let (_dir, sb) = sandbox(SandboxLimits {
            max_output_chars: 10,
            ..SandboxLimits::default()
        });
        let out = sb.execute("printf 'abcdefghijklmnopqrstuvwxyz'").await.unwrap();
        assert!(out.starts_with("abcdefghij\n"));
        assert!(out.contains("truncated, 26 chars total"));
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("short", 10), "short");
        let s = "çalışma".repeat(3);
        let out = truncate_chars(&s, 4);
        assert!(out.starts_with("çalı\n"));
    }
}
