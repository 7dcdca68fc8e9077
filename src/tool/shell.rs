use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::RuntimeConfig;

use super::{Tool, ToolResult};

/// Resolve `user_path` relative to `target_dir`, rejecting any result that
/// escapes it. Both sides are normalized lexically first so a `..` can't
/// walk back out of `target_dir` and still pass a raw component-wise
/// `starts_with`.
fn resolve_path_under_target(target_dir: &Path, user_path: &str) -> Result<PathBuf, String> {
    let resolved = super::lexically_normalize(&target_dir.join(user_path));
    let target = super::lexically_normalize(target_dir);
    if resolved.starts_with(&target) {
        Ok(resolved)
    } else {
        Err("Access denied: path must be within the target directory.".to_string())
    }
}

/// Runs a shell command in a constrained working directory. The
/// redirection/substitution downgrade decision lives in the policy
/// engine, not here — this tool only executes what it is handed.
#[derive(Debug, Default)]
pub struct RunShellCommandTool;

#[async_trait]
impl Tool for RunShellCommandTool {
    fn name(&self) -> &str {
        "run_shell_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in a constrained working directory."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "cwd": { "type": "string", "default": "." },
                "timeout_seconds": { "type": "integer", "minimum": 1, "default": 120 },
            },
            "required": ["command"],
            "additionalProperties": false,
        })
    }

    fn validate_params(&self, args: &serde_json::Map<String, Value>) -> Option<String> {
        match args.get("command") {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            _ => return Some("`command` must be a non-empty string.".to_string()),
        }
        if let Some(cwd) = args.get("cwd") {
            match cwd {
                Value::String(s) if !s.trim().is_empty() => {}
                _ => return Some("`cwd` must be a non-empty string.".to_string()),
            }
        }
        if let Some(timeout) = args.get("timeout_seconds") {
            match timeout.as_i64() {
                Some(n) if n > 0 => {}
                _ => return Some("`timeout_seconds` must be a positive integer.".to_string()),
            }
        }
        None
    }

    async fn execute(&self, config: &RuntimeConfig, args: &serde_json::Map<String, Value>) -> ToolResult {
        if let Some(message) = self.validate_params(args) {
            return ToolResult::failed(message, Some(Value::String("Error".to_string())));
        }

        let command = args.get("command").and_then(Value::as_str).unwrap_or_default();
        let cwd_value = args.get("cwd").and_then(Value::as_str).unwrap_or(".");
        let timeout_seconds = args.get("timeout_seconds").and_then(Value::as_i64).unwrap_or(120);

        let cwd = match resolve_path_under_target(config.target_dir(), cwd_value) {
            Ok(cwd) => cwd,
            Err(message) => return ToolResult::failed(message, Some(Value::String("Error".to_string()))),
        };

        let mut child_command = Command::new("sh");
        child_command.arg("-c").arg(command).current_dir(&cwd);

        let run = async {
            child_command
                .output()
                .await
                .map_err(|e| format!("Failed to run command: {e}"))
        };

        match tokio::time::timeout(Duration::from_secs(timeout_seconds as u64), run).await {
            Err(_) => {
                let message = format!("Command timed out after {timeout_seconds} second(s).");
                ToolResult::failed(
                    message,
                    Some(serde_json::json!({
                        "command": command,
                        "cwd": cwd.display().to_string(),
                        "timed_out": true,
                        "stdout": "",
                        "stderr": "",
                        "exit_code": Value::Null,
                    })),
                )
            }
            Ok(Err(message)) => ToolResult::failed(message, Some(Value::String("Error".to_string()))),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();
                let payload = serde_json::json!({
                    "command": command,
                    "cwd": cwd.display().to_string(),
                    "timed_out": false,
                    "stdout": stdout,
                    "stderr": stderr,
                    "exit_code": exit_code,
                });
                if !output.status.success() {
                    let message = match exit_code {
                        Some(code) => format!("Command failed with exit code {code}."),
                        None => "Command failed (terminated by signal).".to_string(),
                    };
                    ToolResult::failed(message, Some(payload))
                } else {
                    ToolResult::ok(
                        format!("Command completed successfully (exit code {}).", exit_code.unwrap_or(0)),
                        Some(payload),
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_under_target_rejects_escape() {
        let target = Path::new("/tmp/workspace");
        assert!(resolve_path_under_target(target, "../outside").is_err());
        assert!(resolve_path_under_target(target, "subdir").is_ok());
    }
}
