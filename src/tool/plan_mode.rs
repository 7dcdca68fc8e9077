use async_trait::async_trait;
use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::types::ApprovalMode;

use super::{Tool, ToolResult};

fn is_subpath(parent: &std::path::Path, child: &std::path::Path) -> bool {
    child.strip_prefix(parent).is_ok()
}

fn validate_plan_path(
    plan_path: &str,
    plans_dir: &std::path::Path,
    target_dir: &std::path::Path,
) -> Result<std::path::PathBuf, String> {
    let resolved = super::lexically_normalize(&target_dir.join(plan_path));
    let plans_dir = super::lexically_normalize(plans_dir);
    if !is_subpath(&plans_dir, &resolved) {
        return Err("Access denied: plan path must be within the designated plans directory.".to_string());
    }
    if !resolved.is_file() {
        return Err(format!("Plan file does not exist: {plan_path}."));
    }
    Ok(resolved)
}

fn validate_plan_content(plan_path: &std::path::Path) -> Result<(), String> {
    if !plan_path.exists() {
        return Err("Plan file is empty. You must write content before requesting approval.".to_string());
    }
    match std::fs::read_to_string(plan_path) {
        Ok(content) if content.trim().is_empty() => {
            Err("Plan file is empty. You must write content before requesting approval.".to_string())
        }
        Ok(_) => Ok(()),
        Err(e) => Err(format!("Failed to read plan file: {e}")),
    }
}

/// Switches the running agent into Plan mode, where destructive tools are
/// held back until a plan is drafted and approved.
#[derive(Debug, Default)]
pub struct EnterPlanModeTool;

#[async_trait]
impl Tool for EnterPlanModeTool {
    fn name(&self) -> &str {
        "enter_plan_mode"
    }

    fn description(&self) -> &str {
        "Switch to Plan Mode for safe analysis and plan drafting."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "reason": { "type": "string" } },
            "required": [],
            "additionalProperties": false,
        })
    }

    async fn execute(&self, config: &RuntimeConfig, args: &serde_json::Map<String, Value>) -> ToolResult {
        let reason = args.get("reason").and_then(Value::as_str).unwrap_or("").trim();
        config.set_approval_mode(ApprovalMode::Plan).await;
        let message = if reason.is_empty() {
            "Switching to Plan mode.".to_string()
        } else {
            format!("Switching to Plan mode: {reason}")
        };
        ToolResult::ok(message.clone(), Some(Value::String(message)))
    }
}

/// Requests approval of a drafted plan and, if approved, exits Plan mode
/// into either Default or Auto-Edit mode.
#[derive(Debug, Default)]
pub struct ExitPlanModeTool;

#[async_trait]
impl Tool for ExitPlanModeTool {
    fn name(&self) -> &str {
        "exit_plan_mode"
    }

    fn description(&self) -> &str {
        "Request plan approval and exit Plan Mode."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "plan_path": { "type": "string" },
                "approved": { "type": "boolean", "default": true },
                "feedback": { "type": "string" },
                "approval_mode": { "type": "string" },
            },
            "required": ["plan_path"],
            "additionalProperties": false,
        })
    }

    fn validate_params(&self, args: &serde_json::Map<String, Value>) -> Option<String> {
        match args.get("plan_path") {
            Some(Value::String(s)) if !s.trim().is_empty() => None,
            _ => Some("plan_path is required.".to_string()),
        }
    }

    async fn execute(&self, config: &RuntimeConfig, args: &serde_json::Map<String, Value>) -> ToolResult {
        if let Some(message) = self.validate_params(args) {
            return ToolResult::failed(message, Some(Value::String("Error".to_string())));
        }

        let plan_path = args.get("plan_path").and_then(Value::as_str).unwrap_or_default();
        let resolved_plan_path = match validate_plan_path(plan_path, config.plans_dir(), config.target_dir()) {
            Ok(path) => path,
            Err(message) => {
                return ToolResult::failed(message, Some(Value::String("Error: Invalid plan".to_string())))
            }
        };

        if let Err(message) = validate_plan_content(&resolved_plan_path) {
            return ToolResult::failed(message, Some(Value::String("Error: Invalid plan".to_string())));
        }

        let approved = args.get("approved").and_then(Value::as_bool).unwrap_or(true);
        let display_path = resolved_plan_path.display().to_string();

        if !approved {
            let feedback = args.get("feedback").and_then(Value::as_str).unwrap_or("").trim();
            if !feedback.is_empty() {
                let text = format!(
                    "Plan rejected. User feedback: {feedback}\n\n\
                     The plan is stored at: {display_path}\n\
                     Revise the plan based on the feedback."
                );
                return ToolResult::ok(text, Some(Value::String(format!("Feedback: {feedback}"))));
            }
            let text = format!(
                "Plan rejected. No feedback provided.\n\n\
                 The plan is stored at: {display_path}\n\
                 Ask the user for specific feedback on how to improve the plan."
            );
            return ToolResult::ok(text, Some(Value::String("Rejected (no feedback)".to_string())));
        }

        let mode_value = args
            .get("approval_mode")
            .and_then(Value::as_str)
            .unwrap_or("default");
        let new_mode: ApprovalMode = serde_json::from_value(Value::String(mode_value.to_string()))
            .unwrap_or(ApprovalMode::Default);

        if matches!(new_mode, ApprovalMode::Plan | ApprovalMode::Yolo) {
            let text = "Invalid approval_mode for exiting plan mode. Only default or autoEdit are allowed."
                .to_string();
            return ToolResult::failed(text, Some(Value::String("Error".to_string())));
        }

        config.set_approval_mode(new_mode).await;
        config.set_approved_plan_path(Some(resolved_plan_path.clone()));

        let mode_desc = if matches!(new_mode, ApprovalMode::AutoEdit) {
            "Auto-Edit mode (edits will be applied automatically)"
        } else {
            "Default mode (edits will require confirmation)"
        };
        let text = format!(
            "Plan approved. Switching to {mode_desc}.\n\n\
             The approved implementation plan is stored at: {display_path}\n\
             Read and follow the plan strictly during implementation."
        );
        ToolResult::ok(text, Some(Value::String(format!("Plan approved: {display_path}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfigBuilder;

    fn unique_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dispatch-core-plan-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn enter_plan_mode_switches_and_echoes_reason() {
        let config = RuntimeConfigBuilder::new(unique_dir()).build().unwrap();
        let tool = EnterPlanModeTool;
        let mut args = serde_json::Map::new();
        args.insert("reason".to_string(), Value::String("investigate the bug".to_string()));
        let result = tool.execute(&config, &args).await;
        assert_eq!(result.llm_content, "Switching to Plan mode: investigate the bug");
        assert_eq!(config.approval_mode(), ApprovalMode::Plan);
    }

    #[tokio::test]
    async fn exit_plan_mode_rejects_path_outside_plans_dir() {
        let target_dir = unique_dir();
        std::fs::create_dir_all(&target_dir).unwrap();
        let config = RuntimeConfigBuilder::new(target_dir.clone()).build().unwrap();
        std::fs::write(target_dir.join("outside.md"), "some plan").unwrap();

        let tool = ExitPlanModeTool;
        let mut args = serde_json::Map::new();
        args.insert("plan_path".to_string(), Value::String("outside.md".to_string()));
        let result = tool.execute(&config, &args).await;
        assert!(result.error.is_some());
        assert!(result.error.unwrap().contains("designated plans directory"));
    }

    #[tokio::test]
    async fn exit_plan_mode_rejects_empty_plan() {
        let target_dir = unique_dir();
        let config = RuntimeConfigBuilder::new(target_dir).build().unwrap();
        let plan_path = config.plans_dir().join("empty.md");
        std::fs::write(&plan_path, "").unwrap();
        let relative = plan_path.strip_prefix(config.target_dir()).unwrap();

        let tool = ExitPlanModeTool;
        let mut args = serde_json::Map::new();
        args.insert(
            "plan_path".to_string(),
            Value::String(relative.display().to_string()),
        );
        let result = tool.execute(&config, &args).await;
        assert!(result.error.unwrap().contains("Plan file is empty"));
    }

    #[tokio::test]
    async fn exit_plan_mode_approves_and_switches_mode() {
        let target_dir = unique_dir();
        let config = RuntimeConfigBuilder::new(target_dir).build().unwrap();
        let plan_path = config.plans_dir().join("plan.md");
        std::fs::write(&plan_path, "# Plan\nDo the thing.").unwrap();
        let relative = plan_path.strip_prefix(config.target_dir()).unwrap();

        let tool = ExitPlanModeTool;
        let mut args = serde_json::Map::new();
        args.insert(
            "plan_path".to_string(),
            Value::String(relative.display().to_string()),
        );
        args.insert("approval_mode".to_string(), Value::String("autoEdit".to_string()));
        let result = tool.execute(&config, &args).await;
        assert!(result.error.is_none());
        assert_eq!(config.approval_mode(), ApprovalMode::AutoEdit);
        assert!(result.llm_content.contains("Auto-Edit mode"));
    }

    #[tokio::test]
    async fn exit_plan_mode_reports_rejection_with_feedback() {
        let target_dir = unique_dir();
        let config = RuntimeConfigBuilder::new(target_dir).build().unwrap();
        let plan_path = config.plans_dir().join("plan.md");
        std::fs::write(&plan_path, "# Plan").unwrap();
        let relative = plan_path.strip_prefix(config.target_dir()).unwrap();

        let tool = ExitPlanModeTool;
        let mut args = serde_json::Map::new();
        args.insert(
            "plan_path".to_string(),
            Value::String(relative.display().to_string()),
        );
        args.insert("approved".to_string(), Value::Bool(false));
        args.insert("feedback".to_string(), Value::String("too risky".to_string()));
        let result = tool.execute(&config, &args).await;
        assert!(result.error.is_none());
        assert!(result.llm_content.contains("too risky"));
    }
}
