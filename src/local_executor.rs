//! The local agent executor: a pure function that decides, from a turn's
//! function calls, whether the agent finished (`complete_task`), made
//! progress with no completion, or errored.

use serde_json::Value;

/// The well-known completion tool name every local agent terminates with.
pub const TASK_COMPLETE_TOOL_NAME: &str = "complete_task";

pub fn unauthorized_tool_error(tool_name: &str) -> String {
    format!("Unauthorized tool call: '{tool_name}' is not available to this agent.")
}

fn missing_result_error() -> String {
    "Missing required \"result\" argument. You must provide your findings when calling complete_task."
        .to_string()
}

fn no_complete_task_call_error() -> String {
    format!(
        "Agent stopped calling tools but did not call '{TASK_COMPLETE_TOOL_NAME}' to finalize the session."
    )
}

/// Why a turn ended. `None` (absent from this enum, represented as
/// `Option::None` on `ProcessedTurn::terminate_reason`) means the turn
/// produced no errors and no completion, and `enforce_complete_task` was
/// `false` — the caller is expected to keep looping rather than treat
/// this as terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentTerminateMode {
    Goal,
    ErrorNoCompleteTaskCall,
    Error,
}

/// A single function call the model requested this turn.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub args: serde_json::Map<String, Value>,
    pub call_id: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
            call_id: None,
        }
    }
}

/// The result of folding one turn's function calls through
/// [`process_function_calls`].
#[derive(Debug, Clone)]
pub struct ProcessedTurn {
    pub task_completed: bool,
    pub submitted_output: Option<String>,
    pub terminate_reason: Option<AgentTerminateMode>,
    pub errors: Vec<String>,
}

/// Fold one turn's function calls into a [`ProcessedTurn`].
///
/// `allowed_tool_names`, when present, restricts which non-`complete_task`
/// tool names are considered authorized; any other name is recorded as an
/// error (but does not by itself prevent `complete_task` from being
/// honored later in the same turn).
///
/// `enforce_complete_task` controls what happens when a turn produces no
/// errors and no completion: when `true`, that is itself reported as
/// [`AgentTerminateMode::ErrorNoCompleteTaskCall`]; when `false`, the turn
/// is reported as incomplete but non-terminal (`terminate_reason: None`),
/// letting the caller drive another turn instead of failing outright.
pub fn process_function_calls(
    function_calls: &[FunctionCall],
    allowed_tool_names: Option<&std::collections::HashSet<String>>,
    enforce_complete_task: bool,
) -> ProcessedTurn {
    if function_calls.is_empty() {
        return incomplete_turn(Vec::new(), enforce_complete_task);
    }

    let mut errors = Vec::new();
    let mut submitted_output = None;
    let mut task_completed = false;

    for call in function_calls {
        if call.name != TASK_COMPLETE_TOOL_NAME {
            if let Some(allowed) = allowed_tool_names {
                if !allowed.contains(&call.name) {
                    errors.push(unauthorized_tool_error(&call.name));
                }
            }
            continue;
        }

        if task_completed {
            errors.push("Task already marked complete in this turn. Ignoring duplicate call.".to_string());
            continue;
        }

        let result = call.args.get("result");
        let is_blank = match result {
            None => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Null) => true,
            _ => false,
        };
        if is_blank {
            errors.push(missing_result_error());
            continue;
        }

        submitted_output = Some(result_to_string(result.expect("checked above")));
        task_completed = true;
    }

    if task_completed {
        return ProcessedTurn {
            task_completed: true,
            submitted_output,
            terminate_reason: Some(AgentTerminateMode::Goal),
            errors,
        };
    }

    if !errors.is_empty() {
        return ProcessedTurn {
            task_completed: false,
            submitted_output: None,
            terminate_reason: Some(AgentTerminateMode::Error),
            errors,
        };
    }

    incomplete_turn(errors, enforce_complete_task)
}

fn incomplete_turn(errors: Vec<String>, enforce_complete_task: bool) -> ProcessedTurn {
    if enforce_complete_task {
        ProcessedTurn {
            task_completed: false,
            submitted_output: None,
            terminate_reason: Some(AgentTerminateMode::ErrorNoCompleteTaskCall),
            errors: vec![no_complete_task_call_error()],
        }
    } else {
        ProcessedTurn {
            task_completed: false,
            submitted_output: None,
            terminate_reason: None,
            errors,
        }
    }
}

pub(crate) fn result_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the set of tool names a caller may invoke.
///
/// `available` is every name the registry exposes; `agent_names` is every
/// sub-agent name known to the runtime. Every agent name is excluded from
/// the result by default — this is what stops a sub-agent from calling
/// itself, or any other sub-agent, through the generic tool list.
///
/// `self_name`, when given, identifies the agent this allowlist is being
/// built *for*: if `configured` explicitly lists `self_name` (and it is
/// actually a registered tool), it is the one agent name allowed back
/// in — this is the only path by which recursive sub-agent dispatch can
/// ever be authorized, and it requires an explicit opt-in.
///
/// `configured`, when given, is intersected with the result, further
/// restricting it to an agent definition's own declared `tool_names`.
pub fn build_allowed_tool_names(
    available: &[String],
    agent_names: &[String],
    configured: Option<&[String]>,
    self_name: Option<&str>,
) -> std::collections::HashSet<String> {
    let agent_set: std::collections::HashSet<&str> = agent_names.iter().map(String::as_str).collect();

    let mut result: std::collections::HashSet<String> =
        available.iter().filter(|name| !agent_set.contains(name.as_str())).cloned().collect();

    if let Some(configured) = configured {
        let configured_set: std::collections::HashSet<&str> = configured.iter().map(String::as_str).collect();

        if let Some(self_name) = self_name {
            if configured_set.contains(self_name) && available.iter().any(|name| name == self_name) {
                result.insert(self_name.to_string());
            }
        }

        result.retain(|name| configured_set.contains(name.as_str()));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_task_call(result: &str) -> FunctionCall {
        let mut args = serde_json::Map::new();
        args.insert("result".to_string(), Value::String(result.to_string()));
        FunctionCall::new(TASK_COMPLETE_TOOL_NAME, args)
    }

    #[test]
    fn empty_turn_errors_when_enforced() {
        let turn = process_function_calls(&[], None, true);
        assert_eq!(turn.terminate_reason, Some(AgentTerminateMode::ErrorNoCompleteTaskCall));
    }

    #[test]
    fn empty_turn_is_non_terminal_when_not_enforced() {
        let turn = process_function_calls(&[], None, false);
        assert_eq!(turn.terminate_reason, None);
        assert!(!turn.task_completed);
    }

    #[test]
    fn complete_task_with_result_succeeds() {
        let calls = vec![complete_task_call("the answer is 42")];
        let turn = process_function_calls(&calls, None, true);
        assert!(turn.task_completed);
        assert_eq!(turn.submitted_output.as_deref(), Some("the answer is 42"));
        assert_eq!(turn.terminate_reason, Some(AgentTerminateMode::Goal));
    }

    #[test]
    fn complete_task_with_blank_result_errors() {
        let mut args = serde_json::Map::new();
        args.insert("result".to_string(), Value::String("   ".to_string()));
        let calls = vec![FunctionCall::new(TASK_COMPLETE_TOOL_NAME, args)];
        let turn = process_function_calls(&calls, None, true);
        assert!(!turn.task_completed);
        assert_eq!(turn.terminate_reason, Some(AgentTerminateMode::Error));
        assert!(turn.errors[0].contains("Missing required"));
    }

    #[test]
    fn duplicate_complete_task_call_is_ignored() {
        let calls = vec![complete_task_call("first"), complete_task_call("second")];
        let turn = process_function_calls(&calls, None, true);
        assert!(turn.task_completed);
        assert_eq!(turn.submitted_output.as_deref(), Some("first"));
        assert!(turn.errors[0].contains("already marked complete"));
    }

    #[test]
    fn unauthorized_tool_is_recorded_but_does_not_block_completion() {
        let allowed: std::collections::HashSet<String> = ["echo".to_string()].into_iter().collect();
        let mut args = serde_json::Map::new();
        args.insert("text".to_string(), Value::String("hi".to_string()));
        let calls = vec![FunctionCall::new("run_shell_command", args), complete_task_call("done")];
        let turn = process_function_calls(&calls, Some(&allowed), true);
        assert!(turn.task_completed);
        assert_eq!(turn.errors.len(), 1);
        assert!(turn.errors[0].contains("Unauthorized tool call"));
    }

    #[test]
    fn tool_calls_with_no_completion_and_no_errors_is_non_terminal_when_not_enforced() {
        let mut args = serde_json::Map::new();
        args.insert("text".to_string(), Value::String("hi".to_string()));
        let calls = vec![FunctionCall::new("echo", args)];
        let turn = process_function_calls(&calls, None, false);
        assert_eq!(turn.terminate_reason, None);
        assert!(turn.errors.is_empty());
    }

    #[test]
    fn tool_calls_with_no_completion_and_no_errors_errors_when_enforced() {
        let mut args = serde_json::Map::new();
        args.insert("text".to_string(), Value::String("hi".to_string()));
        let calls = vec![FunctionCall::new("echo", args)];
        let turn = process_function_calls(&calls, None, true);
        assert_eq!(turn.terminate_reason, Some(AgentTerminateMode::ErrorNoCompleteTaskCall));
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn build_allowed_tool_names_excludes_all_agent_names_by_default() {
        let available = strings(&["echo", "research_agent", "writer_agent"]);
        let agents = strings(&["research_agent", "writer_agent"]);
        let allowed = build_allowed_tool_names(&available, &agents, None, Some("research_agent"));
        assert_eq!(allowed, ["echo".to_string()].into_iter().collect());
    }

    #[test]
    fn build_allowed_tool_names_permits_explicit_self_recursion() {
        let available = strings(&["echo", "research_agent"]);
        let agents = strings(&["research_agent"]);
        let configured = strings(&["echo", "research_agent"]);
        let allowed =
            build_allowed_tool_names(&available, &agents, Some(&configured), Some("research_agent"));
        assert_eq!(allowed, ["echo".to_string(), "research_agent".to_string()].into_iter().collect());
    }

    #[test]
    fn build_allowed_tool_names_never_reintroduces_other_agents() {
        let available = strings(&["echo", "research_agent", "writer_agent"]);
        let agents = strings(&["research_agent", "writer_agent"]);
        let configured = strings(&["echo", "writer_agent"]);
        let allowed =
            build_allowed_tool_names(&available, &agents, Some(&configured), Some("research_agent"));
        assert_eq!(allowed, ["echo".to_string()].into_iter().collect());
    }

    #[test]
    fn build_allowed_tool_names_intersects_with_configured() {
        let available = strings(&["echo", "run_shell_command"]);
        let allowed = build_allowed_tool_names(&available, &[], Some(&strings(&["echo"])), None);
        assert_eq!(allowed, ["echo".to_string()].into_iter().collect());
    }
}
