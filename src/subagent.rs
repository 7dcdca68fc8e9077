//! The sub-agent tool: wraps an [`crate::types::AgentDefinition`] as an
//! ordinary [`crate::tool::Tool`] that replays a pre-authored, multi-turn
//! script of tool calls through a restricted allowlist and a child
//! scheduler, rather than driving its own model provider.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::local_executor::{build_allowed_tool_names, process_function_calls, FunctionCall, TASK_COMPLETE_TOOL_NAME};
use crate::scheduler::Scheduler;
use crate::tool::{Tool, ToolResult};
use crate::types::{AgentDefinition, CoreToolCallStatus, ToolCallRequest};

/// A `Tool` that replays a caller-supplied script of turns against a
/// sub-agent's restricted tool allowlist. `turns` is an array of arrays of
/// `{name, args}` calls — one inner array per simulated turn — so the
/// caller (typically the top-level orchestration, not this tool itself)
/// decides the entire multi-turn plan up front.
pub struct SubagentTool {
    definition: AgentDefinition,
}

impl SubagentTool {
    pub fn new(definition: AgentDefinition) -> Self {
        Self { definition }
    }

    fn validate_turns(&self, args: &serde_json::Map<String, Value>) -> Result<Vec<Vec<FunctionCall>>, String> {
        let turns = match args.get("turns") {
            Some(Value::Array(turns)) if !turns.is_empty() => turns,
            _ => return Err("`turns` must be a non-empty array of turn tool calls.".to_string()),
        };

        let mut parsed = Vec::with_capacity(turns.len());
        for (turn_idx, turn) in turns.iter().enumerate() {
            let turn_number = turn_idx + 1;
            let Value::Array(calls) = turn else {
                return Err(format!("turn #{turn_number} must be an array of tool calls."));
            };

            let mut function_calls = Vec::with_capacity(calls.len());
            for (call_idx, call) in calls.iter().enumerate() {
                let call_number = call_idx + 1;
                let Value::Object(call) = call else {
                    return Err(format!("turn #{turn_number} call #{call_number} must be an object."));
                };

                let name = match call.get("name") {
                    Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
                    _ => {
                        return Err(format!(
                            "turn #{turn_number} call #{call_number}: `name` must be a non-empty string."
                        ))
                    }
                };
                let args = match call.get("args") {
                    Some(Value::Object(args)) => args.clone(),
                    _ => {
                        return Err(format!(
                            "turn #{turn_number} call #{call_number}: `args` must be an object."
                        ))
                    }
                };

                function_calls.push(FunctionCall::new(name, args));
            }
            parsed.push(function_calls);
        }

        Ok(parsed)
    }

    /// Every tool the registry exposes, minus every agent name (the
    /// sub-agent's own name included), minus anything `tool_names`
    /// excludes — unless `tool_names` explicitly opts this agent's own
    /// name back in.
    async fn allowed_tool_names(&self, config: &RuntimeConfig) -> HashSet<String> {
        let available = config.tool_registry().await.tool_names();
        let mut agent_names = config
            .agent_registry()
            .await
            .as_ref()
            .map(|registry| registry.all_agent_names())
            .unwrap_or_default();
        if !agent_names.iter().any(|name| name == &self.definition.name) {
            agent_names.push(self.definition.name.clone());
        }

        build_allowed_tool_names(
            &available,
            &agent_names,
            self.definition.tool_names.as_deref(),
            Some(&self.definition.name),
        )
    }

    async fn run_script(&self, config: &RuntimeConfig, turns: Vec<Vec<FunctionCall>>) -> ToolResult {
        let allowed = self.allowed_tool_names(config).await;
        let scheduler_id = format!("subagent:{}", self.definition.name);
        let mut scheduler = Scheduler::new(config.clone());

        for (turn_idx, function_calls) in turns.iter().enumerate() {
            let turn_number = turn_idx + 1;
            let processed = process_function_calls(function_calls, Some(&allowed), false);

            if !processed.errors.is_empty() {
                let message = format!(
                    "Subagent '{}' protocol error on turn #{turn_number}: {}",
                    self.definition.name,
                    processed.errors.join("; ")
                );
                return ToolResult::failed(message, Some(Value::String("Subagent protocol error".to_string())));
            }

            let requests: Vec<ToolCallRequest> = function_calls
                .iter()
                .filter(|call| call.name != TASK_COMPLETE_TOOL_NAME && allowed.contains(&call.name))
                .map(|call| ToolCallRequest::new(call.name.clone(), call.args.clone()).with_scheduler_id(scheduler_id.clone()))
                .collect();

            if !requests.is_empty() {
                let completed = scheduler.schedule(requests).await;
                if let Some(first) = completed
                    .iter()
                    .find(|call| matches!(call.status, CoreToolCallStatus::Error | CoreToolCallStatus::Cancelled))
                {
                    let error = first
                        .response
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error during subagent tool execution.".to_string());
                    let message = format!(
                        "Subagent '{}' tool execution failed on turn #{turn_number}: {}: {error}",
                        self.definition.name, first.request.name,
                    );
                    return ToolResult::failed(message, Some(Value::String("Subagent execution failed".to_string())));
                }
            }

            if processed.task_completed {
                let result = processed.submitted_output.unwrap_or_default();
                if let Some(schema) = &self.definition.completion_schema {
                    if let Some(error) = crate::completion_schema::validate_completion_output(&result, schema) {
                        return ToolResult::failed(
                            error,
                            Some(Value::String("Subagent completion schema violation".to_string())),
                        );
                    }
                }
                return ToolResult::ok(
                    format!(
                        "Subagent '{}' finished successfully with result: {result}",
                        self.definition.name
                    ),
                    Some(serde_json::json!({
                        "agent": self.definition.name,
                        "turn": turn_number,
                        "result": result,
                    })),
                );
            }
        }

        let message = format!(
            "Subagent '{}' stopped without calling '{TASK_COMPLETE_TOOL_NAME}'.",
            self.definition.name
        );
        ToolResult::failed(message, Some(Value::String("Subagent protocol error".to_string())))
    }
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "turns": {
                    "type": "array",
                    "description": "One array of {name, args} tool calls per simulated turn.",
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "args": { "type": "object" },
                            },
                            "required": ["name", "args"],
                        }
                    }
                }
            },
            "required": ["turns"],
            "additionalProperties": false,
        })
    }

    fn validate_params(&self, args: &serde_json::Map<String, Value>) -> Option<String> {
        self.validate_turns(args).err()
    }

    async fn execute(&self, config: &RuntimeConfig, args: &serde_json::Map<String, Value>) -> ToolResult {
        let turns = match self.validate_turns(args) {
            Ok(turns) => turns,
            Err(message) => return ToolResult::failed(message, Some(Value::String("Error".to_string()))),
        };
        self.run_script(config, turns).await
    }
}
