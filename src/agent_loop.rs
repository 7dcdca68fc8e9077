//! The agent loop: drives a multi-turn session against a model provider,
//! dispatching the provider's requested tool calls through the
//! [`crate::scheduler::Scheduler`] and enforcing the completion protocol.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, info_span, Instrument};

use crate::completion_schema::validate_completion_output;
use crate::local_executor::{
    process_function_calls, result_to_string, FunctionCall, TASK_COMPLETE_TOOL_NAME,
};
use crate::config::RuntimeConfig;
use crate::scheduler::Scheduler;
use crate::types::{stable_json, CoreToolCallStatus, LlmMessage, ToolCall, ToolCallRequest};

/// Errors surfaced by the agent loop.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The model provider itself raised an error.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A protocol violation (empty turn, unauthorized call, execution
    /// failure, or turn exhaustion) survived the one recovery attempt.
    #[error("agent run failed: {0}")]
    ProtocolViolation(String),
}

/// Errors a [`Provider`] implementation may raise.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Failed(String),
}

/// A normalized response from a model provider: optional free text plus
/// zero or more requested tool invocations.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

/// The external seam the agent loop calls through. Concrete provider wire
/// adapters (OpenAI/Gemini/Anthropic/HF) are out of scope for this crate;
/// this trait is the contract they implement.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn generate(
        &self,
        messages: &[LlmMessage],
        tools: &[Value],
    ) -> Result<ProviderResponse, ProviderError>;
}

/// The outcome of a successfully completed agent run.
#[derive(Debug, Clone)]
pub struct AgentLoopOutcome {
    pub result: String,
    pub turns: usize,
    pub messages: Vec<LlmMessage>,
}

/// Drives turns against a [`Provider`], scheduling tool calls through a
/// freshly owned [`Scheduler`] for the lifetime of one run.
pub struct AgentLoop {
    config: RuntimeConfig,
    provider: Arc<dyn Provider>,
    max_turns: usize,
    system_prompt: Option<String>,
    completion_schema: Option<Value>,
    recovery_enabled: bool,
}

impl AgentLoop {
    pub fn new(config: RuntimeConfig, provider: Arc<dyn Provider>) -> Self {
        Self {
            config,
            provider,
            max_turns: 10,
            system_prompt: None,
            completion_schema: None,
            recovery_enabled: true,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_completion_schema(mut self, schema: Value) -> Self {
        self.completion_schema = Some(schema);
        self
    }

    pub fn with_recovery_enabled(mut self, recovery_enabled: bool) -> Self {
        self.recovery_enabled = recovery_enabled;
        self
    }

    /// Drive a full session starting from `user_prompt`.
    pub async fn run(&self, user_prompt: &str) -> Result<AgentLoopOutcome, RunnerError> {
        let mut messages = Vec::new();
        if let Some(system_prompt) = &self.system_prompt {
            messages.push(LlmMessage::system(system_prompt.clone()));
        }
        messages.push(LlmMessage::user(user_prompt.to_string()));

        let scheduler = Scheduler::new(self.config.clone());

        for turn in 1..=self.max_turns {
            let span = info_span!("agent_turn", turn);
            match self
                .run_turn(turn, &mut messages, &scheduler)
                .instrument(span)
                .await
            {
                TurnOutcome::Done(result) => return result,
                TurnOutcome::Continue => continue,
            }
        }

        self.recover(messages, format!("execution limit reached ({} turns)", self.max_turns))
            .await
    }

    /// Run one turn of the per-turn algorithm (spec §4.7 steps 1-9).
    /// Never itself returns an `Err` turn-ends-the-run signal other than
    /// through `TurnOutcome::Done` so that the calling loop stays a plain
    /// `for` over `max_turns`.
    async fn run_turn(
        &self,
        turn: usize,
        messages: &mut Vec<LlmMessage>,
        scheduler: &Scheduler,
    ) -> TurnOutcome {
        let (allowed, schemas) = self.build_schemas().await;

        let response = match self.provider.generate(messages, &schemas).await {
            Ok(response) => response,
            Err(error) => {
                return TurnOutcome::Done(
                    self.recover(messages.clone(), format!("provider error: {error}")).await,
                )
            }
        };

        messages.push(LlmMessage::assistant(response.content.clone(), response.tool_calls.clone()));

        if response.tool_calls.is_empty() {
            return TurnOutcome::Done(
                self.recover(messages.clone(), "model produced no tool calls".to_string()).await,
            );
        }

        let function_calls: Vec<FunctionCall> = response
            .tool_calls
            .iter()
            .map(|call| FunctionCall {
                name: call.name.clone(),
                args: call.args.clone(),
                call_id: call.call_id.clone(),
            })
            .collect();
        let processed = process_function_calls(&function_calls, Some(&allowed), false);

        if !processed.errors.is_empty() {
            return TurnOutcome::Done(self.recover(messages.clone(), processed.errors.join("; ")).await);
        }

        let executable: Vec<&ToolCall> = response
            .tool_calls
            .iter()
            .filter(|call| call.name != TASK_COMPLETE_TOOL_NAME)
            .collect();

        let mut requests = Vec::with_capacity(executable.len());
        for call in &executable {
            let call_id = call.call_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            debug!(turn, tool = %call.name, call_id = %call_id, "dispatching tool call");
            requests.push(
                ToolCallRequest::new(call.name.clone(), call.args.clone())
                    .with_call_id(call_id)
                    .with_prompt_id(format!("turn-{turn}")),
            );
        }

        let completed = scheduler.schedule_concurrent(requests).await;

        let mut first_failure: Option<String> = None;
        for call in &completed {
            let payload = serde_json::json!({
                "status": call.status,
                "result_display": call.response.result_display,
                "error": call.response.error,
                "error_type": call.response.error_type,
            });
            messages.push(LlmMessage::tool(
                call.request.call_id.clone(),
                call.request.name.clone(),
                stable_json(&payload),
            ));

            if first_failure.is_none()
                && matches!(call.status, CoreToolCallStatus::Error | CoreToolCallStatus::Cancelled)
            {
                first_failure = Some(
                    call.response
                        .error
                        .clone()
                        .unwrap_or_else(|| "tool call failed".to_string()),
                );
            }
        }

        if let Some(reason) = first_failure {
            return TurnOutcome::Done(self.recover(messages.clone(), reason).await);
        }

        if processed.task_completed {
            let output = processed.submitted_output.unwrap_or_default();
            if let Some(schema) = &self.completion_schema {
                if let Some(error) = validate_completion_output(&output, schema) {
                    return TurnOutcome::Done(self.recover(messages.clone(), error).await);
                }
            }
            info!(turn, "agent run completed");
            return TurnOutcome::Done(Ok(AgentLoopOutcome {
                result: output,
                turns: turn,
                messages: messages.clone(),
            }));
        }

        if executable.is_empty() {
            return TurnOutcome::Done(
                self.recover(messages.clone(), "turn produced no executable calls and no completion".to_string())
                    .await,
            );
        }

        TurnOutcome::Continue
    }

    /// The one recovery turn (§4.7b): ask the model to call `complete_task`
    /// immediately. Accepted only if the response is exactly one
    /// `complete_task` call with a schema-valid, non-blank result;
    /// otherwise the original failure `reason` is returned unchanged.
    async fn recover(
        &self,
        mut messages: Vec<LlmMessage>,
        reason: String,
    ) -> Result<AgentLoopOutcome, RunnerError> {
        if !self.recovery_enabled {
            return Err(RunnerError::ProtocolViolation(reason));
        }

        info!(reason = %reason, "attempting recovery turn");
        let prompt = format!(
            "Execution limit reached ({reason}). Final recovery turn: call `complete_task` \
             immediately with your best available answer. Do not call any other tools."
        );
        messages.push(LlmMessage::user(prompt));

        let schemas = vec![complete_task_schema()];
        let response = match self.provider.generate(&messages, &schemas).await {
            Ok(response) => response,
            Err(_) => return Err(RunnerError::ProtocolViolation(reason)),
        };
        messages.push(LlmMessage::assistant(response.content.clone(), response.tool_calls.clone()));

        if response.tool_calls.len() != 1 || response.tool_calls[0].name != TASK_COMPLETE_TOOL_NAME {
            return Err(RunnerError::ProtocolViolation(reason));
        }

        let result = response.tool_calls[0].args.get("result");
        let is_blank = match result {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            _ => false,
        };
        if is_blank {
            return Err(RunnerError::ProtocolViolation(reason));
        }

        let output = result_to_string(result.expect("checked above"));
        if let Some(schema) = &self.completion_schema {
            if validate_completion_output(&output, schema).is_some() {
                return Err(RunnerError::ProtocolViolation(reason));
            }
        }

        Ok(AgentLoopOutcome {
            result: output,
            turns: 0,
            messages,
        })
    }

    /// Build the allowed-tool-name set and the tool-schema list (plus the
    /// synthetic `complete_task` schema) presented to the provider this
    /// turn. Registered agent names are excluded from the top-level loop's
    /// own view, same as every other tool name: a sub-agent is invoked by
    /// handing it a whole pre-authored turn script in one call (see
    /// [`crate::subagent::SubagentTool`]), not by letting this loop pick
    /// it off the generic tool list turn by turn.
    async fn build_schemas(&self) -> (HashSet<String>, Vec<Value>) {
        let registry = self.config.tool_registry().await;
        let available: Vec<String> = registry.tool_names();
        let agent_names = self
            .config
            .agent_registry()
            .await
            .as_ref()
            .map(|registry| registry.all_agent_names())
            .unwrap_or_default();
        let allowed = crate::local_executor::build_allowed_tool_names(&available, &agent_names, None, None);

        let mut schemas = Vec::new();
        for tool in registry.tools() {
            if !allowed.contains(tool.name()) {
                continue;
            }
            schemas.push(serde_json::json!({
                "name": tool.name(),
                "description": tool.description(),
                "parameters": tool.parameters(),
            }));
        }
        schemas.push(complete_task_schema());
        (allowed, schemas)
    }
}

fn complete_task_schema() -> Value {
    serde_json::json!({
        "name": TASK_COMPLETE_TOOL_NAME,
        "description": "Signal that the task is complete and submit the final result.",
        "parameters": {
            "type": "object",
            "properties": { "result": { "type": "string" } },
            "required": ["result"],
            "additionalProperties": false,
        }
    })
}

enum TurnOutcome {
    Done(Result<AgentLoopOutcome, RunnerError>),
    Continue,
}

/// An in-memory [`Provider`] test double driven by a fixed queue of
/// scripted responses, one per `generate` call. Used by this module's own
/// tests and by full-stack scenario tests that need a deterministic
/// stand-in for a real provider wire adapter.
pub struct ScriptedProvider {
    responses: tokio::sync::Mutex<std::collections::VecDeque<ProviderResponse>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: tokio::sync::Mutex::new(responses.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn generate(&self, _messages: &[LlmMessage], _tools: &[Value]) -> Result<ProviderResponse, ProviderError> {
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ProviderError::Failed("ScriptedProvider ran out of scripted responses".to_string()))
    }
}

/// Build a `complete_task` tool call for use in scripted test responses.
pub fn complete_task_call(result: impl Into<String>) -> ToolCall {
    let mut args = serde_json::Map::new();
    args.insert("result".to_string(), Value::String(result.into()));
    ToolCall {
        name: TASK_COMPLETE_TOOL_NAME.to_string(),
        args,
        call_id: None,
    }
}

/// Build an ordinary tool call for use in scripted test responses.
pub fn tool_call(name: impl Into<String>, args: serde_json::Map<String, Value>) -> ToolCall {
    ToolCall {
        name: name.into(),
        args,
        call_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfigBuilder;
    use crate::tool::EchoTool;
    use crate::types::{PolicyDecision, PolicyRule};

    fn unique_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dispatch-core-agent-loop-{}", uuid::Uuid::new_v4()))
    }

    async fn config_with_echo_allowed() -> RuntimeConfig {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        config.tool_registry_mut().await.register(Arc::new(EchoTool));
        config.policy_engine_mut().await.add_rule(PolicyRule::new("echo", PolicyDecision::Allow));
        config
    }

    fn echo_args(text: &str) -> serde_json::Map<String, Value> {
        let mut args = serde_json::Map::new();
        args.insert("text".to_string(), Value::String(text.to_string()));
        args
    }

    #[tokio::test]
    async fn happy_path_with_tool_then_completion() {
        let config = config_with_echo_allowed().await;
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderResponse {
                content: None,
                tool_calls: vec![tool_call("echo", echo_args("hello"))],
                finish_reason: None,
            },
            ProviderResponse {
                content: None,
                tool_calls: vec![complete_task_call("final answer")],
                finish_reason: None,
            },
        ]));
        let agent_loop = AgentLoop::new(config, provider);

        let outcome = agent_loop.run("do the thing").await.unwrap();
        assert_eq!(outcome.result, "final answer");
        assert_eq!(outcome.turns, 2);
        assert!(outcome
            .messages
            .iter()
            .any(|m| matches!(m.role, crate::types::LlmRole::Tool)));
    }

    #[tokio::test]
    async fn unauthorized_tool_call_triggers_recovery() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderResponse {
                content: None,
                tool_calls: vec![tool_call("write_file", serde_json::Map::new())],
                finish_reason: None,
            },
            ProviderResponse {
                content: None,
                tool_calls: vec![complete_task_call("recovered")],
                finish_reason: None,
            },
        ]));
        let agent_loop = AgentLoop::new(config, provider);

        let outcome = agent_loop.run("do the thing").await.unwrap();
        assert_eq!(outcome.result, "recovered");
    }

    #[tokio::test]
    async fn exhausted_recovery_surfaces_original_failure() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderResponse {
                content: None,
                tool_calls: vec![tool_call("write_file", serde_json::Map::new())],
                finish_reason: None,
            },
            ProviderResponse {
                content: Some("I give up".to_string()),
                tool_calls: vec![],
                finish_reason: None,
            },
        ]));
        let agent_loop = AgentLoop::new(config, provider);

        let error = agent_loop.run("do the thing").await.unwrap_err();
        assert!(matches!(error, RunnerError::ProtocolViolation(_)));
        assert!(error.to_string().contains("Unauthorized tool call: 'write_file'"));
    }

    #[tokio::test]
    async fn completion_schema_violation_triggers_recovery() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let schema = serde_json::json!({
            "type": "object",
            "required": ["summary"],
            "properties": { "summary": { "type": "string" } }
        });
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderResponse {
                content: None,
                tool_calls: vec![complete_task_call("plain text")],
                finish_reason: None,
            },
            ProviderResponse {
                content: None,
                tool_calls: vec![complete_task_call(r#"{"summary":"done"}"#)],
                finish_reason: None,
            },
        ]));
        let agent_loop = AgentLoop::new(config, provider).with_completion_schema(schema);

        let outcome = agent_loop.run("do the thing").await.unwrap();
        assert_eq!(outcome.result, r#"{"summary":"done"}"#);
    }

    #[tokio::test]
    async fn no_tool_calls_at_all_triggers_recovery() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderResponse {
                content: Some("just thinking out loud".to_string()),
                tool_calls: vec![],
                finish_reason: None,
            },
            ProviderResponse {
                content: None,
                tool_calls: vec![complete_task_call("recovered answer")],
                finish_reason: None,
            },
        ]));
        let agent_loop = AgentLoop::new(config, provider);

        let outcome = agent_loop.run("do the thing").await.unwrap();
        assert_eq!(outcome.result, "recovered answer");
    }

    #[tokio::test]
    async fn recovery_disabled_fails_fast() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![ProviderResponse {
            content: Some("nothing to do".to_string()),
            tool_calls: vec![],
            finish_reason: None,
        }]));
        let agent_loop = AgentLoop::new(config, provider).with_recovery_enabled(false);

        let error = agent_loop.run("do the thing").await.unwrap_err();
        assert!(matches!(error, RunnerError::ProtocolViolation(_)));
    }
}
