//! Core data types shared by every component of the dispatch core.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Session-wide approval gate governing which mode-scoped policy rules
/// apply and how shell redirection is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalMode {
    Default,
    AutoEdit,
    Yolo,
    Plan,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        Self::Default
    }
}

/// The outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    AskUser,
}

/// A single prioritized policy rule.
///
/// Rules are sorted descending by `priority` and evaluated in that order;
/// the first match wins. Priorities use a tier+sub-priority encoding:
/// `effective = tier + raw_priority / 1000`.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Exact tool name, `None` (catch-all), or a wildcard `<mcp>__*`.
    pub tool_name: Option<String>,
    pub decision: PolicyDecision,
    pub priority: f64,
    /// Empty or `None` applies in all modes.
    pub modes: Option<Vec<ApprovalMode>>,
    /// Matched against a canonical stable-key JSON rendering of args.
    pub args_pattern: Option<Regex>,
    pub allow_redirection: bool,
    pub deny_message: Option<String>,
    pub source: Option<String>,
}

impl PolicyRule {
    /// A minimal rule: just a tool name and a decision, at priority 0.
    pub fn new(tool_name: impl Into<String>, decision: PolicyDecision) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            decision,
            priority: 0.0,
            modes: None,
            args_pattern: None,
            allow_redirection: false,
            deny_message: None,
            source: None,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_modes(mut self, modes: Vec<ApprovalMode>) -> Self {
        self.modes = Some(modes);
        self
    }

    pub fn with_allow_redirection(mut self, allow: bool) -> Self {
        self.allow_redirection = allow;
        self
    }

    pub fn with_deny_message(mut self, message: impl Into<String>) -> Self {
        self.deny_message = Some(message.into());
        self
    }
}

/// Input to `PolicyEngine::check`.
#[derive(Debug, Clone, Default)]
pub struct PolicyCheckInput {
    pub name: String,
    pub args: serde_json::Map<String, Value>,
    pub server_name: Option<String>,
}

impl PolicyCheckInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: serde_json::Map::new(),
            server_name: None,
        }
    }

    pub fn with_args(mut self, args: serde_json::Map<String, Value>) -> Self {
        self.args = args;
        self
    }
}

/// The result of a policy check: the decision, and the rule that produced
/// it (`None` when no rule matched and the engine default applied).
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub decision: PolicyDecision,
    pub matched_rule: Option<PolicyRule>,
}

/// Terminal and in-flight states a tool call can occupy. Only the terminal
/// variants (`Success`, `Error`, `Cancelled`) are ever emitted by the
/// scheduler to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreToolCallStatus {
    Validating,
    Scheduled,
    AwaitingApproval,
    Executing,
    Success,
    Error,
    Cancelled,
}

/// A request to invoke a tool, as handed to the scheduler.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub name: String,
    pub args: serde_json::Map<String, Value>,
    pub call_id: String,
    pub scheduler_id: String,
    pub parent_call_id: Option<String>,
    pub prompt_id: String,
    pub is_client_initiated: bool,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, args: serde_json::Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
            call_id: Uuid::new_v4().to_string(),
            scheduler_id: "root".to_string(),
            parent_call_id: None,
            prompt_id: "default".to_string(),
            is_client_initiated: false,
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_scheduler_id(mut self, scheduler_id: impl Into<String>) -> Self {
        self.scheduler_id = scheduler_id.into();
        self
    }

    pub fn with_parent_call_id(mut self, parent_call_id: impl Into<String>) -> Self {
        self.parent_call_id = Some(parent_call_id.into());
        self
    }

    pub fn with_prompt_id(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = prompt_id.into();
        self
    }
}

/// The outcome of a tool call, as recorded by the scheduler.
#[derive(Debug, Clone)]
pub struct ToolCallResponse {
    pub call_id: String,
    pub result_display: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub data: Option<serde_json::Map<String, Value>>,
}

impl ToolCallResponse {
    pub fn success(call_id: impl Into<String>, result_display: Option<Value>) -> Self {
        Self {
            call_id: call_id.into(),
            result_display,
            error: None,
            error_type: None,
            data: None,
        }
    }

    pub fn error(
        call_id: impl Into<String>,
        error: impl Into<String>,
        error_type: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            result_display: None,
            error: Some(error.into()),
            error_type: Some(error_type.into()),
            data: None,
        }
    }
}

/// A request paired with its final outcome.
#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    pub status: CoreToolCallStatus,
    pub request: ToolCallRequest,
    pub response: ToolCallResponse,
}

/// The six message kinds carried on the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageBusType {
    ToolConfirmationRequest,
    ToolConfirmationResponse,
    UpdatePolicy,
    ToolCallsUpdate,
    AskUserRequest,
    AskUserResponse,
}

/// A typed envelope carried on the message bus.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageBusType,
    pub payload: serde_json::Map<String, Value>,
}

impl Message {
    pub fn new(message_type: MessageBusType, payload: serde_json::Map<String, Value>) -> Self {
        Self {
            message_type,
            payload,
        }
    }
}

/// The outcome of a human/policy confirmation round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolConfirmationOutcome {
    ProceedOnce,
    ProceedAlways,
    Cancel,
}

/// A chat message in the conversation the agent loop drives.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: Option<String>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: Some(content.into()),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: Some(content.into()),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: LlmRole::Assistant,
            content,
            tool_call_id: None,
            name: None,
            tool_calls,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, name: impl Into<String>, content: String) -> Self {
        Self {
            role: LlmRole::Tool,
            content: Some(content),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool invocation requested by the model on an assistant turn.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Map<String, Value>,
    pub call_id: Option<String>,
}

/// Whether an agent definition is driven by an in-process runner (`Local`)
/// or an out-of-process collaborator (`Remote`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Local,
    Remote,
}

/// A registered sub-agent, exposed to the scheduler as a tool of the same
/// name.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub kind: AgentKind,
    pub enabled: bool,
    /// Explicit tool allowlist; `None` means "no restriction beyond the
    /// registry itself".
    pub tool_names: Option<Vec<String>>,
    pub completion_schema: Option<Value>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: AgentKind::Local,
            enabled: true,
            tool_names: None,
            completion_schema: None,
        }
    }

    pub fn with_kind(mut self, kind: AgentKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_tool_names(mut self, tool_names: Vec<String>) -> Self {
        self.tool_names = Some(tool_names);
        self
    }

    pub fn with_completion_schema(mut self, schema: Value) -> Self {
        self.completion_schema = Some(schema);
        self
    }
}

/// Render a JSON value as a stable, sorted-key, compact-separator string.
/// Used for `args_pattern` matching so that key order never affects
/// matching.
pub fn stable_json(value: &Value) -> String {
    let sorted = sort_value_keys(value);
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn sort_value_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sort_value_keys(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value_keys).collect()),
        other => other.clone(),
    }
}
