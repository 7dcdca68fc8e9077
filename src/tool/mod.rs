//! The tool contract and registry: every tool exposes a uniform
//! `validate -> execute -> result` surface; the registry is a
//! deterministically ordered name -> tool mapping.

mod echo;
mod plan_mode;
mod shell;

pub use echo::EchoTool;
pub use plan_mode::{EnterPlanModeTool, ExitPlanModeTool};
pub use shell::RunShellCommandTool;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::RuntimeConfig;

/// Errors raised validating or executing a tool call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Execution(String),
}

/// The outcome of a successful-or-failed `Tool::execute` call. Whether
/// `error` is set determines whether the scheduler reports
/// `execution_failed`; a non-`None` `error` does not panic or raise — it
/// is returned as ordinary data.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub llm_content: String,
    pub return_display: Option<Value>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(llm_content: impl Into<String>, return_display: Option<Value>) -> Self {
        Self {
            llm_content: llm_content.into(),
            return_display,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, return_display: Option<Value>) -> Self {
        let message = message.into();
        Self {
            llm_content: message.clone(),
            return_display,
            error: Some(message),
        }
    }
}

/// The uniform contract every concrete tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema describing this tool's parameters, used to build the
    /// schema list presented to the model.
    fn parameters(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {}, "additionalProperties": true })
    }

    /// Return `Some(message)` to reject `args` before `execute` runs.
    fn validate_params(&self, args: &serde_json::Map<String, Value>) -> Option<String> {
        let _ = args;
        None
    }

    async fn execute(
        &self,
        config: &RuntimeConfig,
        args: &serde_json::Map<String, Value>,
    ) -> ToolResult;
}

/// Collapse `.`/`..` components lexically, without touching the
/// filesystem or requiring the path to exist — the same semantics as
/// Python's `Path.resolve(strict=False)`, used by tools that must reject
/// a path escaping a containing directory before that containment check
/// can be fooled by an uncollapsed `..`.
pub(crate) fn lexically_normalize(path: &std::path::Path) -> std::path::PathBuf {
    use std::path::Component;
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.into_iter().collect()
}

/// An ordered name -> tool mapping. `BTreeMap` keeps enumeration
/// name-sorted for deterministic schema construction without needing to
/// sort at call time.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) {
        self.tools.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Name-sorted (by construction) list of every registered tool name.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn tools(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tool_names", &self.tool_names())
            .finish_non_exhaustive()
    }
}
