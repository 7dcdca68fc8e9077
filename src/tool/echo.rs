use async_trait::async_trait;
use serde_json::Value;

use crate::config::RuntimeConfig;

use super::{Tool, ToolResult};

/// Echoes its `text` argument back. Used as the minimal demonstration
/// tool in end-to-end scenarios.
#[derive(Debug, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
            "additionalProperties": false,
        })
    }

    fn validate_params(&self, args: &serde_json::Map<String, Value>) -> Option<String> {
        match args.get("text") {
            Some(Value::String(s)) if !s.is_empty() => None,
            _ => Some("`text` must be a non-empty string.".to_string()),
        }
    }

    async fn execute(&self, _config: &RuntimeConfig, args: &serde_json::Map<String, Value>) -> ToolResult {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        ToolResult::ok(text.to_string(), Some(Value::String(text.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfigBuilder;

    #[tokio::test]
    async fn echo_returns_text() {
        let config = RuntimeConfigBuilder::new(std::env::temp_dir()).build().unwrap();
        let tool = EchoTool;
        let mut args = serde_json::Map::new();
        args.insert("text".to_string(), Value::String("hello".to_string()));
        let result = tool.execute(&config, &args).await;
        assert_eq!(result.llm_content, "hello");
        assert!(result.error.is_none());
    }

    #[test]
    fn echo_rejects_missing_text() {
        let tool = EchoTool;
        let args = serde_json::Map::new();
        assert!(tool.validate_params(&args).is_some());
    }
}
