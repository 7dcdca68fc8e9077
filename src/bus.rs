//! The message bus: a typed publish/subscribe hub plus a synchronous
//! request/response helper built on correlation ids, used for the
//! confirmation-gateway round trip between the scheduler and whatever UI
//! (or policy decision) answers it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::policy::PolicyEngine;
use crate::types::{
    Message, MessageBusType, PolicyCheckInput, PolicyDecision, ToolConfirmationOutcome,
};

/// Errors raised by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("request timed out waiting for {0:?} in the message bus")]
    Timeout(MessageBusType),
}

pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

struct Inner {
    subscribers: RwLock<HashMap<MessageBusType, Vec<Handler>>>,
    policy_engine: Option<Arc<RwLock<PolicyEngine>>>,
}

/// Publish/subscribe hub. Clones share the same subscriber lists.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus").finish_non_exhaustive()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                policy_engine: None,
            }),
        }
    }

    /// Construct a bus that special-cases `tool-confirmation-request`
    /// publications by consulting `policy_engine` before ever reaching a
    /// subscriber, matching the confirmation gateway described in the
    /// bus's specification.
    pub fn with_policy_engine(policy_engine: Arc<RwLock<PolicyEngine>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                policy_engine: Some(policy_engine),
            }),
        }
    }

    pub async fn subscribe(&self, message_type: MessageBusType, handler: Handler) {
        self.inner
            .subscribers
            .write()
            .await
            .entry(message_type)
            .or_default()
            .push(handler);
    }

    pub async fn unsubscribe(&self, message_type: MessageBusType, handler: &Handler) {
        if let Some(list) = self.inner.subscribers.write().await.get_mut(&message_type) {
            list.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    /// Dispatch `payload` to every subscriber of `message_type`, unless
    /// `message_type` is `tool-confirmation-request` and a policy engine
    /// is wired in — in that case the policy engine gets first refusal.
    pub async fn publish(&self, message_type: MessageBusType, payload: serde_json::Map<String, serde_json::Value>) {
        if message_type == MessageBusType::ToolConfirmationRequest {
            match self.inner.policy_engine.clone() {
                Some(policy_engine) => {
                    self.publish_confirmation_request_with_policy(payload, policy_engine).await;
                }
                None => {
                    let correlation_id = payload
                        .get("correlation_id")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    self.respond_cancel(
                        &correlation_id,
                        false,
                        Some("Policy engine is not configured.".to_string()),
                    )
                    .await;
                }
            }
            return;
        }
        self.dispatch(message_type, payload).await;
    }

    async fn dispatch(&self, message_type: MessageBusType, payload: serde_json::Map<String, serde_json::Value>) {
        let message = Message { message_type, payload };
        let handlers = self
            .inner
            .subscribers
            .read()
            .await
            .get(&message_type)
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(&message);
        }
    }

    /// Publish `request_type` and wait for the first `response_type`
    /// publication for which `matcher` returns true. Used for the
    /// confirmation gateway's correlation-id round trip.
    pub async fn request(
        &self,
        request_type: MessageBusType,
        payload: serde_json::Map<String, serde_json::Value>,
        response_type: MessageBusType,
        matcher: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Result<Message, BusError> {
        let (tx, rx) = tokio::sync::oneshot::channel::<Message>();
        let tx = std::sync::Mutex::new(Some(tx));
        let handler: Handler = Arc::new(move |message: &Message| {
            if matcher(message) {
                if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(message.clone());
                }
            }
        });

        self.subscribe(response_type, handler.clone()).await;
        self.publish(request_type, payload).await;
        let result = rx.await.map_err(|_| BusError::Timeout(response_type));
        self.unsubscribe(response_type, &handler).await;
        result
    }

    async fn publish_confirmation_request_with_policy(
        &self,
        payload: serde_json::Map<String, serde_json::Value>,
        policy_engine: Arc<RwLock<PolicyEngine>>,
    ) {
        let correlation_id = payload
            .get("correlation_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        let tool_call = match payload.get("tool_call").and_then(serde_json::Value::as_object) {
            Some(tool_call) => tool_call,
            None => {
                self.respond_cancel(&correlation_id, false, None).await;
                return;
            }
        };

        let name = tool_call
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = tool_call
            .get("args")
            .and_then(serde_json::Value::as_object)
            .cloned()
            .unwrap_or_default();
        let server_name = payload
            .get("server_name")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        let input = PolicyCheckInput {
            name,
            args,
            server_name,
        };
        let decision = policy_engine.read().await.check(&input).decision;

        match decision {
            PolicyDecision::Allow => {
                self.respond(&correlation_id, true, ToolConfirmationOutcome::ProceedOnce, false, None)
                    .await;
            }
            PolicyDecision::Deny => {
                self.respond_cancel(&correlation_id, false, None).await;
            }
            PolicyDecision::AskUser => {
                let handlers_present = self
                    .inner
                    .subscribers
                    .read()
                    .await
                    .get(&MessageBusType::ToolConfirmationRequest)
                    .map(|list| !list.is_empty())
                    .unwrap_or(false);

                if !handlers_present {
                    self.respond_cancel(
                        &correlation_id,
                        true,
                        Some("No confirmation handler is registered.".to_string()),
                    )
                    .await;
                    return;
                }
                self.dispatch(MessageBusType::ToolConfirmationRequest, payload).await;
            }
        }
    }

    async fn respond(
        &self,
        correlation_id: &str,
        confirmed: bool,
        outcome: ToolConfirmationOutcome,
        requires_user_confirmation: bool,
        error: Option<String>,
    ) {
        let mut payload = serde_json::Map::new();
        payload.insert("correlation_id".into(), correlation_id.into());
        payload.insert("confirmed".into(), confirmed.into());
        payload.insert("outcome".into(), serde_json::to_value(outcome).unwrap_or_default());
        payload.insert("requires_user_confirmation".into(), requires_user_confirmation.into());
        if let Some(error) = error {
            payload.insert("error".into(), error.into());
        }
        self.dispatch(MessageBusType::ToolConfirmationResponse, payload).await;
    }

    async fn respond_cancel(&self, correlation_id: &str, requires_user_confirmation: bool, error: Option<String>) {
        self.respond(
            correlation_id,
            false,
            ToolConfirmationOutcome::Cancel,
            requires_user_confirmation,
            error,
        )
        .await;
    }
}

/// Generates a fresh correlation id for a confirmation round trip.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalMode, PolicyRule};

    fn payload_with_tool(name: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut payload = serde_json::Map::new();
        payload.insert("correlation_id".into(), new_correlation_id().into());
        payload.insert(
            "tool_call".into(),
            serde_json::json!({ "name": name, "args": {} }),
        );
        payload
    }

    #[tokio::test]
    async fn no_policy_engine_fails_closed() {
        let bus = MessageBus::new();
        let response = bus
            .request(
                MessageBusType::ToolConfirmationRequest,
                payload_with_tool("run_shell_command"),
                MessageBusType::ToolConfirmationResponse,
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(
            response.payload.get("error").and_then(serde_json::Value::as_str),
            Some("Policy engine is not configured.")
        );
    }

    #[tokio::test]
    async fn allow_decision_auto_confirms() {
        let mut engine = PolicyEngine::new();
        engine.add_rule(PolicyRule::new("echo", PolicyDecision::Allow));
        let engine = Arc::new(RwLock::new(engine));
        let bus = MessageBus::with_policy_engine(engine);

        let response = bus
            .request(
                MessageBusType::ToolConfirmationRequest,
                payload_with_tool("echo"),
                MessageBusType::ToolConfirmationResponse,
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(response.payload.get("confirmed").and_then(serde_json::Value::as_bool), Some(true));
    }

    #[tokio::test]
    async fn ask_user_with_no_handler_fails_closed() {
        let mut engine = PolicyEngine::new();
        engine.set_approval_mode(ApprovalMode::Default);
        let engine = Arc::new(RwLock::new(engine));
        let bus = MessageBus::with_policy_engine(engine);

        let response = bus
            .request(
                MessageBusType::ToolConfirmationRequest,
                payload_with_tool("run_shell_command"),
                MessageBusType::ToolConfirmationResponse,
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(
            response.payload.get("error").and_then(serde_json::Value::as_str),
            Some("No confirmation handler is registered.")
        );
    }

    #[tokio::test]
    async fn ask_user_forwards_to_registered_handler() {
        let engine = Arc::new(RwLock::new(PolicyEngine::new()));
        let bus = MessageBus::with_policy_engine(engine);

        let seen = Arc::new(tokio::sync::Mutex::new(None));
        let seen_clone = seen.clone();
        let bus_clone = bus.clone();
        bus.subscribe(
            MessageBusType::ToolConfirmationRequest,
            Arc::new(move |message: &Message| {
                let correlation_id = message
                    .payload
                    .get("correlation_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                *seen_clone.try_lock().unwrap() = Some(correlation_id.clone());
                let bus_clone = bus_clone.clone();
                tokio::spawn(async move {
                    let mut payload = serde_json::Map::new();
                    payload.insert("correlation_id".into(), correlation_id.into());
                    payload.insert("confirmed".into(), true.into());
                    payload.insert("outcome".into(), "proceed_once".into());
                    bus_clone.publish(MessageBusType::ToolConfirmationResponse, payload).await;
                });
            }),
        )
        .await;

        let response = bus
            .request(
                MessageBusType::ToolConfirmationRequest,
                payload_with_tool("run_shell_command"),
                MessageBusType::ToolConfirmationResponse,
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(response.payload.get("confirmed").and_then(serde_json::Value::as_bool), Some(true));
        assert!(seen.lock().await.is_some());
    }
}
