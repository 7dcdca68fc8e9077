//! The scheduler: the lookup -> validate -> policy -> confirm -> execute
//! pipeline every tool call request passes through before becoming a
//! terminal [`CompletedToolCall`].

use std::collections::VecDeque;

use futures::future::join_all;
use tracing::{info_span, Instrument};

use crate::bus::new_correlation_id;
use crate::config::RuntimeConfig;
use crate::policy::{PRIORITY_CONFIRMED, DYNAMIC_CONFIRMED_SOURCE};
use crate::types::{
    CompletedToolCall, CoreToolCallStatus, MessageBusType, PolicyCheckInput, PolicyDecision,
    PolicyRule, ToolCallRequest, ToolCallResponse, ToolConfirmationOutcome,
};

/// Errors surfaced by scheduler construction. Per-request failures are
/// represented as [`CompletedToolCall`] with an `error_type`, not this
/// type — this exists for future fatal construction failures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Internal(String),
}

/// FIFO queue plus a completed-call buffer, matching the state manager's
/// role of keeping `Scheduler::schedule` itself free of bookkeeping.
#[derive(Default)]
pub struct SchedulerStateManager {
    queue: VecDeque<ToolCallRequest>,
    completed: Vec<CompletedToolCall>,
}

impl SchedulerStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, requests: Vec<ToolCallRequest>) {
        self.queue.extend(requests);
    }

    pub fn dequeue(&mut self) -> Option<ToolCallRequest> {
        self.queue.pop_front()
    }

    pub fn complete(&mut self, call: CompletedToolCall) {
        self.completed.push(call);
    }

    pub fn drain_completed(&mut self) -> Vec<CompletedToolCall> {
        std::mem::take(&mut self.completed)
    }
}

/// Drives tool call requests through validation, policy, confirmation,
/// and execution. One `Scheduler` call to `schedule` fully drains its
/// batch (including dynamically-enqueued follow-ups, if any) before
/// returning.
pub struct Scheduler {
    config: RuntimeConfig,
    state: SchedulerStateManager,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            state: SchedulerStateManager::new(),
        }
    }

    pub async fn schedule(&mut self, requests: Vec<ToolCallRequest>) -> Vec<CompletedToolCall> {
        self.state.enqueue(requests);

        while let Some(request) = self.state.dequeue() {
            let call_id = request.call_id.clone();
            let name = request.name.clone();
            let completed = self
                .process_single_request(request)
                .instrument(info_span!("tool_call", call_id = %call_id, tool = %name))
                .await;
            self.state.complete(completed);
        }

        self.state.drain_completed()
    }

    /// Dispatch every request in `requests` concurrently rather than one
    /// at a time, preserving input order in the returned vector. Used by
    /// callers driving one model turn's worth of independent tool calls,
    /// where nothing orders one call's completion ahead of another's —
    /// matching the teacher's own `join_all`-based turn dispatch.
    ///
    /// Unlike [`Scheduler::schedule`], this bypasses the FIFO state queue
    /// entirely: every request here is already known up front, so there
    /// is nothing to dynamically enqueue mid-batch.
    pub async fn schedule_concurrent(&self, requests: Vec<ToolCallRequest>) -> Vec<CompletedToolCall> {
        let futures = requests.into_iter().map(|request| {
            let call_id = request.call_id.clone();
            let name = request.name.clone();
            self.process_single_request(request)
                .instrument(info_span!("tool_call", call_id = %call_id, tool = %name))
        });
        join_all(futures).await
    }

    async fn process_single_request(&self, request: ToolCallRequest) -> CompletedToolCall {
        let mut confirmation_outcome: Option<ToolConfirmationOutcome> = None;

        let tool = self.config.tool_registry().await.get(&request.name);
        let Some(tool) = tool else {
            let message = format!("Tool \"{}\" not found.", request.name);
            return error_call(request, message, "tool_not_registered");
        };

        if let Some(validation_error) = tool.validate_params(&request.args) {
            return error_call(request, validation_error, "invalid_tool_params");
        }

        let policy_input = PolicyCheckInput {
            name: request.name.clone(),
            args: request.args.clone(),
            server_name: None,
        };
        let policy_result = self.config.check_policy(&policy_input).await;

        if policy_result.decision == PolicyDecision::Deny {
            let deny_message = policy_result
                .matched_rule
                .as_ref()
                .and_then(|rule| rule.deny_message.clone())
                .unwrap_or_else(|| "Tool execution denied by policy.".to_string());
            return error_call(request, deny_message, "policy_violation");
        }

        if policy_result.decision == PolicyDecision::AskUser && !self.config.interactive() {
            let message = format!(
                "Tool execution for \"{}\" requires user confirmation, which is unavailable in non-interactive mode.",
                request.name
            );
            return error_call(request, message, "policy_violation");
        }

        if policy_result.decision == PolicyDecision::AskUser {
            let outcome = self.resolve_confirmation(&request).await;
            self.update_policy_after_confirmation(&request, outcome).await;
            confirmation_outcome = Some(outcome);

            if outcome == ToolConfirmationOutcome::Cancel {
                let mut data = serde_json::Map::new();
                data.insert(
                    "outcome".to_string(),
                    serde_json::to_value(outcome).unwrap_or_default(),
                );
                return CompletedToolCall {
                    status: CoreToolCallStatus::Cancelled,
                    response: ToolCallResponse {
                        call_id: request.call_id.clone(),
                        result_display: Some(serde_json::Value::String("Cancelled".to_string())),
                        error: Some("User denied execution.".to_string()),
                        error_type: Some("cancelled".to_string()),
                        data: Some(data),
                    },
                    request,
                };
            }
        }

        let result = tool.execute(&self.config, &request.args).await;
        if let Some(error) = result.error {
            return CompletedToolCall {
                status: CoreToolCallStatus::Error,
                response: ToolCallResponse {
                    call_id: request.call_id.clone(),
                    result_display: result.return_display,
                    error: Some(error),
                    error_type: Some("execution_failed".to_string()),
                    data: None,
                },
                request,
            };
        }

        let data = confirmation_outcome.map(|outcome| {
            let mut data = serde_json::Map::new();
            data.insert(
                "confirmation_outcome".to_string(),
                serde_json::to_value(outcome).unwrap_or_default(),
            );
            data
        });

        CompletedToolCall {
            status: CoreToolCallStatus::Success,
            response: ToolCallResponse {
                call_id: request.call_id.clone(),
                result_display: result.return_display,
                error: None,
                error_type: None,
                data,
            },
            request,
        }
    }

    async fn resolve_confirmation(&self, request: &ToolCallRequest) -> ToolConfirmationOutcome {
        let correlation_id = new_correlation_id();
        let mut payload = serde_json::Map::new();
        payload.insert("correlation_id".to_string(), correlation_id.clone().into());
        payload.insert(
            "tool_call".to_string(),
            serde_json::json!({ "name": request.name, "args": request.args }),
        );

        let matcher_id = correlation_id.clone();
        let response = self
            .config
            .message_bus()
            .request(
                MessageBusType::ToolConfirmationRequest,
                payload,
                MessageBusType::ToolConfirmationResponse,
                move |message| {
                    message
                        .payload
                        .get("correlation_id")
                        .and_then(serde_json::Value::as_str)
                        == Some(matcher_id.as_str())
                },
            )
            .await;

        let Ok(response) = response else {
            return ToolConfirmationOutcome::Cancel;
        };

        if let Some(outcome) = response
            .payload
            .get("outcome")
            .and_then(serde_json::Value::as_str)
            .and_then(|raw| serde_json::from_value::<ToolConfirmationOutcome>(serde_json::Value::String(raw.to_string())).ok())
        {
            return outcome;
        }

        let confirmed = response
            .payload
            .get("confirmed")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if confirmed {
            ToolConfirmationOutcome::ProceedOnce
        } else {
            ToolConfirmationOutcome::Cancel
        }
    }

    async fn update_policy_after_confirmation(&self, request: &ToolCallRequest, outcome: ToolConfirmationOutcome) {
        if outcome != ToolConfirmationOutcome::ProceedAlways {
            return;
        }
        self.config.policy_engine_mut().await.add_rule(
            PolicyRule::new(request.name.clone(), PolicyDecision::Allow)
                .with_priority(PRIORITY_CONFIRMED)
                .with_source(DYNAMIC_CONFIRMED_SOURCE),
        );
    }
}

fn error_call(request: ToolCallRequest, error: impl Into<String>, error_type: &str) -> CompletedToolCall {
    CompletedToolCall {
        response: ToolCallResponse {
            call_id: request.call_id.clone(),
            result_display: None,
            error: Some(error.into()),
            error_type: Some(error_type.to_string()),
            data: None,
        },
        status: CoreToolCallStatus::Error,
        request,
    }
}
