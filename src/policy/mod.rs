//! Prioritized policy evaluation: rule matching, shell-redirection
//! downgrade, non-interactive collapse, and dynamic rule mutation.

mod engine;
mod loader;

pub use engine::PolicyEngine;
pub use loader::{load_policies_from_toml, PolicyLoadResult};

/// Source string stamped on rules added after a `proceed_always`
/// confirmation outcome.
pub const DYNAMIC_CONFIRMED_SOURCE: &str = "Dynamic (Confirmed)";

/// Effective priority of a rule added after a `proceed_always` outcome.
pub const PRIORITY_CONFIRMED: f64 = 2.95;

/// Source string stamped on rules the agent registry adds for sub-agents.
pub const AGENT_REGISTRY_DYNAMIC_SOURCE: &str = "AgentRegistry (Dynamic)";

/// Effective priority of a rule the agent registry adds for a sub-agent.
pub const PRIORITY_SUBAGENT_TOOL: f64 = 1.05;

/// Errors raised wiring the policy engine into a [`crate::config::RuntimeConfig`].
///
/// Per-rule and per-file parsing problems are collected as strings in
/// [`PolicyLoadResult::errors`] rather than raised as this type, matching
/// the source's "collect, don't abort" loader design; this type covers
/// only the fatal "could not stand up the engine at all" case.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to load default policy files:\n{0}")]
    DefaultPoliciesFailed(String),
}
