//! The runtime composition root: wires the policy engine, tool registry,
//! message bus, and agent registry into one shared handle.

use std::path::{Path, PathBuf};
use std::sync::RwLock as StdRwLock;

use tokio::sync::RwLock;

use crate::agent_registry::AgentRegistry;
use crate::bus::MessageBus;
use crate::policy::{load_policies_from_toml, PolicyEngine, PolicyError};
use crate::tool::ToolRegistry;
use crate::types::{ApprovalMode, PolicyCheckInput, CheckResult};

/// Tier stamped on every crate-embedded default policy rule.
const DEFAULT_POLICY_TIER: i64 = 1;

/// A handful of sane defaults so a `RuntimeConfig` built with no
/// user-supplied policy files still behaves sensibly: plan-mode and
/// completion tools are always allowed, everything else falls through to
/// the engine's built-in `ask_user` default.
const EMBEDDED_DEFAULT_POLICIES: &str = r#"
[[rule]]
toolName = "enter_plan_mode"
decision = "allow"
priority = 500

[[rule]]
toolName = "exit_plan_mode"
decision = "allow"
priority = 500

[[rule]]
toolName = "complete_task"
decision = "allow"
priority = 500
"#;

/// Errors raised assembling a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("failed to create plans directory: {0}")]
    PlansDirCreation(std::io::Error),
}

struct Inner {
    target_dir: PathBuf,
    plans_dir: PathBuf,
    interactive: bool,
    approval_mode: StdRwLock<ApprovalMode>,
    approved_plan_path: StdRwLock<Option<PathBuf>>,
    policy_engine: std::sync::Arc<RwLock<PolicyEngine>>,
    tool_registry: RwLock<ToolRegistry>,
    message_bus: MessageBus,
}

/// Shared, cheaply-cloneable handle to a dispatch core's wired-up state.
///
/// Clones share the same underlying state (`Arc`-backed), matching the
/// way the rest of this codebase hands the same runtime handle to every
/// tool, scheduler task, and bus subscriber.
#[derive(Clone)]
pub struct RuntimeConfig {
    inner: std::sync::Arc<Inner>,
    agent_registry: std::sync::Arc<RwLock<Option<AgentRegistry>>>,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("target_dir", &self.inner.target_dir)
            .field("plans_dir", &self.inner.plans_dir)
            .field("interactive", &self.inner.interactive)
            .finish_non_exhaustive()
    }
}

impl RuntimeConfig {
    pub fn target_dir(&self) -> &Path {
        &self.inner.target_dir
    }

    pub fn plans_dir(&self) -> &Path {
        &self.inner.plans_dir
    }

    pub fn interactive(&self) -> bool {
        self.inner.interactive
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        *self.inner.approval_mode.read().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn set_approval_mode(&self, mode: ApprovalMode) {
        *self.inner.approval_mode.write().unwrap_or_else(|e| e.into_inner()) = mode;
        self.inner.policy_engine.write().await.set_approval_mode(mode);
    }

    pub fn approved_plan_path(&self) -> Option<PathBuf> {
        self.inner.approved_plan_path.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_approved_plan_path(&self, path: Option<PathBuf>) {
        *self.inner.approved_plan_path.write().unwrap_or_else(|e| e.into_inner()) = path;
    }

    pub fn message_bus(&self) -> &MessageBus {
        &self.inner.message_bus
    }

    pub async fn check_policy(&self, input: &PolicyCheckInput) -> CheckResult {
        self.inner.policy_engine.read().await.check(input)
    }

    pub async fn policy_engine(&self) -> tokio::sync::RwLockReadGuard<'_, PolicyEngine> {
        self.inner.policy_engine.read().await
    }

    pub async fn policy_engine_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, PolicyEngine> {
        self.inner.policy_engine.write().await
    }

    pub async fn tool_registry(&self) -> tokio::sync::RwLockReadGuard<'_, ToolRegistry> {
        self.inner.tool_registry.read().await
    }

    pub async fn tool_registry_mut(&self) -> tokio::sync::RwLockWriteGuard<'_, ToolRegistry> {
        self.inner.tool_registry.write().await
    }

    /// Lazily-initialized handle: the agent registry needs a fully
    /// constructed `RuntimeConfig` to close over, mirroring the
    /// originals' `__post_init__` two-phase construction.
    pub async fn agent_registry(&self) -> tokio::sync::OwnedRwLockReadGuard<Option<AgentRegistry>> {
        self.ensure_agent_registry().await;
        self.agent_registry.clone().read_owned().await
    }

    pub async fn agent_registry_mut(&self) -> tokio::sync::OwnedRwLockWriteGuard<Option<AgentRegistry>> {
        self.ensure_agent_registry().await;
        self.agent_registry.clone().write_owned().await
    }

    async fn ensure_agent_registry(&self) {
        let mut guard = self.agent_registry.write().await;
        if guard.is_none() {
            *guard = Some(AgentRegistry::new(self.clone()));
        }
    }
}

/// Builds a [`RuntimeConfig`], mirroring the original's `RuntimeConfig`
/// dataclass `__post_init__` wiring order: resolve `target_dir`, derive
/// `plans_dir`, optionally create it, load default policies, wire the
/// approval mode and interactivity flags into the policy engine, then
/// construct the message bus on top of the finished engine.
pub struct RuntimeConfigBuilder {
    target_dir: PathBuf,
    interactive: bool,
    plan_enabled: bool,
    approval_mode: ApprovalMode,
    load_default_policies: bool,
    extra_policy_files: Vec<PathBuf>,
}

impl RuntimeConfigBuilder {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
            interactive: true,
            plan_enabled: true,
            approval_mode: ApprovalMode::Default,
            load_default_policies: true,
            extra_policy_files: Vec::new(),
        }
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn plan_enabled(mut self, plan_enabled: bool) -> Self {
        self.plan_enabled = plan_enabled;
        self
    }

    pub fn approval_mode(mut self, approval_mode: ApprovalMode) -> Self {
        self.approval_mode = approval_mode;
        self
    }

    pub fn load_default_policies(mut self, load_default_policies: bool) -> Self {
        self.load_default_policies = load_default_policies;
        self
    }

    pub fn extra_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_policy_files.push(path.into());
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let target_dir = if self.target_dir.exists() {
            self.target_dir
                .canonicalize()
                .unwrap_or(self.target_dir)
        } else {
            self.target_dir
        };
        let plans_dir = target_dir.join(".gemini").join("tmp").join("plans");
        if self.plan_enabled {
            std::fs::create_dir_all(&plans_dir).map_err(ConfigError::PlansDirCreation)?;
        }

        let mut policy_engine = PolicyEngine::new();
        if self.load_default_policies {
            let default_dir = std::env::temp_dir().join(format!(
                "dispatch-core-default-policies-{}",
                uuid::Uuid::new_v4()
            ));
            std::fs::create_dir_all(&default_dir).map_err(ConfigError::PlansDirCreation)?;
            let default_file = default_dir.join("defaults.toml");
            std::fs::write(&default_file, EMBEDDED_DEFAULT_POLICIES)
                .map_err(ConfigError::PlansDirCreation)?;

            let mut paths = vec![default_file];
            paths.extend(self.extra_policy_files.clone());
            let loaded = load_policies_from_toml(&paths, |_| DEFAULT_POLICY_TIER);
            let _ = std::fs::remove_dir_all(&default_dir);
            if !loaded.errors.is_empty() {
                return Err(ConfigError::Policy(PolicyError::DefaultPoliciesFailed(
                    loaded.errors.join("\n"),
                )));
            }
            for rule in loaded.rules {
                policy_engine.add_rule(rule);
            }
        } else if !self.extra_policy_files.is_empty() {
            let loaded = load_policies_from_toml(&self.extra_policy_files, |_| DEFAULT_POLICY_TIER);
            if !loaded.errors.is_empty() {
                return Err(ConfigError::Policy(PolicyError::DefaultPoliciesFailed(
                    loaded.errors.join("\n"),
                )));
            }
            for rule in loaded.rules {
                policy_engine.add_rule(rule);
            }
        }

        policy_engine.set_approval_mode(self.approval_mode);
        policy_engine.set_non_interactive(!self.interactive);

        let policy_engine = std::sync::Arc::new(RwLock::new(policy_engine));
        let message_bus = MessageBus::with_policy_engine(policy_engine.clone());

        let inner = Inner {
            target_dir,
            plans_dir,
            interactive: self.interactive,
            approval_mode: StdRwLock::new(self.approval_mode),
            approved_plan_path: StdRwLock::new(None),
            policy_engine,
            tool_registry: RwLock::new(ToolRegistry::new()),
            message_bus,
        };

        Ok(RuntimeConfig {
            inner: std::sync::Arc::new(inner),
            agent_registry: std::sync::Arc::new(RwLock::new(None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_dir() -> PathBuf {
        std::env::temp_dir().join(format!("dispatch-core-config-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn builder_creates_plans_dir_and_default_policies() {
        let config = RuntimeConfigBuilder::new(unique_dir()).build().unwrap();
        assert!(config.plans_dir().ends_with("plans"));
        assert!(config.plans_dir().exists());

        let input = PolicyCheckInput::new("complete_task");
        let result = config.check_policy(&input).await;
        assert_eq!(result.decision, crate::types::PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn set_approval_mode_propagates_to_policy_engine() {
        let config = RuntimeConfigBuilder::new(unique_dir()).build().unwrap();
        config.set_approval_mode(ApprovalMode::Yolo).await;
        assert_eq!(config.approval_mode(), ApprovalMode::Yolo);
        assert_eq!(config.policy_engine().await.approval_mode(), ApprovalMode::Yolo);
    }
}
