//! The agent registry: tracks every discovered sub-agent definition and,
//! for enabled local/remote ones, mints a dynamic policy rule so the
//! scheduler can route calls to them without a user-authored rule.

use std::collections::BTreeMap;

use crate::config::RuntimeConfig;
use crate::policy::{AGENT_REGISTRY_DYNAMIC_SOURCE, PRIORITY_SUBAGENT_TOOL};
use crate::types::{AgentDefinition, AgentKind, PolicyDecision, PolicyRule};

/// Holds every agent definition the runtime has seen. Distinguishes
/// "discovered" (every definition ever registered, including disabled
/// ones) from "active" (enabled definitions only, exposed to the
/// scheduler as callable tools).
pub struct AgentRegistry {
    config: RuntimeConfig,
    active: BTreeMap<String, AgentDefinition>,
    discovered: BTreeMap<String, AgentDefinition>,
}

impl AgentRegistry {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            active: BTreeMap::new(),
            discovered: BTreeMap::new(),
        }
    }

    /// Register `definition`. Returns `false` (and registers nothing
    /// active) if the name or description is blank, or if the definition
    /// is disabled.
    pub async fn register_agent(&mut self, definition: AgentDefinition) -> bool {
        if definition.name.trim().is_empty() || definition.description.trim().is_empty() {
            return false;
        }

        self.discovered.insert(definition.name.clone(), definition.clone());
        if !definition.enabled {
            return false;
        }

        self.active.insert(definition.name.clone(), definition.clone());
        self.add_agent_policy(&definition).await;
        true
    }

    pub fn get_definition(&self, name: &str) -> Option<&AgentDefinition> {
        self.active.get(name)
    }

    pub fn get_discovered_definition(&self, name: &str) -> Option<&AgentDefinition> {
        self.discovered.get(name)
    }

    pub fn all_definitions(&self) -> Vec<&AgentDefinition> {
        self.active.values().collect()
    }

    pub fn all_discovered_definitions(&self) -> Vec<&AgentDefinition> {
        self.discovered.values().collect()
    }

    /// Sorted by construction: `active` is a `BTreeMap`.
    pub fn all_agent_names(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.discovered.clear();
    }

    async fn add_agent_policy(&self, definition: &AgentDefinition) {
        let mut policy_engine = self.config.policy_engine_mut().await;

        if policy_engine.has_rule_for_tool(&definition.name, true) {
            return;
        }

        policy_engine.remove_rules_for_tool(&definition.name, Some(AGENT_REGISTRY_DYNAMIC_SOURCE));

        let decision = if definition.kind == AgentKind::Local {
            PolicyDecision::Allow
        } else {
            PolicyDecision::AskUser
        };

        policy_engine.add_rule(
            PolicyRule::new(definition.name.clone(), decision)
                .with_priority(PRIORITY_SUBAGENT_TOOL)
                .with_source(AGENT_REGISTRY_DYNAMIC_SOURCE),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfigBuilder;
    use crate::types::PolicyCheckInput;

    fn unique_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("dispatch-core-registry-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn registering_local_agent_adds_allow_rule() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let mut registry = AgentRegistry::new(config.clone());
        let definition = AgentDefinition::new("researcher", "Does research").with_kind(AgentKind::Local);
        assert!(registry.register_agent(definition).await);

        let result = config.check_policy(&PolicyCheckInput::new("researcher")).await;
        assert_eq!(result.decision, PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn registering_remote_agent_adds_ask_user_rule() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let mut registry = AgentRegistry::new(config.clone());
        let definition = AgentDefinition::new("remote-helper", "Out of process").with_kind(AgentKind::Remote);
        registry.register_agent(definition).await;

        let result = config.check_policy(&PolicyCheckInput::new("remote-helper")).await;
        assert_eq!(result.decision, PolicyDecision::AskUser);
    }

    #[tokio::test]
    async fn user_authored_rule_suppresses_dynamic_registration() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        {
            let mut engine = config.policy_engine_mut().await;
            engine.add_rule(PolicyRule::new("researcher", PolicyDecision::Deny).with_priority(10.0));
        }
        let mut registry = AgentRegistry::new(config.clone());
        let definition = AgentDefinition::new("researcher", "Does research").with_kind(AgentKind::Local);
        registry.register_agent(definition).await;

        let result = config.check_policy(&PolicyCheckInput::new("researcher")).await;
        assert_eq!(result.decision, PolicyDecision::Deny);
    }

    #[tokio::test]
    async fn disabled_definition_is_discovered_but_not_active() {
        let config = RuntimeConfigBuilder::new(unique_dir())
            .load_default_policies(false)
            .build()
            .unwrap();
        let mut registry = AgentRegistry::new(config.clone());
        let definition = AgentDefinition::new("shadow", "Not enabled").with_enabled(false);
        assert!(!registry.register_agent(definition).await);
        assert!(registry.get_definition("shadow").is_none());
        assert!(registry.get_discovered_definition("shadow").is_some());
    }
}
