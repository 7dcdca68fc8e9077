use regex::Regex;
use tracing::debug;

use crate::types::{stable_json, ApprovalMode, CheckResult, PolicyCheckInput, PolicyDecision, PolicyRule};

/// Matches a `run_shell_command` `command` string containing an unquoted
/// redirection operator or command substitution: `>`, `>>`, `<`, `|`,
/// backticks, or `$(...)`.
///
/// This is a heuristic, not a shell parser: it is deliberately
/// conservative, matching the source's own "best effort" downgrade rather
/// than attempting to fully tokenize shell syntax.
fn shell_redirection_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r">{1,2}|<|\||`|\$\(").expect("static regex is valid"))
}

fn is_wildcard_pattern(name: &str) -> bool {
    name.ends_with("__*")
}

fn matches_wildcard(pattern: &str, tool_name: &str) -> bool {
    let prefix = &pattern[..pattern.len() - 3];
    tool_name.starts_with(&format!("{prefix}__"))
}

/// A prioritized, mode-aware, interactivity-aware rule set deciding
/// whether a tool call may proceed.
#[derive(Debug)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    default_decision: PolicyDecision,
    non_interactive: bool,
    approval_mode: ApprovalMode,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_decision: PolicyDecision::AskUser,
            non_interactive: false,
            approval_mode: ApprovalMode::Default,
        }
    }

    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        let mut engine = Self::new();
        for rule in rules {
            engine.add_rule(rule);
        }
        engine
    }

    pub fn set_approval_mode(&mut self, mode: ApprovalMode) {
        self.approval_mode = mode;
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        self.approval_mode
    }

    pub fn set_non_interactive(&mut self, non_interactive: bool) {
        self.non_interactive = non_interactive;
    }

    pub fn non_interactive(&self) -> bool {
        self.non_interactive
    }

    /// Append a rule and re-sort the rule set descending by priority.
    /// Stable sort preserves insertion order among equal priorities, so
    /// ties resolve to "first inserted wins".
    pub fn add_rule(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
        self.rules
            .sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Whether a rule named `tool_name` exists. When `ignore_dynamic` is
    /// set, rules sourced from the agent registry's dynamic registration
    /// are skipped — used to let user-authored rules suppress dynamic
    /// ones without being shadowed by them in return.
    pub fn has_rule_for_tool(&self, tool_name: &str, ignore_dynamic: bool) -> bool {
        self.rules.iter().any(|rule| {
            if rule.tool_name.as_deref() != Some(tool_name) {
                return false;
            }
            if ignore_dynamic && rule.source.as_deref() == Some(super::AGENT_REGISTRY_DYNAMIC_SOURCE) {
                return false;
            }
            true
        })
    }

    /// Remove rules for `tool_name`. When `source` is given, only rules
    /// from that exact source are removed; otherwise every rule for the
    /// tool is removed.
    pub fn remove_rules_for_tool(&mut self, tool_name: &str, source: Option<&str>) {
        self.rules.retain(|rule| {
            if rule.tool_name.as_deref() != Some(tool_name) {
                return true;
            }
            match source {
                None => false,
                Some(source) => rule.source.as_deref() != Some(source),
            }
        });
    }

    /// Evaluate `input` against the rule set and return the resulting
    /// decision, applying the shell-redirection downgrade and the
    /// non-interactive collapse.
    pub fn check(&self, input: &PolicyCheckInput) -> CheckResult {
        let stringified_args = stable_json(&serde_json::Value::Object(input.args.clone()));

        for rule in &self.rules {
            if let Some(modes) = &rule.modes {
                if !modes.is_empty() && !modes.contains(&self.approval_mode) {
                    continue;
                }
            }

            if let Some(tool_name) = &rule.tool_name {
                let matches = if is_wildcard_pattern(tool_name) {
                    matches_wildcard(tool_name, &input.name)
                } else {
                    tool_name == &input.name
                };
                if !matches {
                    continue;
                }
            }

            if let Some(pattern) = &rule.args_pattern {
                if !pattern.is_match(&stringified_args) {
                    continue;
                }
            }

            let decision = self.resolve_decision(&input.name, &input.args, rule.decision, Some(rule));
            debug!(
                tool_name = %input.name,
                decision = ?decision,
                source = ?rule.source,
                "policy_check"
            );
            return CheckResult {
                decision,
                matched_rule: Some(rule.clone()),
            };
        }

        let decision = self.resolve_decision(&input.name, &input.args, self.default_decision, None);
        debug!(tool_name = %input.name, decision = ?decision, source = "default", "policy_check");
        CheckResult {
            decision,
            matched_rule: None,
        }
    }

    /// Apply the shell-redirection downgrade and non-interactive collapse
    /// on top of a rule's (or the default's) raw decision.
    fn resolve_decision(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, serde_json::Value>,
        decision: PolicyDecision,
        rule: Option<&PolicyRule>,
    ) -> PolicyDecision {
        let mut decision = decision;

        if decision == PolicyDecision::Allow
            && tool_name == "run_shell_command"
            && self.should_downgrade_for_redirection(args, rule)
        {
            decision = PolicyDecision::AskUser;
        }

        if self.non_interactive && decision == PolicyDecision::AskUser {
            decision = PolicyDecision::Deny;
        }

        decision
    }

    fn should_downgrade_for_redirection(
        &self,
        args: &serde_json::Map<String, serde_json::Value>,
        rule: Option<&PolicyRule>,
    ) -> bool {
        if matches!(self.approval_mode, ApprovalMode::AutoEdit | ApprovalMode::Yolo) {
            return false;
        }
        if rule.map(|r| r.allow_redirection).unwrap_or(false) {
            return false;
        }
        let Some(serde_json::Value::String(command)) = args.get("command") else {
            return false;
        };
        shell_redirection_pattern().is_match(command)
    }
}
