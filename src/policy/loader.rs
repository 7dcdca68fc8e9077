use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::types::{ApprovalMode, PolicyDecision, PolicyRule};

/// The rules successfully parsed from a set of policy files, plus any
/// per-rule or per-file errors encountered along the way. A file with
/// errors does not prevent other files (or other rules in the same file)
/// from loading.
#[derive(Debug, Default)]
pub struct PolicyLoadResult {
    pub rules: Vec<PolicyRule>,
    pub errors: Vec<String>,
}

/// `effective = tier + raw_priority / 1000`.
pub fn transform_priority(priority: i64, tier: i64) -> f64 {
    tier as f64 + (priority as f64) / 1000.0
}

fn iter_policy_files(path: &Path) -> Vec<PathBuf> {
    if !path.exists() {
        return Vec::new();
    }
    if path.is_file() && path.extension().map(|ext| ext == "toml").unwrap_or(false) {
        return vec![path.to_path_buf()];
    }
    if path.is_dir() {
        let mut files: Vec<PathBuf> = match fs::read_dir(path) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.is_file() && p.extension().map(|ext| ext == "toml").unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        return files;
    }
    Vec::new()
}

fn parse_approval_mode(raw: &str) -> Option<ApprovalMode> {
    match raw {
        "default" => Some(ApprovalMode::Default),
        "autoEdit" => Some(ApprovalMode::AutoEdit),
        "yolo" => Some(ApprovalMode::Yolo),
        "plan" => Some(ApprovalMode::Plan),
        _ => None,
    }
}

fn parse_decision(raw: &str) -> Option<PolicyDecision> {
    match raw {
        "allow" => Some(PolicyDecision::Allow),
        "deny" => Some(PolicyDecision::Deny),
        "ask_user" => Some(PolicyDecision::AskUser),
        _ => None,
    }
}

/// `toolName` may be absent (catch-all, one `None`), a single string, or
/// an array of strings.
fn as_tool_names(raw: Option<&toml::Value>) -> Result<Vec<Option<String>>, String> {
    match raw {
        None => Ok(vec![None]),
        Some(toml::Value::String(s)) => Ok(vec![Some(s.clone())]),
        Some(toml::Value::Array(items)) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    toml::Value::String(s) => names.push(Some(s.clone())),
                    _ => return Err("toolName must be a string or a list of strings".to_string()),
                }
            }
            Ok(names)
        }
        Some(_) => Err("toolName must be a string or a list of strings".to_string()),
    }
}

/// `commandPrefix`/`commandRegex` may be a single string or an array of
/// strings; normalize to a `Vec<String>`.
fn as_string_list(raw: &toml::Value) -> Option<Vec<String>> {
    match raw {
        toml::Value::String(s) => Some(vec![s.clone()]),
        toml::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    toml::Value::String(s) => out.push(s.clone()),
                    _ => return None,
                }
            }
            Some(out)
        }
        _ => None,
    }
}

fn parse_rule(
    raw_rule: &toml::Value,
    tier: i64,
    source: &str,
) -> Result<Vec<PolicyRule>, String> {
    let table = raw_rule.as_table().ok_or_else(|| "rule must be an object".to_string())?;

    let decision_raw = table
        .get("decision")
        .and_then(toml::Value::as_str)
        .ok_or_else(|| "decision is required".to_string())?;
    let decision = parse_decision(decision_raw)
        .ok_or_else(|| format!("invalid decision '{decision_raw}'"))?;

    let priority_raw = table
        .get("priority")
        .and_then(toml::Value::as_integer)
        .ok_or_else(|| "priority is required and must be an integer".to_string())?;
    if !(0..=999).contains(&priority_raw) {
        return Err("priority must be in range [0, 999]".to_string());
    }

    let modes = match table.get("modes") {
        None => None,
        Some(toml::Value::Array(items)) => {
            let mut parsed = Vec::with_capacity(items.len());
            for item in items {
                let raw = item.as_str().ok_or_else(|| "modes must be an array of strings".to_string())?;
                parsed.push(parse_approval_mode(raw).ok_or_else(|| format!("invalid mode '{raw}'"))?);
            }
            Some(parsed)
        }
        Some(_) => return Err("modes must be an array".to_string()),
    };

    let args_pattern_raw = table.get("argsPattern").and_then(toml::Value::as_str);
    let command_prefix_raw = table.get("commandPrefix");
    let command_regex_raw = table.get("commandRegex");

    let tool_names = as_tool_names(table.get("toolName"))?;
    let mcp_name = table.get("mcpName").and_then(toml::Value::as_str);
    let allow_redirection = table.get("allow_redirection").and_then(toml::Value::as_bool).unwrap_or(false);
    let deny_message = table.get("deny_message").and_then(toml::Value::as_str).map(str::to_string);

    if command_prefix_raw.is_some() || command_regex_raw.is_some() {
        if args_pattern_raw.is_some() {
            return Err("argsPattern cannot be combined with commandPrefix/commandRegex".to_string());
        }
        if command_prefix_raw.is_some() && command_regex_raw.is_some() {
            return Err("commandPrefix and commandRegex are mutually exclusive".to_string());
        }
        let is_shell_tool =
            matches!(table.get("toolName"), Some(toml::Value::String(s)) if s == "run_shell_command");
        if !is_shell_tool {
            return Err(
                "commandPrefix/commandRegex can only be used with toolName = \"run_shell_command\""
                    .to_string(),
            );
        }

        let mut rules = Vec::new();
        if let Some(raw) = command_prefix_raw {
            let prefixes = as_string_list(raw)
                .ok_or_else(|| "commandPrefix must be a string or a list of strings".to_string())?;
            for prefix in prefixes {
                let escaped = regex::escape(&prefix);
                let pattern = Regex::new(&format!(r#""command":"\s*{escaped}[^"]*"#))
                    .map_err(|e| format!("invalid generated regex for commandPrefix: {e}"))?;
                rules.push(
                    PolicyRule::new("run_shell_command", decision)
                        .with_priority(transform_priority(priority_raw, tier))
                        .with_allow_redirection(allow_redirection)
                        .with_source(source.to_string())
                        .patch(|rule| {
                            rule.args_pattern = Some(pattern);
                            rule.modes = modes.clone();
                            rule.deny_message = deny_message.clone();
                        }),
                );
            }
        } else if let Some(raw) = command_regex_raw {
            let regexes = as_string_list(raw)
                .ok_or_else(|| "commandRegex must be a string or a list of strings".to_string())?;
            for inner in regexes {
                let pattern = Regex::new(&format!(r#""command":"\s*(?:{inner})[^"]*"#))
                    .map_err(|e| format!("invalid commandRegex '{inner}': {e}"))?;
                rules.push(
                    PolicyRule::new("run_shell_command", decision)
                        .with_priority(transform_priority(priority_raw, tier))
                        .with_allow_redirection(allow_redirection)
                        .with_source(source.to_string())
                        .patch(|rule| {
                            rule.args_pattern = Some(pattern);
                            rule.modes = modes.clone();
                            rule.deny_message = deny_message.clone();
                        }),
                );
            }
        }
        return Ok(rules);
    }

    let args_pattern = match args_pattern_raw {
        None => None,
        Some(raw) => Some(Regex::new(raw).map_err(|e| format!("invalid argsPattern '{raw}': {e}"))?),
    };

    let mut rules = Vec::with_capacity(tool_names.len());
    for tool_name in tool_names {
        let effective_tool_name = match mcp_name {
            Some(mcp) => match &tool_name {
                Some(name) => Some(format!("{mcp}__{name}")),
                None => Some(format!("{mcp}__*")),
            },
            None => tool_name,
        };
        rules.push(PolicyRule {
            tool_name: effective_tool_name,
            decision,
            priority: transform_priority(priority_raw, tier),
            modes: modes.clone(),
            args_pattern: args_pattern.clone(),
            allow_redirection,
            deny_message: deny_message.clone(),
            source: Some(source.to_string()),
        });
    }
    Ok(rules)
}

/// Parse every `*.toml` file under `policy_paths` (file or directory) into
/// a flat `PolicyLoadResult`, assigning each file's rules a tier via
/// `get_policy_tier`.
pub fn load_policies_from_toml(
    policy_paths: &[PathBuf],
    get_policy_tier: impl Fn(&Path) -> i64,
) -> PolicyLoadResult {
    let mut result = PolicyLoadResult::default();

    for base_path in policy_paths {
        for file_path in iter_policy_files(base_path) {
            let content = match fs::read_to_string(&file_path) {
                Ok(content) => content,
                Err(e) => {
                    result
                        .errors
                        .push(format!("{}: failed to read file: {e}", file_path.display()));
                    continue;
                }
            };
            let parsed: toml::Value = match toml::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    result
                        .errors
                        .push(format!("{}: failed to parse TOML: {e}", file_path.display()));
                    continue;
                }
            };

            let raw_rules = match parsed.get("rule") {
                None => continue,
                Some(toml::Value::Array(items)) => items,
                Some(_) => {
                    result.errors.push(format!("{}: 'rule' must be an array", file_path.display()));
                    continue;
                }
            };

            let tier = get_policy_tier(&file_path);
            let source = file_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file_path.display().to_string());

            for (index, raw_rule) in raw_rules.iter().enumerate() {
                match parse_rule(raw_rule, tier, &source) {
                    Ok(mut rules) => result.rules.append(&mut rules),
                    Err(message) => result.errors.push(format!(
                        "{}: rule #{}: {message}",
                        file_path.display(),
                        index + 1
                    )),
                }
            }
        }
    }

    result
}

trait PatchExt {
    fn patch(self, f: impl FnOnce(&mut Self)) -> Self;
}

impl PatchExt for PolicyRule {
    fn patch(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_policy(dir: &std::path::Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn tier_priority_transformation() {
        let dir = tempfile_dir();
        let path = write_policy(
            &dir,
            "test.toml",
            r#"
[[rule]]
toolName = "read_file"
decision = "allow"
priority = 70
modes = ["plan"]
"#,
        );

        let result = load_policies_from_toml(&[path], |_| 1);
        assert!(result.errors.is_empty());
        assert_eq!(result.rules.len(), 1);
        assert!((result.rules[0].priority - 1.07).abs() < 1e-9);
    }

    #[test]
    fn tool_array_expands_rules() {
        let dir = tempfile_dir();
        let path = write_policy(
            &dir,
            "array.toml",
            r#"
[[rule]]
toolName = ["glob", "grep_search"]
decision = "allow"
priority = 50
"#,
        );

        let result = load_policies_from_toml(&[path], |_| 1);
        assert!(result.errors.is_empty());
        let mut names: Vec<&str> = result.rules.iter().filter_map(|r| r.tool_name.as_deref()).collect();
        names.sort();
        assert_eq!(names, vec!["glob", "grep_search"]);
    }

    #[test]
    fn command_prefix_expands_shell_rules() {
        let dir = tempfile_dir();
        let path = write_policy(
            &dir,
            "shell_prefix.toml",
            r#"
[[rule]]
toolName = "run_shell_command"
commandPrefix = ["git status", "ls"]
decision = "allow"
priority = 50
"#,
        );

        let result = load_policies_from_toml(&[path], |_| 1);
        assert!(result.errors.is_empty());
        assert_eq!(result.rules.len(), 2);
        assert!(result.rules.iter().all(|r| r.args_pattern.is_some()));
        assert!(result
            .rules
            .iter()
            .any(|r| r.args_pattern.as_ref().unwrap().as_str().contains("git")));
        assert!(result
            .rules
            .iter()
            .any(|r| r.args_pattern.as_ref().unwrap().as_str().contains("ls")));
    }

    #[test]
    fn command_prefix_rejects_non_shell_tool() {
        let dir = tempfile_dir();
        let path = write_policy(
            &dir,
            "invalid_shell_prefix.toml",
            r#"
[[rule]]
toolName = "read_file"
commandPrefix = "git status"
decision = "allow"
priority = 50
"#,
        );

        let result = load_policies_from_toml(&[path], |_| 1);
        assert!(result.rules.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("commandPrefix/commandRegex can only be used"));
    }

    #[test]
    fn command_prefix_conflicts_with_args_pattern() {
        let dir = tempfile_dir();
        let path = write_policy(
            &dir,
            "shell_conflict.toml",
            r#"
[[rule]]
toolName = "run_shell_command"
commandPrefix = "git status"
argsPattern = "x"
decision = "allow"
priority = 50
"#,
        );

        let result = load_policies_from_toml(&[path], |_| 1);
        assert!(result.rules.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("argsPattern cannot be combined"));
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dispatch-core-policy-loader-test-{}",
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
