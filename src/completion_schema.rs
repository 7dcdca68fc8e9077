//! A minimal recursive JSON-Schema subset, used to validate the
//! `complete_task` tool's `result` argument (and, per the sub-agent tool,
//! a sub-agent's submitted completion) against an agent's declared
//! `completion_schema`.

use regex::Regex;
use serde_json::Value;

/// Errors surfaced by [`validate_completion_output`]. The crate's public
/// surface only ever returns the formatted message string, but this type
/// exists so callers that need to distinguish malformed JSON from a
/// genuine schema mismatch can do so.
#[derive(Debug, thiserror::Error)]
pub enum CompletionSchemaError {
    #[error("{0}")]
    Invalid(String),
}

/// Validate `raw_output` against `schema`. Returns `None` when it
/// satisfies the schema, or `Some(message)` (already prefixed with
/// `"Completion output does not satisfy schema: "`) otherwise.
///
/// When `schema`'s top-level `type` is absent or `"string"`, `raw_output`
/// is validated as a raw string; for any other declared type, it is first
/// parsed as JSON.
pub fn validate_completion_output(raw_output: &str, schema: &Value) -> Option<String> {
    let expected_type = schema.get("type").and_then(Value::as_str);

    let value = if let Some(expected_type) = expected_type {
        if expected_type != "string" {
            match serde_json::from_str::<Value>(raw_output) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return Some(format!(
                        "Completion output does not satisfy schema: output must be valid JSON for schema type '{expected_type}': {err}"
                    ));
                }
            }
        } else {
            Value::String(raw_output.to_string())
        }
    } else {
        Value::String(raw_output.to_string())
    };

    validate_value(&value, schema, "$").map(|error| format!("Completion output does not satisfy schema: {error}"))
}

fn validate_value(value: &Value, schema: &Value, path: &str) -> Option<String> {
    let schema = schema.as_object()?;

    if let Some(expected_const) = schema.get("const") {
        if value != expected_const {
            return Some(format!("{path} must equal {expected_const}"));
        }
    }

    if let Some(Value::Array(enum_values)) = schema.get("enum") {
        if !enum_values.contains(value) {
            return Some(format!("{path} must be one of {}", Value::Array(enum_values.clone())));
        }
    }

    if let Some(Value::Array(all_of)) = schema.get("allOf") {
        for item_schema in all_of {
            if item_schema.is_object() {
                if let Some(error) = validate_value(value, item_schema, path) {
                    return Some(error);
                }
            }
        }
    }

    if let Some(Value::Array(any_of)) = schema.get("anyOf") {
        let matched = any_of
            .iter()
            .filter(|item| item.is_object())
            .any(|item_schema| validate_value(value, item_schema, path).is_none());
        if !matched {
            return Some(format!("{path} must match at least one schema in anyOf"));
        }
    }

    if let Some(Value::Array(one_of)) = schema.get("oneOf") {
        let match_count = one_of
            .iter()
            .filter(|item| item.is_object())
            .filter(|item_schema| validate_value(value, item_schema, path).is_none())
            .count();
        if match_count != 1 {
            return Some(format!(
                "{path} must match exactly one schema in oneOf (matched {match_count})"
            ));
        }
    }

    if let Some(not_schema) = schema.get("not") {
        if not_schema.is_object() && validate_value(value, not_schema, path).is_none() {
            return Some(format!("{path} must not match schema in not"));
        }
    }

    let Some(schema_type) = schema.get("type") else {
        return None;
    };

    if let Some(type_union) = schema_type.as_array() {
        if type_union.is_empty() {
            return Some(format!("{path} has invalid empty type union"));
        }
        let mut errors = Vec::new();
        for type_name in type_union {
            let Some(type_name) = type_name.as_str() else { continue };
            let mut candidate = schema.clone();
            candidate.insert("type".to_string(), Value::String(type_name.to_string()));
            match validate_value(value, &Value::Object(candidate), path) {
                None => return None,
                Some(error) => errors.push(error),
            }
        }
        return if errors.is_empty() {
            Some(format!("{path} has unsupported type union {type_union:?}"))
        } else {
            Some(errors.join(" or "))
        };
    }

    let Some(schema_type) = schema_type.as_str() else {
        return Some(format!("{path} has invalid type declaration"));
    };

    match schema_type {
        "string" => validate_string(value, schema, path),
        "number" => validate_number(value, schema, path, false),
        "integer" => validate_number(value, schema, path, true),
        "boolean" => {
            if value.is_boolean() {
                None
            } else {
                Some(format!("{path} must be a boolean"))
            }
        }
        "null" => {
            if value.is_null() {
                None
            } else {
                Some(format!("{path} must be null"))
            }
        }
        "array" => validate_array(value, schema, path),
        "object" => validate_object(value, schema, path),
        other => Some(format!("{path} has unsupported schema type '{other}'")),
    }
}

fn validate_string(value: &Value, schema: &serde_json::Map<String, Value>, path: &str) -> Option<String> {
    let Some(s) = value.as_str() else {
        return Some(format!("{path} must be a string"));
    };
    if let Some(min_length) = schema.get("minLength").and_then(Value::as_u64) {
        if (s.chars().count() as u64) < min_length {
            return Some(format!("{path} length must be >= {min_length}"));
        }
    }
    if let Some(max_length) = schema.get("maxLength").and_then(Value::as_u64) {
        if (s.chars().count() as u64) > max_length {
            return Some(format!("{path} length must be <= {max_length}"));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(s) {
                    return Some(format!("{path} must match pattern '{pattern}'"));
                }
            }
            Err(_) => return Some(format!("{path} has invalid regex pattern '{pattern}'")),
        }
    }
    None
}

fn validate_number(
    value: &Value,
    schema: &serde_json::Map<String, Value>,
    path: &str,
    integer: bool,
) -> Option<String> {
    if integer {
        if !value.is_i64() && !value.is_u64() {
            return Some(format!("{path} must be an integer"));
        }
    } else if !value.is_number() {
        return Some(format!("{path} must be a number"));
    }
    let number = value.as_f64()?;
    validate_numeric_constraints(number, schema, path)
}

fn validate_numeric_constraints(value: f64, schema: &serde_json::Map<String, Value>, path: &str) -> Option<String> {
    if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
        if value < minimum {
            return Some(format!("{path} must be >= {minimum}"));
        }
    }
    if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
        if value > maximum {
            return Some(format!("{path} must be <= {maximum}"));
        }
    }
    if let Some(exclusive_minimum) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
        if value <= exclusive_minimum {
            return Some(format!("{path} must be > {exclusive_minimum} (exclusiveMinimum)"));
        }
    }
    if let Some(exclusive_maximum) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
        if value >= exclusive_maximum {
            return Some(format!("{path} must be < {exclusive_maximum} (exclusiveMaximum)"));
        }
    }
    if let Some(multiple_of) = schema.get("multipleOf").and_then(Value::as_f64) {
        if multiple_of > 0.0 {
            let quotient = value / multiple_of;
            if (quotient.round() - quotient).abs() > 1e-9 {
                return Some(format!("{path} must be a multiple of {multiple_of}"));
            }
        }
    }
    None
}

fn validate_array(value: &Value, schema: &serde_json::Map<String, Value>, path: &str) -> Option<String> {
    let Some(items) = value.as_array() else {
        return Some(format!("{path} must be an array"));
    };
    if let Some(min_items) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min_items {
            return Some(format!("{path} must have at least {min_items} items"));
        }
    }
    if let Some(max_items) = schema.get("maxItems").and_then(Value::as_u64) {
        if (items.len() as u64) > max_items {
            return Some(format!("{path} must have at most {max_items} items"));
        }
    }
    if schema.get("uniqueItems").and_then(Value::as_bool) == Some(true) {
        let mut seen = std::collections::HashSet::new();
        for item in items {
            let serialized = crate::types::stable_json(item);
            if !seen.insert(serialized) {
                return Some(format!("{path} must not contain duplicate items"));
            }
        }
    }
    if let Some(item_schema) = schema.get("items") {
        if item_schema.is_object() {
            for (idx, item) in items.iter().enumerate() {
                if let Some(error) = validate_value(item, item_schema, &format!("{path}[{idx}]")) {
                    return Some(error);
                }
            }
        }
    }
    None
}

fn validate_object(value: &Value, schema: &serde_json::Map<String, Value>, path: &str) -> Option<String> {
    let Some(object) = value.as_object() else {
        return Some(format!("{path} must be an object"));
    };
    if let Some(min_properties) = schema.get("minProperties").and_then(Value::as_u64) {
        if (object.len() as u64) < min_properties {
            return Some(format!("{path} must have at least {min_properties} properties"));
        }
    }
    if let Some(max_properties) = schema.get("maxProperties").and_then(Value::as_u64) {
        if (object.len() as u64) > max_properties {
            return Some(format!("{path} must have at most {max_properties} properties"));
        }
    }
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required {
            if let Some(key) = key.as_str() {
                if !object.contains_key(key) {
                    return Some(format!("{path}.{key} is required"));
                }
            }
        }
    }

    let known_properties = schema.get("properties").and_then(Value::as_object);
    let additional_properties = schema.get("additionalProperties");

    for (key, item) in object {
        if let Some(child_schema) = known_properties.and_then(|props| props.get(key)) {
            if child_schema.is_object() {
                if let Some(error) = validate_value(item, child_schema, &format!("{path}.{key}")) {
                    return Some(error);
                }
            }
            continue;
        }
        match additional_properties {
            Some(Value::Bool(false)) => return Some(format!("{path}.{key} is not allowed")),
            Some(schema @ Value::Object(_)) => {
                if let Some(error) = validate_value(item, schema, &format!("{path}.{key}")) {
                    return Some(error);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_matching_string() {
        let schema = json!({ "type": "string", "minLength": 2 });
        assert!(validate_completion_output("ok", &schema).is_none());
    }

    #[test]
    fn rejects_short_string() {
        let schema = json!({ "type": "string", "minLength": 5 });
        let error = validate_completion_output("hi", &schema).unwrap();
        assert!(error.contains("length must be >= 5"));
    }

    #[test]
    fn rejects_invalid_json_for_object_schema() {
        let schema = json!({ "type": "object" });
        let error = validate_completion_output("not json", &schema).unwrap();
        assert!(error.contains("must be valid JSON"));
    }

    #[test]
    fn validates_nested_object_required_and_types() {
        let schema = json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["done", "failed"] },
                "count": { "type": "integer", "minimum": 0 }
            },
            "required": ["status", "count"],
            "additionalProperties": false
        });
        assert!(validate_completion_output(r#"{"status":"done","count":3}"#, &schema).is_none());
        let error = validate_completion_output(r#"{"status":"done"}"#, &schema).unwrap();
        assert!(error.contains("$.count is required"));
        let error = validate_completion_output(r#"{"status":"done","count":3,"extra":1}"#, &schema).unwrap();
        assert!(error.contains("$.extra is not allowed"));
    }

    #[test]
    fn multiple_of_respects_epsilon() {
        let schema = json!({ "type": "number", "multipleOf": 0.1 });
        assert!(validate_completion_output("0.3", &schema).is_none());
        let error = validate_completion_output("0.35", &schema).unwrap();
        assert!(error.contains("must be a multiple of"));
    }

    #[test]
    fn one_of_requires_exactly_one_match() {
        let schema = json!({
            "oneOf": [
                { "type": "string", "pattern": "^a" },
                { "type": "string", "pattern": "^b" }
            ]
        });
        assert!(validate_completion_output("apple", &schema).is_none());
        let error = validate_completion_output("cherry", &schema).unwrap();
        assert!(error.contains("matched 0"));
    }

    #[test]
    fn array_rejects_duplicates_when_unique() {
        let schema = json!({ "type": "array", "uniqueItems": true, "items": { "type": "integer" } });
        assert!(validate_completion_output("[1,2,3]", &schema).is_none());
        let error = validate_completion_output("[1,2,2]", &schema).unwrap();
        assert!(error.contains("duplicate items"));
    }
}
