//! `{{ expression }}` variable substitution.
//!
//! Markers are replaced by querying the evaluation context. A string that is
//! exactly one marker keeps the type of the queried value; markers embedded
//! in a larger string splice in scalars only. `\{{` escapes a literal
//! marker.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::EvaluationContext;
use crate::errors::SubstitutionError;

lazy_static! {
    static ref VARIABLE_RE: Regex =
        Regex::new(r"(\\)?\{\{([^{}]*)\}\}").expect("variable regex must compile");
}

/// Substitute every marker inside a string. Returns a non-string value only
/// when the whole input is a single unescaped marker.
pub fn substitute_str(
    ctx: &EvaluationContext,
    input: &str,
) -> Result<Value, SubstitutionError> {
    if let Some(expression) = single_marker(input) {
        let value = ctx
            .query(&expression)
            .map_err(|source| SubstitutionError::Unresolved {
                expression: expression.clone(),
                source,
            })?;
        return Ok(value);
    }

    let mut output = String::with_capacity(input.len());
    let mut last_end = 0;
    for caps in VARIABLE_RE.captures_iter(input) {
        let whole = caps.get(0).expect("group 0 always present");
        output.push_str(&input[last_end..whole.start()]);
        last_end = whole.end();

        if caps.get(1).is_some() {
            // escaped marker, emit it literally without the backslash
            output.push_str(&whole.as_str()[1..]);
            continue;
        }

        let expression = caps[2].trim().to_string();
        let value = ctx
            .query(&expression)
            .map_err(|source| SubstitutionError::Unresolved {
                expression: expression.clone(),
                source,
            })?;
        match value {
            Value::String(s) => output.push_str(&s),
            Value::Number(n) => output.push_str(&n.to_string()),
            Value::Bool(b) => output.push_str(if b { "true" } else { "false" }),
            Value::Null | Value::Array(_) | Value::Object(_) => {
                return Err(SubstitutionError::NotAScalar { expression });
            }
        }
    }
    output.push_str(&input[last_end..]);
    Ok(Value::String(output))
}

/// Substitute markers everywhere inside a JSON value, including object keys.
pub fn substitute_value(
    ctx: &EvaluationContext,
    value: &Value,
) -> Result<Value, SubstitutionError> {
    match value {
        Value::String(s) => substitute_str(ctx, s),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(ctx, item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                let key = match substitute_str(ctx, key)? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                out.insert(key, substitute_value(ctx, item)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(value.clone()),
    }
}

/// Substitute markers in a user-facing message; on failure fall back to the
/// raw text, since a broken message must never fail the rule.
pub fn substitute_message(ctx: &EvaluationContext, message: &str) -> String {
    match substitute_str(ctx, message) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => message.to_string(),
    }
}

/// When the input is exactly one unescaped `{{ ... }}` marker, return the
/// inner expression.
fn single_marker(input: &str) -> Option<String> {
    let caps = VARIABLE_RE.captures(input)?;
    let whole = caps.get(0)?;
    if caps.get(1).is_some() || whole.start() != 0 || whole.end() != input.len() {
        return None;
    }
    Some(caps[2].trim().to_string())
}
