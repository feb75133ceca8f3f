//! Structural comparison of a resource against a policy-authored pattern.
//!
//! Pattern values support `*`/`?` wildcards, `|`-separated alternatives,
//! operator-prefixed scalars (`>`, `<`, `>=`, `<=`, `!`) and numeric ranges
//! (`N-M`). Pattern keys support anchors:
//!
//! - `(field)` conditional: when the field is absent or does not match, the
//!   surrounding branch is pruned (skip-class, not a failure);
//! - `=(field)` equality: the field must exist and match;
//! - `^(field)` existence: at least one element of the list field matches;
//! - `X(field)` negation: the field must not be present;
//! - `<(field)` global: when it does not match, the whole pattern is
//!   skipped.
//!
//! The matcher returns the first violating path, depth-first in declaration
//! order, not the full set of violations.

use serde_json::Value;

use crate::wildcard::wildcard_match;

/// Whether a violation counts against the resource or just marks the
/// pattern as inapplicable. Skip-class violations come from anchors whose
/// referenced field is absent or differs, not from wrong values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternViolation {
    pub kind: ViolationKind,
    pub path: String,
    pub message: String,
}

impl PatternViolation {
    fn fail(path: &str, message: String) -> Self {
        PatternViolation {
            kind: ViolationKind::Fail,
            path: path.to_string(),
            message,
        }
    }

    fn skip(path: &str, message: String) -> Self {
        PatternViolation {
            kind: ViolationKind::Skip,
            path: path.to_string(),
            message,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Anchor {
    Plain,
    Conditional,
    Equality,
    Existence,
    Negation,
    Global,
}

fn parse_anchor(key: &str) -> (Anchor, &str) {
    let strip = |k: &'static str| {
        key.strip_prefix(k)
            .and_then(|rest| rest.strip_suffix(')'))
    };
    if let Some(inner) = strip("=(") {
        return (Anchor::Equality, inner);
    }
    if let Some(inner) = strip("^(") {
        return (Anchor::Existence, inner);
    }
    if let Some(inner) = strip("X(") {
        return (Anchor::Negation, inner);
    }
    if let Some(inner) = strip("<(") {
        return (Anchor::Global, inner);
    }
    if let Some(inner) = key.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
        return (Anchor::Conditional, inner);
    }
    (Anchor::Plain, key)
}

/// Match `resource` against `pattern`, returning the first violation.
pub fn match_pattern(resource: &Value, pattern: &Value) -> Result<(), PatternViolation> {
    match_at(resource, pattern, "")
}

/// Evaluate every alternative; pass on the first success. With zero
/// successes the aggregate is skip only when every alternative's failure was
/// itself skip-class; any fail-class failure forces fail.
pub fn match_any_pattern(
    resource: &Value,
    patterns: &[Value],
) -> Result<(), PatternViolation> {
    let mut violations = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        match match_at(resource, pattern, "") {
            Ok(()) => return Ok(()),
            Err(v) => violations.push(v),
        }
    }

    let all_skips = violations.iter().all(|v| v.kind == ViolationKind::Skip);
    let detail = violations
        .iter()
        .map(|v| format!("{} ({})", v.message, v.path))
        .collect::<Vec<_>>()
        .join("; ");
    if all_skips {
        Err(PatternViolation::skip(
            "",
            format!("no alternative applied: {detail}"),
        ))
    } else {
        Err(PatternViolation::fail(
            "",
            format!("no alternative matched: {detail}"),
        ))
    }
}

fn match_at(resource: &Value, pattern: &Value, path: &str) -> Result<(), PatternViolation> {
    match pattern {
        Value::Object(map) => match_object(resource, map, path),
        Value::Array(items) => match_array(resource, items, path),
        _ => match_leaf(resource, pattern, path),
    }
}

fn match_object(
    resource: &Value,
    pattern: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<(), PatternViolation> {
    let Value::Object(resource_map) = resource else {
        return Err(PatternViolation::fail(
            path,
            format!("expected an object, found {}", type_name(resource)),
        ));
    };

    // global anchors first: a non-matching global prunes the whole pattern
    for (key, value) in pattern {
        let (anchor, field) = parse_anchor(key);
        if anchor != Anchor::Global {
            continue;
        }
        let child_path = join(path, field);
        match resource_map.get(field) {
            None => {
                return Err(PatternViolation::skip(
                    &child_path,
                    format!("global anchor field \"{field}\" is absent"),
                ))
            }
            Some(actual) => {
                if let Err(v) = match_at(actual, value, &child_path) {
                    return Err(PatternViolation::skip(&child_path, v.message));
                }
            }
        }
    }

    // conditional anchors gate the remaining siblings
    for (key, value) in pattern {
        let (anchor, field) = parse_anchor(key);
        if anchor != Anchor::Conditional {
            continue;
        }
        let child_path = join(path, field);
        match resource_map.get(field) {
            None => {
                return Err(PatternViolation::skip(
                    &child_path,
                    format!("condition field \"{field}\" is absent"),
                ))
            }
            Some(actual) => {
                if let Err(v) = match_at(actual, value, &child_path) {
                    return Err(PatternViolation::skip(&child_path, v.message));
                }
            }
        }
    }

    for (key, value) in pattern {
        let (anchor, field) = parse_anchor(key);
        let child_path = join(path, field);
        match anchor {
            Anchor::Global | Anchor::Conditional => {}
            Anchor::Negation => {
                if resource_map.contains_key(field) {
                    return Err(PatternViolation::fail(
                        &child_path,
                        format!("field \"{field}\" is not allowed"),
                    ));
                }
            }
            Anchor::Existence => {
                let Some(Value::Array(elements)) = resource_map.get(field) else {
                    return Err(PatternViolation::fail(
                        &child_path,
                        format!("list \"{field}\" is missing"),
                    ));
                };
                if !exists_in(elements, value, &child_path) {
                    return Err(PatternViolation::fail(
                        &child_path,
                        format!("no element of \"{field}\" matches the pattern"),
                    ));
                }
            }
            Anchor::Equality | Anchor::Plain => match resource_map.get(field) {
                None => {
                    return Err(PatternViolation::fail(
                        &child_path,
                        format!("required field \"{field}\" is missing"),
                    ))
                }
                Some(actual) => match_at(actual, value, &child_path)?,
            },
        }
    }
    Ok(())
}

fn exists_in(elements: &[Value], pattern: &Value, path: &str) -> bool {
    let candidates: Vec<&Value> = match pattern {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    candidates.iter().all(|candidate| {
        elements
            .iter()
            .enumerate()
            .any(|(i, el)| match_at(el, candidate, &join(path, &i.to_string())).is_ok())
    })
}

fn match_array(
    resource: &Value,
    pattern: &[Value],
    path: &str,
) -> Result<(), PatternViolation> {
    let Value::Array(elements) = resource else {
        return Err(PatternViolation::fail(
            path,
            format!("expected a list, found {}", type_name(resource)),
        ));
    };

    for pattern_element in pattern {
        match pattern_element {
            // a map pattern element constrains every element of the list
            Value::Object(_) => {
                for (i, element) in elements.iter().enumerate() {
                    match_at(element, pattern_element, &join(path, &i.to_string()))?;
                }
            }
            // scalar pattern elements require a matching member
            _ => {
                let found = elements
                    .iter()
                    .any(|el| match_leaf(el, pattern_element, path).is_ok());
                if !found {
                    return Err(PatternViolation::fail(
                        path,
                        format!("no list element matches \"{}\"", display(pattern_element)),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn match_leaf(resource: &Value, pattern: &Value, path: &str) -> Result<(), PatternViolation> {
    let matched = match pattern {
        Value::String(expected) => match_string_pattern(resource, expected),
        Value::Number(_) => numeric_equal(resource, pattern),
        Value::Bool(b) => resource.as_bool() == Some(*b),
        Value::Null => resource.is_null(),
        _ => false,
    };
    if matched {
        Ok(())
    } else {
        Err(PatternViolation::fail(
            path,
            format!(
                "expected \"{}\", found \"{}\"",
                display(pattern),
                display(resource)
            ),
        ))
    }
}

fn match_string_pattern(resource: &Value, pattern: &str) -> bool {
    // alternatives: any one of them may match
    if pattern.contains(" | ") {
        return pattern
            .split(" | ")
            .any(|alt| match_string_pattern(resource, alt.trim()));
    }

    for (prefix, cmp) in [
        (">=", Comparison::Ge),
        ("<=", Comparison::Le),
        ("!=", Comparison::Ne),
        (">", Comparison::Gt),
        ("<", Comparison::Lt),
        ("!", Comparison::Ne),
    ] {
        if let Some(rest) = pattern.strip_prefix(prefix) {
            return compare_numeric_or_string(resource, rest.trim(), cmp);
        }
    }

    // numeric range "N-M", inclusive on both ends
    if let Some((low, high)) = parse_range(pattern) {
        if let Some(actual) = as_number(resource) {
            return actual >= low && actual <= high;
        }
        return false;
    }

    match resource {
        Value::String(actual) => wildcard_match(pattern, actual),
        Value::Number(n) => wildcard_match(pattern, &n.to_string()),
        Value::Bool(b) => wildcard_match(pattern, if *b { "true" } else { "false" }),
        _ => pattern == "*" && !resource.is_null(),
    }
}

#[derive(Clone, Copy)]
enum Comparison {
    Gt,
    Lt,
    Ge,
    Le,
    Ne,
}

fn compare_numeric_or_string(resource: &Value, operand: &str, cmp: Comparison) -> bool {
    if let (Some(actual), Ok(expected)) = (as_number(resource), operand.parse::<f64>()) {
        return match cmp {
            Comparison::Gt => actual > expected,
            Comparison::Lt => actual < expected,
            Comparison::Ge => actual >= expected,
            Comparison::Le => actual <= expected,
            Comparison::Ne => actual != expected,
        };
    }
    // non-numeric operands only support inequality, as a wildcard negation
    match cmp {
        Comparison::Ne => match resource {
            Value::String(actual) => !wildcard_match(operand, actual),
            _ => true,
        },
        _ => false,
    }
}

fn parse_range(pattern: &str) -> Option<(f64, f64)> {
    let (low, high) = pattern.split_once('-')?;
    let low = low.trim().parse::<f64>().ok()?;
    let high = high.trim().parse::<f64>().ok()?;
    Some((low, high))
}

fn numeric_equal(resource: &Value, pattern: &Value) -> bool {
    match (as_number(resource), as_number(pattern)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn join(path: &str, field: &str) -> String {
    format!("{path}/{field}")
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
