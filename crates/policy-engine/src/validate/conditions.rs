//! Key/operator/value condition trees, shared by rule preconditions, deny
//! validations and attestation predicate checks.
//!
//! Keys and values go through variable substitution first. A key whose
//! variables cannot be resolved because the referenced path is absent makes
//! the condition evaluate to false instead of erroring, so rules can test
//! optional fields.

use serde_json::Value;

use crate::context::substitution::substitute_value;
use crate::context::EvaluationContext;
use crate::errors::EngineError;
use crate::policy::{AnyAllConditions, Condition, ConditionOperator};
use crate::wildcard::wildcard_match;

/// The result of evaluating a condition tree: whether it holds, and the
/// message of the deciding condition when one is declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionsVerdict {
    pub matched: bool,
    pub message: Option<String>,
}

/// Evaluate an any/all tree. The `all` block must hold entirely and the
/// `any` block, when present, must have at least one holding condition. An
/// empty tree holds trivially.
pub fn evaluate_conditions(
    ctx: &EvaluationContext,
    conditions: &AnyAllConditions,
) -> Result<ConditionsVerdict, EngineError> {
    for condition in &conditions.all {
        if !evaluate_condition(ctx, condition)? {
            return Ok(ConditionsVerdict {
                matched: false,
                message: condition.message.clone(),
            });
        }
    }

    if !conditions.any.is_empty() {
        for condition in &conditions.any {
            if evaluate_condition(ctx, condition)? {
                return Ok(ConditionsVerdict {
                    matched: true,
                    message: condition.message.clone(),
                });
            }
        }
        // none of the alternatives held; report the first declared message
        let message = conditions.any.iter().find_map(|c| c.message.clone());
        return Ok(ConditionsVerdict {
            matched: false,
            message,
        });
    }

    // every `all` condition held; deny rules fire on this outcome, so the
    // first declared message travels with it
    Ok(ConditionsVerdict {
        matched: true,
        message: conditions.all.iter().find_map(|c| c.message.clone()),
    })
}

/// True when the (optional) preconditions of a rule or foreach body hold.
pub fn preconditions_hold(
    ctx: &EvaluationContext,
    preconditions: Option<&AnyAllConditions>,
) -> Result<bool, EngineError> {
    match preconditions {
        None => Ok(true),
        Some(tree) => Ok(evaluate_conditions(ctx, tree)?.matched),
    }
}

fn evaluate_condition(
    ctx: &EvaluationContext,
    condition: &Condition,
) -> Result<bool, EngineError> {
    let key = match substitute_value(ctx, &condition.key) {
        Ok(key) => key,
        // an absent path means the condition cannot hold, not that the
        // rule is broken
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let value = match substitute_value(ctx, &condition.value) {
        Ok(value) => value,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    apply_operator(&key, condition.operator, &value)
}

fn apply_operator(
    key: &Value,
    operator: ConditionOperator,
    value: &Value,
) -> Result<bool, EngineError> {
    use ConditionOperator::*;
    match operator {
        Equals => Ok(values_equal(key, value)),
        NotEquals => Ok(!values_equal(key, value)),
        In => {
            let set = as_list(value, "In")?;
            Ok(set.iter().any(|member| values_equal(key, member)))
        }
        NotIn => {
            let set = as_list(value, "NotIn")?;
            Ok(!set.iter().any(|member| values_equal(key, member)))
        }
        AnyIn => {
            let keys = as_list(key, "AnyIn")?;
            let set = as_list(value, "AnyIn")?;
            Ok(keys
                .iter()
                .any(|k| set.iter().any(|member| values_equal(k, member))))
        }
        AllIn => {
            let keys = as_list(key, "AllIn")?;
            let set = as_list(value, "AllIn")?;
            Ok(!keys.is_empty()
                && keys
                    .iter()
                    .all(|k| set.iter().any(|member| values_equal(k, member))))
        }
        AllNotIn => {
            let keys = as_list(key, "AllNotIn")?;
            let set = as_list(value, "AllNotIn")?;
            Ok(keys
                .iter()
                .all(|k| !set.iter().any(|member| values_equal(k, member))))
        }
        GreaterThan | GreaterThanOrEquals | LessThan | LessThanOrEquals => {
            let (a, b) = match (as_number(key), as_number(value)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EngineError::MalformedCondition(format!(
                        "ordering comparison requires numeric operands, got {key} and {value}"
                    )))
                }
            };
            Ok(match operator {
                GreaterThan => a > b,
                GreaterThanOrEquals => a >= b,
                LessThan => a < b,
                LessThanOrEquals => a <= b,
                _ => unreachable!(),
            })
        }
        DurationGreaterThan
        | DurationGreaterThanOrEquals
        | DurationLessThan
        | DurationLessThanOrEquals => {
            let (a, b) = match (as_duration_seconds(key), as_duration_seconds(value)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EngineError::MalformedCondition(format!(
                        "duration comparison requires duration operands, got {key} and {value}"
                    )))
                }
            };
            Ok(match operator {
                DurationGreaterThan => a > b,
                DurationGreaterThanOrEquals => a >= b,
                DurationLessThan => a < b,
                DurationLessThanOrEquals => a <= b,
                _ => unreachable!(),
            })
        }
    }
}

/// Equality with numeric coercion; string expected values may carry `*`/`?`
/// wildcards.
fn values_equal(key: &Value, value: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(key), as_number(value)) {
        return a == b;
    }
    match (key, value) {
        (Value::String(actual), Value::String(expected)) => wildcard_match(expected, actual),
        _ => key == value,
    }
}

/// A duration operand in seconds: a bare number counts as seconds, a
/// string must be a duration literal like `90s`, `1h30m` or `300ms`.
fn as_duration_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_duration_seconds(s.trim()),
        _ => None,
    }
}

fn parse_duration_seconds(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    let mut total = 0.0;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let units = [
            ("ns", 1e-9),
            ("us", 1e-6),
            ("µs", 1e-6),
            ("ms", 1e-3),
            ("s", 1.0),
            ("m", 60.0),
            ("h", 3600.0),
        ];
        let (suffix, factor) = units
            .iter()
            .find(|(suffix, _)| rest.starts_with(suffix))?;
        total += amount * factor;
        rest = &rest[suffix.len()..];
    }
    Some(total)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// A set operand: a JSON list, or a single scalar treated as a one-element
/// list.
fn as_list<'a>(value: &'a Value, operator: &str) -> Result<Vec<&'a Value>, EngineError> {
    match value {
        Value::Array(items) => Ok(items.iter().collect()),
        Value::Null | Value::Object(_) => Err(EngineError::MalformedCondition(format!(
            "operator {operator} requires a list operand, got {value}"
        ))),
        scalar => Ok(vec![scalar]),
    }
}
