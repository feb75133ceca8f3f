//! Declarative validation checks: structural patterns, alternative
//! patterns, deny condition trees and subset assertions.
//!
//! The CEL and Pod Security flavors live in their own modules; foreach
//! bodies reuse the checks here per element.

pub mod assert;
pub mod conditions;
pub mod pattern;

use crate::context::substitution::{substitute_message, substitute_value};
use crate::context::EvaluationContext;
use crate::errors::EngineError;
use crate::policy::Validation;
use conditions::evaluate_conditions;
use pattern::ViolationKind;

/// Outcome of one declarative check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    Skip(String),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Run the declarative checks of a validation against the currently bound
/// resource. Returns `None` when the validation declares none of them (it
/// is CEL, Pod Security or foreach based, handled by the caller).
pub fn check_declarative(
    ctx: &EvaluationContext,
    validation: &Validation,
) -> Result<Option<Verdict>, EngineError> {
    let Some(resource) = ctx.resource().cloned() else {
        return Ok(Some(Verdict::Skip(
            "the request carries no resource to validate".to_string(),
        )));
    };

    if let Some(declared) = &validation.pattern {
        let pattern = substitute_value(ctx, declared)?;
        return Ok(Some(pattern_verdict(
            ctx,
            validation,
            pattern::match_pattern(&resource, &pattern),
        )));
    }

    if let Some(declared) = &validation.any_pattern {
        let mut patterns = Vec::with_capacity(declared.len());
        for p in declared {
            patterns.push(substitute_value(ctx, p)?);
        }
        return Ok(Some(pattern_verdict(
            ctx,
            validation,
            pattern::match_any_pattern(&resource, &patterns),
        )));
    }

    if let Some(deny) = &validation.deny {
        let verdict = evaluate_conditions(ctx, &deny.conditions)?;
        if verdict.matched {
            let message = verdict
                .message
                .or_else(|| validation.message.clone())
                .map(|m| substitute_message(ctx, &m))
                .unwrap_or_else(|| "request denied".to_string());
            return Ok(Some(Verdict::Fail(message)));
        }
        return Ok(Some(Verdict::Pass));
    }

    if let Some(declared) = &validation.assert {
        let assertion = substitute_value(ctx, declared)?;
        return Ok(Some(pattern_verdict(
            ctx,
            validation,
            assert::match_assert(&resource, &assertion),
        )));
    }

    Ok(None)
}

fn pattern_verdict(
    ctx: &EvaluationContext,
    validation: &Validation,
    outcome: Result<(), pattern::PatternViolation>,
) -> Verdict {
    match outcome {
        Ok(()) => Verdict::Pass,
        Err(violation) => {
            let detail = if violation.path.is_empty() {
                violation.message.clone()
            } else {
                format!("{} (path: {})", violation.message, violation.path)
            };
            match violation.kind {
                ViolationKind::Skip => Verdict::Skip(detail),
                ViolationKind::Fail => {
                    let message = match &validation.message {
                        Some(m) => format!("{}: {detail}", substitute_message(ctx, m)),
                        None => detail,
                    };
                    Verdict::Fail(message)
                }
            }
        }
    }
}

/// Fold a fresh verdict into an aggregate, keeping the most severe outcome.
/// Fail dominates, then pass; an aggregate is skip only when every part
/// skipped.
pub(crate) fn combine(aggregate: Option<Verdict>, next: Verdict) -> Verdict {
    match (aggregate, next) {
        (None, v) => v,
        (Some(Verdict::Fail(m)), _) | (Some(_), Verdict::Fail(m)) => Verdict::Fail(m),
        (Some(Verdict::Pass), _) | (Some(Verdict::Skip(_)), Verdict::Pass) => Verdict::Pass,
        (Some(Verdict::Skip(m)), Verdict::Skip(_)) => Verdict::Skip(m),
    }
}
