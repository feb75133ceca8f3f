//! CEL expression validation, compatible with ValidatingAdmissionPolicy
//! style rules: a list of boolean expressions evaluated against `object`,
//! `oldObject`, `request` and optional `params`/`variables` bindings.

use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::Value;
use tracing::debug;

use crate::clients::ResourceClient;
use crate::context::substitution::substitute_message;
use crate::context::EvaluationContext;
use crate::errors::EngineError;
use crate::policy::CelValidation;
use crate::validate::Verdict;

/// Evaluate every expression in order; the first one returning `false`
/// fails the rule. Compile and evaluation problems are engine errors, not
/// policy failures.
pub async fn check_cel(
    ctx: &EvaluationContext,
    resource_client: &dyn ResourceClient,
    cel: &CelValidation,
) -> Result<Verdict, EngineError> {
    let params = match &cel.param_ref {
        Some(param_ref) => {
            let namespace = param_ref
                .namespace
                .as_deref()
                .or_else(|| ctx.request().namespace.as_deref());
            let resolved = resource_client
                .get_resource(
                    &param_ref.api_version,
                    &param_ref.kind,
                    namespace,
                    &param_ref.name,
                )
                .await?;
            Some(resolved)
        }
        None => None,
    };

    let request_value =
        serde_json::to_value(ctx.request()).map_err(|e| EngineError::ExpressionEvaluation {
            expression: "request".to_string(),
            reason: e.to_string(),
        })?;

    let mut cel_ctx = Context::default();
    bind(&mut cel_ctx, "request", request_value)?;
    bind(
        &mut cel_ctx,
        "object",
        ctx.resource().cloned().unwrap_or(Value::Null),
    )?;
    bind(
        &mut cel_ctx,
        "oldObject",
        ctx.old_resource().cloned().unwrap_or(Value::Null),
    )?;
    if let Some(params) = params {
        bind(&mut cel_ctx, "params", params)?;
    }

    // declared variables evaluate eagerly, in order, each visible to the
    // ones after it under `variables.<name>`
    let mut variables = serde_json::Map::new();
    for variable in &cel.variables {
        bind(
            &mut cel_ctx,
            "variables",
            Value::Object(variables.clone()),
        )?;
        let value = evaluate(&cel_ctx, &variable.expression)?;
        variables.insert(variable.name.clone(), cel_to_json(&variable.expression, value)?);
    }
    bind(&mut cel_ctx, "variables", Value::Object(variables))?;

    for expression in &cel.expressions {
        let value = evaluate(&cel_ctx, &expression.expression)?;
        match value {
            CelValue::Bool(true) => {}
            CelValue::Bool(false) => {
                debug!(expression = %expression.expression, "cel expression denied the request");
                let message = expression
                    .message
                    .as_deref()
                    .map(|m| substitute_message(ctx, m))
                    .unwrap_or_else(|| {
                        format!("expression \"{}\" evaluated to false", expression.expression)
                    });
                return Ok(Verdict::Fail(message));
            }
            other => {
                return Err(EngineError::ExpressionEvaluation {
                    expression: expression.expression.clone(),
                    reason: format!("expected a boolean result, got {other:?}"),
                })
            }
        }
    }

    Ok(Verdict::Pass)
}

fn bind(cel_ctx: &mut Context, name: &str, value: Value) -> Result<(), EngineError> {
    cel_ctx
        .add_variable(name, value)
        .map_err(|e| EngineError::ExpressionEvaluation {
            expression: name.to_string(),
            reason: format!("{e:?}"),
        })
}

fn evaluate(cel_ctx: &Context, expression: &str) -> Result<CelValue, EngineError> {
    let program = Program::compile(expression).map_err(|e| EngineError::ExpressionCompile {
        expression: expression.to_string(),
        reason: format!("{e:?}"),
    })?;
    program
        .execute(cel_ctx)
        .map_err(|e| EngineError::ExpressionEvaluation {
            expression: expression.to_string(),
            reason: format!("{e:?}"),
        })
}

fn cel_to_json(expression: &str, value: CelValue) -> Result<Value, EngineError> {
    value
        .json()
        .map_err(|e| EngineError::ExpressionEvaluation {
            expression: expression.to_string(),
            reason: format!("{e:?}"),
        })
}
