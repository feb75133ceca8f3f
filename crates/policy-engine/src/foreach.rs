//! Foreach iteration: repeated evaluation of a rule body over a JSON list
//! resolved from the context.
//!
//! Iteration walks elements in declaration order, or back to front when
//! descending order is requested (raw strategic-merge patches imply it,
//! since removing array elements must not shift the indices of elements
//! still to be visited). The original element index is reported either way.
//! Each element runs under `reset` to the enclosing checkpoint, so element
//! bindings never leak to siblings.

use std::future::Future;
use std::pin::Pin;

use json_patch::PatchOperation;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::loader::ContextLoader;
use crate::context::substitution::substitute_str;
use crate::context::EvaluationContext;
use crate::errors::EngineError;
use crate::mutate;
use crate::policy::{ElementScope, ForEach, Validation};
use crate::validate::conditions::preconditions_hold;
use crate::validate::{check_declarative, Verdict};

/// Nested foreach declarations beyond this depth abort the rule.
pub const MAX_FOREACH_DEPTH: usize = 10;

type BoxedResult<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

struct IterationOutcome {
    executed: usize,
    verdict: Option<Verdict>,
}

/// Validate every foreach declaration of a validation body.
///
/// Returns `None` when no element executed at all, which the dispatcher
/// reports as "rule not applicable" rather than pass.
pub async fn validate_foreach(
    loader: &ContextLoader<'_>,
    ctx: &mut EvaluationContext,
    validation: &Validation,
) -> Result<Option<Verdict>, EngineError> {
    let outcome =
        run_validation_list(loader, ctx, validation, &validation.foreach, 0).await?;
    if outcome.executed == 0 && outcome.verdict.is_none() {
        return Ok(None);
    }
    Ok(Some(outcome.verdict.unwrap_or(Verdict::Pass)))
}

fn run_validation_list<'a>(
    loader: &'a ContextLoader<'a>,
    ctx: &'a mut EvaluationContext,
    validation: &'a Validation,
    declarations: &'a [ForEach],
    depth: usize,
) -> BoxedResult<'a, IterationOutcome> {
    Box::pin(async move {
        if depth >= MAX_FOREACH_DEPTH {
            return Err(EngineError::ForeachTooDeep(MAX_FOREACH_DEPTH));
        }

        let mut executed = 0;
        for declaration in declarations {
            let Some(elements) = resolve_list(ctx, &declaration.list)? else {
                debug!(list = %declaration.list, "foreach list is absent, skipping");
                continue;
            };

            ctx.checkpoint();
            let result = iterate_validation(
                loader,
                ctx,
                validation,
                declaration,
                &elements,
                depth,
            )
            .await;
            ctx.restore()?;

            let outcome = result?;
            executed += outcome.executed;
            if let Some(Verdict::Fail(message)) = outcome.verdict {
                return Ok(IterationOutcome {
                    executed,
                    verdict: Some(Verdict::Fail(message)),
                });
            }
        }
        Ok(IterationOutcome {
            executed,
            verdict: (executed > 0).then_some(Verdict::Pass),
        })
    })
}

async fn iterate_validation(
    loader: &ContextLoader<'_>,
    ctx: &mut EvaluationContext,
    validation: &Validation,
    declaration: &ForEach,
    elements: &[Value],
    depth: usize,
) -> Result<IterationOutcome, EngineError> {
    let mut executed = 0;
    let mut tolerated_error: Option<EngineError> = None;
    let total = elements.len();

    for (position, index) in iteration_indices(total, declaration.is_descending()) {
        let element = &elements[index];
        ctx.reset();
        bind_element(ctx, declaration, element, index);
        loader.load(ctx, &declaration.context).await?;

        if !preconditions_hold(ctx, declaration.preconditions.as_ref())? {
            debug!(index, "foreach element preconditions not met");
            continue;
        }

        let result = if declaration.foreach.is_empty() {
            evaluate_element_body(ctx, validation, declaration)
                .await
                .map(|verdict| (verdict, 1))
        } else {
            run_validation_list(loader, ctx, validation, &declaration.foreach, depth + 1)
                .await
                .map(|nested| {
                    let verdict = nested.verdict.unwrap_or_else(|| {
                        Verdict::Skip("no nested element executed".to_string())
                    });
                    (verdict, nested.executed)
                })
        };

        match result.map(|(verdict, ran)| {
            executed += match verdict {
                Verdict::Pass => ran,
                _ => 0,
            };
            verdict
        }) {
            Ok(Verdict::Pass) => {}
            Ok(Verdict::Skip(message)) => {
                debug!(index, detail = %message, "foreach element not applicable");
            }
            Ok(Verdict::Fail(message)) => {
                return Ok(IterationOutcome {
                    executed,
                    verdict: Some(Verdict::Fail(format!("element {index}: {message}"))),
                });
            }
            Err(e) => {
                // one mid-iteration error is tolerated; a second, or an
                // error on the final element, aborts the rule
                let is_last = position + 1 == total;
                if is_last || tolerated_error.is_some() {
                    return Err(e);
                }
                warn!(index, error = %e, "tolerating foreach element error");
                tolerated_error = Some(e);
            }
        }
    }

    Ok(IterationOutcome {
        executed,
        verdict: None,
    })
}

async fn evaluate_element_body(
    ctx: &mut EvaluationContext,
    validation: &Validation,
    declaration: &ForEach,
) -> Result<Verdict, EngineError> {
    let body = Validation {
        message: validation.message.clone(),
        pattern: declaration.pattern.clone(),
        any_pattern: declaration.any_pattern.clone(),
        deny: declaration.deny.clone(),
        ..Default::default()
    };
    match check_declarative(ctx, &body)? {
        Some(verdict) => Ok(verdict),
        None => Err(EngineError::EmptyRule(
            "foreach body declares no pattern, anyPattern or deny check".to_string(),
        )),
    }
}

/// Patches produced by the foreach declarations of a mutation body, always
/// reported in ascending element order.
#[derive(Debug, Default)]
pub struct ForeachMutation {
    pub patches: Vec<PatchOperation>,
    pub patched: Value,
    pub executed: usize,
}

pub async fn mutate_foreach(
    loader: &ContextLoader<'_>,
    ctx: &mut EvaluationContext,
    declarations: &[ForEach],
) -> Result<Option<ForeachMutation>, EngineError> {
    let Some(resource) = ctx.resource().cloned() else {
        return Ok(None);
    };
    let mut outcome = ForeachMutation {
        patches: Vec::new(),
        patched: resource,
        executed: 0,
    };
    run_mutation_list(loader, ctx, declarations, &mut outcome, 0).await?;
    if outcome.executed == 0 {
        return Ok(None);
    }
    Ok(Some(outcome))
}

fn run_mutation_list<'a>(
    loader: &'a ContextLoader<'a>,
    ctx: &'a mut EvaluationContext,
    declarations: &'a [ForEach],
    outcome: &'a mut ForeachMutation,
    depth: usize,
) -> BoxedResult<'a, ()> {
    Box::pin(async move {
        if depth >= MAX_FOREACH_DEPTH {
            return Err(EngineError::ForeachTooDeep(MAX_FOREACH_DEPTH));
        }

        for declaration in declarations {
            let Some(elements) = resolve_list(ctx, &declaration.list)? else {
                debug!(list = %declaration.list, "foreach list is absent, skipping");
                continue;
            };
            let descending = declaration.is_descending();

            ctx.checkpoint();
            let result = async {
                let mut element_patches: Vec<Vec<PatchOperation>> = Vec::new();
                for (_, index) in iteration_indices(elements.len(), descending) {
                    let element = &elements[index];
                    ctx.reset();
                    bind_element(ctx, declaration, element, index);
                    loader.load(ctx, &declaration.context).await?;

                    if !preconditions_hold(ctx, declaration.preconditions.as_ref())? {
                        continue;
                    }

                    if !declaration.foreach.is_empty() {
                        run_mutation_list(loader, ctx, &declaration.foreach, outcome, depth + 1)
                            .await?;
                        continue;
                    }

                    let step = if let Some(text) = &declaration.patches_json6902 {
                        mutate::apply_patches_json6902(ctx, &outcome.patched, text)?
                    } else if let Some(overlay) = &declaration.patch_strategic_merge {
                        mutate::apply_strategic_merge(ctx, &outcome.patched, overlay)?
                    } else {
                        return Err(EngineError::EmptyRule(
                            "foreach body declares no patch".to_string(),
                        ));
                    };
                    outcome.patched = step.patched;
                    outcome.executed += 1;
                    element_patches.push(step.patches);
                }

                // descending iteration collected patches back to front;
                // emit them in ascending element order
                if descending {
                    element_patches.reverse();
                }
                outcome
                    .patches
                    .extend(element_patches.into_iter().flatten());
                Ok(())
            }
            .await;
            ctx.restore()?;
            result?;
        }
        Ok(())
    })
}

/// (position within the walk, original element index) pairs.
fn iteration_indices(
    len: usize,
    descending: bool,
) -> Box<dyn Iterator<Item = (usize, usize)> + Send> {
    if descending {
        Box::new((0..len).rev().enumerate().map(|(pos, idx)| (pos, idx)))
    } else {
        Box::new((0..len).enumerate().map(|(pos, idx)| (pos, idx)))
    }
}

fn bind_element(
    ctx: &mut EvaluationContext,
    declaration: &ForEach,
    element: &Value,
    index: usize,
) {
    ctx.bind_element(element.clone(), index);
    if declaration.element_scope != Some(ElementScope::Nested) {
        ctx.bind_resource(element.clone());
    }
}

/// Resolve the list expression, either a bare query or a `{{ ... }}`
/// marker. An unresolvable path yields `None` (nothing to iterate); any
/// other value than a list is an error.
fn resolve_list(
    ctx: &EvaluationContext,
    expression: &str,
) -> Result<Option<Vec<Value>>, EngineError> {
    let resolved = if expression.contains("{{") {
        match substitute_str(ctx, expression) {
            Ok(value) => value,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    } else {
        match ctx.query(expression) {
            Ok(value) => value,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    };

    match resolved {
        Value::Array(items) => Ok(Some(items)),
        Value::Null => Ok(None),
        _ => Err(EngineError::ForeachListNotAnArray {
            expression: expression.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_request;
    use serde_json::json;

    mod fakes {
        use async_trait::async_trait;
        use k8s_openapi::api::core::v1::ConfigMap;
        use oci_distribution::Reference;
        use serde_json::Value;

        use crate::clients::errors::{ClientError, RegistryError};
        use crate::clients::{
            AttestationStatement, ConfigmapResolver, ImageDescriptor, RegistryClient,
            ResourceClient, SignatureLayer,
        };

        pub struct NoopResourceClient;

        #[async_trait]
        impl ResourceClient for NoopResourceClient {
            async fn get_resource(
                &self,
                _api_version: &str,
                kind: &str,
                namespace: Option<&str>,
                name: &str,
            ) -> Result<Value, ClientError> {
                Err(ClientError::NotFound {
                    kind: kind.to_string(),
                    namespace: namespace.unwrap_or_default().to_string(),
                    name: name.to_string(),
                })
            }

            async fn list_resources(
                &self,
                _api_version: &str,
                _kind: &str,
                _namespace: Option<&str>,
            ) -> Result<Vec<Value>, ClientError> {
                Ok(vec![])
            }

            async fn api_call(&self, url_path: &str) -> Result<Value, ClientError> {
                Err(ClientError::Api(format!("no route for {url_path}")))
            }

            async fn can_i(
                &self,
                _kind: &str,
                _namespace: &str,
                _verb: &str,
                _subresource: &str,
                _user: &str,
            ) -> Result<bool, ClientError> {
                Ok(true)
            }
        }

        pub struct NoopRegistryClient;

        #[async_trait]
        impl RegistryClient for NoopRegistryClient {
            async fn fetch_descriptor(
                &self,
                image: &Reference,
            ) -> Result<ImageDescriptor, RegistryError> {
                Err(RegistryError::NotFound(image.whole()))
            }

            async fn fetch_signature_layers(
                &self,
                image: &Reference,
            ) -> Result<Vec<SignatureLayer>, RegistryError> {
                Err(RegistryError::NotFound(image.whole()))
            }

            async fn fetch_attestation_statements(
                &self,
                image: &Reference,
            ) -> Result<Vec<AttestationStatement>, RegistryError> {
                Err(RegistryError::NotFound(image.whole()))
            }
        }

        pub struct NoopConfigmapResolver;

        #[async_trait]
        impl ConfigmapResolver for NoopConfigmapResolver {
            async fn get(
                &self,
                namespace: &str,
                name: &str,
            ) -> Result<ConfigMap, ClientError> {
                Err(ClientError::NotFound {
                    kind: "ConfigMap".to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
        }
    }

    fn loader_parts() -> (
        fakes::NoopResourceClient,
        fakes::NoopRegistryClient,
        fakes::NoopConfigmapResolver,
    ) {
        (
            fakes::NoopResourceClient,
            fakes::NoopRegistryClient,
            fakes::NoopConfigmapResolver,
        )
    }

    fn validation(value: serde_json::Value) -> Validation {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn empty_list_produces_no_response() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx =
            EvaluationContext::new(test_request(json!({"spec": {"containers": []}}))).unwrap();

        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "pattern": {"image": "ghcr.io/*"}
        }]}));

        let outcome = validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn absent_list_produces_no_response() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {}}))).unwrap();

        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "pattern": {"image": "ghcr.io/*"}
        }]}));

        let outcome = validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn all_elements_passing_yields_one_pass() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "a", "image": "ghcr.io/acme/a:v1"},
            {"name": "b", "image": "ghcr.io/acme/b:v1"}
        ]}})))
        .unwrap();

        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "pattern": {"image": "ghcr.io/*"}
        }]}));

        let outcome = validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();
        assert_eq!(outcome, Some(Verdict::Pass));
    }

    #[tokio::test]
    async fn first_failing_element_reports_its_index() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "a", "image": "ghcr.io/acme/a:v1"},
            {"name": "b", "image": "docker.io/library/b:v1"}
        ]}})))
        .unwrap();

        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "pattern": {"image": "ghcr.io/*"}
        }]}));

        match validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap()
        {
            Some(Verdict::Fail(message)) => assert!(message.starts_with("element 1:")),
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn preconditions_skip_elements_without_error() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "init", "image": "docker.io/library/busybox"},
            {"name": "app", "image": "ghcr.io/acme/app:v1"}
        ]}})))
        .unwrap();

        // only elements named app are checked; the busybox element is gated
        // out and must not fail the rule
        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "preconditions": {"all": [
                {"key": "{{ element.name }}", "operator": "Equals", "value": "app"}
            ]},
            "pattern": {"image": "ghcr.io/*"}
        }]}));

        let outcome = validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();
        assert_eq!(outcome, Some(Verdict::Pass));
    }

    #[tokio::test]
    async fn element_scope_root_validates_the_element_itself() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "a", "securityContext": {"privileged": false}}
        ]}})))
        .unwrap();

        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "elementScope": "root",
            "pattern": {"securityContext": {"privileged": false}}
        }]}));

        let outcome = validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();
        assert_eq!(outcome, Some(Verdict::Pass));
    }

    #[tokio::test]
    async fn element_scope_nested_keeps_the_resource_binding() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({
            "metadata": {"labels": {"app": "web"}},
            "spec": {"containers": [{"name": "a", "image": "ghcr.io/acme/a:v1"}]}
        })))
        .unwrap();

        // the pattern targets the whole object, not the container element
        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "elementScope": "nested",
            "pattern": {"metadata": {"labels": {"app": "?*"}}}
        }]}));

        let outcome = validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();
        assert_eq!(outcome, Some(Verdict::Pass));
    }

    #[tokio::test]
    async fn element_bindings_do_not_leak_after_iteration() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "a", "image": "ghcr.io/acme/a:v1"}
        ]}})))
        .unwrap();

        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "pattern": {"image": "ghcr.io/*"}
        }]}));
        validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();

        assert!(ctx.query("element").unwrap_err().is_not_found());
        assert!(ctx.query("elementIndex").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn nested_foreach_flattens_into_the_parent() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "a", "ports": [{"containerPort": 8080}, {"containerPort": 8443}]},
            {"name": "b", "ports": [{"containerPort": 9090}]}
        ]}})))
        .unwrap();

        let validation = validation(json!({"foreach": [{
            "list": "object.spec.containers",
            "foreach": [{
                "list": "element.ports",
                "deny": {"conditions": {"all": [
                    {"key": "{{ element.containerPort }}", "operator": "LessThan", "value": 1024}
                ]}}
            }]
        }]}));

        let outcome = validate_foreach(&loader, &mut ctx, &validation)
            .await
            .unwrap();
        assert_eq!(outcome, Some(Verdict::Pass));
    }

    #[tokio::test]
    async fn mutation_collects_patches_per_element() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "a", "image": "app"},
            {"name": "b", "image": "sidecar"}
        ]}})))
        .unwrap();

        let declarations: Vec<ForEach> = serde_json::from_value(json!([{
            "list": "object.spec.containers",
            "patchesJson6902": "- op: replace\n  path: /spec/containers/{{ elementIndex }}/image\n  value: \"registry.local/{{ element.image }}\"\n"
        }]))
        .unwrap();

        let outcome = mutate_foreach(&loader, &mut ctx, &declarations)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.executed, 2);
        assert_eq!(outcome.patches.len(), 2);
        assert_eq!(
            outcome.patched["spec"]["containers"][0]["image"],
            json!("registry.local/app")
        );
        assert_eq!(
            outcome.patched["spec"]["containers"][1]["image"],
            json!("registry.local/sidecar")
        );
    }

    #[tokio::test]
    async fn descending_mutation_reports_patches_in_ascending_order() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = EvaluationContext::new(test_request(json!({"spec": {"containers": [
            {"name": "a", "image": "app"},
            {"name": "b", "image": "sidecar"}
        ]}})))
        .unwrap();

        let declarations: Vec<ForEach> = serde_json::from_value(json!([{
            "list": "object.spec.containers",
            "order": "descending",
            "patchesJson6902": "- op: add\n  path: /spec/containers/{{ elementIndex }}/tagged\n  value: true\n"
        }]))
        .unwrap();

        let outcome = mutate_foreach(&loader, &mut ctx, &declarations)
            .await
            .unwrap()
            .unwrap();
        let paths: Vec<String> = outcome
            .patches
            .iter()
            .map(|op| serde_json::to_value(op).unwrap()["path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            paths,
            vec!["/spec/containers/0/tagged", "/spec/containers/1/tagged"]
        );
    }

    #[tokio::test]
    async fn mutation_over_an_empty_list_is_none() {
        let (rc, reg, cm) = loader_parts();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx =
            EvaluationContext::new(test_request(json!({"spec": {"containers": []}}))).unwrap();

        let declarations: Vec<ForEach> = serde_json::from_value(json!([{
            "list": "object.spec.containers",
            "patchesJson6902": "- op: add\n  path: /x\n  value: 1\n"
        }]))
        .unwrap();

        let outcome = mutate_foreach(&loader, &mut ctx, &declarations)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
