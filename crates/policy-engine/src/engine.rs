//! The rule dispatcher: sequences exception checks, context loading,
//! preconditions and the per-rule-type handlers, then resolves the
//! validation failure action for every failing rule.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::admission::{AdmissionRequest, Operation};
use crate::cel::check_cel;
use crate::clients::{
    ConfigmapResolver, ImageVerifyCache, NoExceptions, PolicyExceptionSelector, RegistryClient,
    ResourceClient,
};
use crate::context::loader::ContextLoader;
use crate::context::EvaluationContext;
use crate::errors::EngineError;
use crate::foreach::{mutate_foreach, validate_foreach};
use crate::images::{extract_images, images_index};
use crate::mutate;
use crate::policy::{
    label_selector_matches, Mutation, PolicyException, PolicySpec, Rule, Validation,
    ValidationFailureAction,
};
use crate::pss::check_pod_security;
use crate::response::{
    ImageVerificationMetadata, PodSecurityCheck, PolicyResponse, RuleResponse, RuleType,
};
use crate::validate::{check_declarative, combine, Verdict};
use crate::verify_images::{ImageVerifier, VERIFY_ANNOTATION};
use crate::wildcard::wildcard_match;

/// Engine-wide settings independent of any one policy.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Requests from users in any of these groups bypass policy evaluation
    /// entirely (e.g. `system:nodes`).
    pub excluded_groups: Vec<String>,
    /// Wall-clock budget per rule; exceeding it yields an *error* response.
    pub rule_timeout: Option<Duration>,
}

pub struct PolicyEngine {
    resource_client: Arc<dyn ResourceClient>,
    registry_client: Arc<dyn RegistryClient>,
    configmap_resolver: Arc<dyn ConfigmapResolver>,
    verify_cache: Arc<dyn ImageVerifyCache>,
    exception_selector: Arc<dyn PolicyExceptionSelector>,
    config: EngineConfig,
}

impl PolicyEngine {
    pub fn new(
        resource_client: Arc<dyn ResourceClient>,
        registry_client: Arc<dyn RegistryClient>,
        configmap_resolver: Arc<dyn ConfigmapResolver>,
        verify_cache: Arc<dyn ImageVerifyCache>,
    ) -> Self {
        Self {
            resource_client,
            registry_client,
            configmap_resolver,
            verify_cache,
            exception_selector: Arc::new(NoExceptions),
            config: EngineConfig::default(),
        }
    }

    pub fn with_exception_selector(
        mut self,
        selector: Arc<dyn PolicyExceptionSelector>,
    ) -> Self {
        self.exception_selector = selector;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply every rule of the policy to the admission request, in
    /// declaration order. Rules that turn out not to be applicable (empty
    /// foreach lists, no matching images) produce no response at all.
    pub async fn apply(&self, policy: &PolicySpec, request: &AdmissionRequest) -> PolicyResponse {
        let mut response = PolicyResponse::new(&policy.name);
        if self.user_excluded(request) {
            debug!(policy = %policy.name, "request user is excluded from evaluation");
            return response;
        }

        let mut base_ctx = match EvaluationContext::new(request.clone()) {
            Ok(ctx) => ctx,
            Err(e) => {
                for rule in &policy.rules {
                    response.push(RuleResponse::error(
                        &rule.name,
                        rule_type_of(rule),
                        &e.to_string(),
                    ));
                }
                return response;
            }
        };

        for rule in &policy.rules {
            let started = Instant::now();
            let mut ctx = base_ctx.copy();
            let result = match self.config.rule_timeout {
                Some(budget) => {
                    match tokio::time::timeout(budget, self.evaluate_rule(policy, rule, &mut ctx))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::DeadlineExceeded(format!(
                            "evaluating rule \"{}\"",
                            rule.name
                        ))),
                    }
                }
                None => self.evaluate_rule(policy, rule, &mut ctx).await,
            };

            let rule_response = match result {
                Ok(Some(rule_response)) => rule_response,
                Ok(None) => {
                    debug!(rule = %rule.name, "rule not applicable, no response emitted");
                    continue;
                }
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "rule evaluation errored");
                    RuleResponse::error(&rule.name, rule_type_of(rule), &e.to_string())
                }
            };

            // later rules evaluate against the mutated resource
            if !rule_response.patches.is_empty() {
                if let Some(mut resource) = base_ctx.resource().cloned() {
                    if json_patch::patch(&mut resource, &rule_response.patches).is_ok() {
                        base_ctx.bind_resource(resource);
                    }
                }
            }

            response.push(rule_response.with_stats(started.elapsed()));
        }
        response
    }

    fn user_excluded(&self, request: &AdmissionRequest) -> bool {
        if self.config.excluded_groups.is_empty() {
            return false;
        }
        request
            .user_info
            .groups
            .iter()
            .flatten()
            .any(|group| self.config.excluded_groups.contains(group))
    }

    async fn evaluate_rule(
        &self,
        policy: &PolicySpec,
        rule: &Rule,
        ctx: &mut EvaluationContext,
    ) -> Result<Option<RuleResponse>, EngineError> {
        let rule_type = rule_type_of(rule);
        if rule.mutate.is_none() && rule.validate.is_none() && rule.verify_images.is_empty() {
            return Err(EngineError::EmptyRule(rule.name.clone()));
        }

        let (skip_exception, exception_action) =
            self.matching_exceptions(policy, rule, ctx.request()).await?;
        if let Some(exception) = skip_exception {
            return Ok(Some(
                RuleResponse::skip(
                    &rule.name,
                    rule_type,
                    &format!("rule skipped due to policy exception \"{exception}\""),
                )
                .with_exception(&exception),
            ));
        }

        let loader = ContextLoader::new(
            &*self.resource_client,
            &*self.registry_client,
            &*self.configmap_resolver,
        );
        loader.load(ctx, &rule.context).await?;

        if let Some(preconditions) = &rule.preconditions {
            let verdict = crate::validate::conditions::evaluate_conditions(ctx, preconditions)?;
            if !verdict.matched {
                let detail = verdict
                    .message
                    .map(|m| format!("; {m}"))
                    .unwrap_or_default();
                return Ok(Some(RuleResponse::skip(
                    &rule.name,
                    rule_type,
                    &format!("preconditions not met{detail}"),
                )));
            }
        }

        if !rule.verify_images.is_empty() {
            return self
                .evaluate_verify_images(policy, rule, exception_action, ctx)
                .await;
        }
        if let Some(mutation) = &rule.mutate {
            return self.evaluate_mutation(rule, mutation, &loader, ctx).await;
        }
        let validation = rule.validate.as_ref().expect("checked above");
        self.evaluate_validation(policy, rule, validation, exception_action, &loader, ctx)
            .await
    }

    /// Fetch and partition the exceptions naming this (policy, rule) pair
    /// and matching the resource: one that plainly skips the rule, and the
    /// strongest failure-action override among the rest.
    async fn matching_exceptions(
        &self,
        policy: &PolicySpec,
        rule: &Rule,
        request: &AdmissionRequest,
    ) -> Result<(Option<String>, Option<ValidationFailureAction>), EngineError> {
        let exceptions = self
            .exception_selector
            .exceptions_for(&policy.name, &rule.name)
            .await?;
        if exceptions.is_empty() {
            return Ok((None, None));
        }

        let labels = resource_labels(request);
        let kind = request.kind.kind.as_str();
        let applicable: Vec<&PolicyException> = exceptions
            .iter()
            .filter(|e| e.references(&policy.name, &rule.name))
            .filter(|e| {
                e.matches(
                    kind,
                    request.namespace.as_deref(),
                    request.name.as_deref(),
                    &labels,
                )
            })
            .collect();

        let skip = applicable
            .iter()
            .find(|e| e.failure_action.is_none())
            .map(|e| e.name.clone());
        let action = applicable.iter().find_map(|e| e.failure_action);
        Ok((skip, action))
    }

    async fn evaluate_mutation(
        &self,
        rule: &Rule,
        mutation: &Mutation,
        loader: &ContextLoader<'_>,
        ctx: &mut EvaluationContext,
    ) -> Result<Option<RuleResponse>, EngineError> {
        if !mutation.foreach.is_empty() {
            return match mutate_foreach(loader, ctx, &mutation.foreach).await? {
                None => Ok(None),
                Some(outcome) => Ok(Some(
                    RuleResponse::pass(&rule.name, RuleType::Mutation, "resource mutated")
                        .with_patches(outcome.patches),
                )),
            };
        }

        let Some(resource) = ctx.resource().cloned() else {
            return Ok(Some(RuleResponse::skip(
                &rule.name,
                RuleType::Mutation,
                "the request carries no resource to mutate",
            )));
        };

        let outcome = if let Some(text) = &mutation.patches_json6902 {
            mutate::apply_patches_json6902(ctx, &resource, text)?
        } else if let Some(overlay) = &mutation.patch_strategic_merge {
            mutate::apply_strategic_merge(ctx, &resource, overlay)?
        } else {
            return Err(EngineError::EmptyRule(rule.name.clone()));
        };

        if outcome.is_noop() {
            return Ok(Some(RuleResponse::skip(
                &rule.name,
                RuleType::Mutation,
                "mutation left the resource unchanged",
            )));
        }
        Ok(Some(
            RuleResponse::pass(&rule.name, RuleType::Mutation, "resource mutated")
                .with_patches(outcome.patches),
        ))
    }

    async fn evaluate_validation(
        &self,
        policy: &PolicySpec,
        rule: &Rule,
        validation: &Validation,
        exception_action: Option<ValidationFailureAction>,
        loader: &ContextLoader<'_>,
        ctx: &mut EvaluationContext,
    ) -> Result<Option<RuleResponse>, EngineError> {
        let (verdict, checks) = self
            .validation_verdict(rule, validation, loader, ctx)
            .await?;
        let Some(verdict) = verdict else {
            return Ok(None);
        };

        let action = resolve_failure_action(
            policy,
            validation.failure_action,
            exception_action,
            ctx.request(),
        );

        let response = match verdict {
            Verdict::Pass => RuleResponse::pass(&rule.name, RuleType::Validation, "rule passed"),
            Verdict::Skip(message) => {
                RuleResponse::skip(&rule.name, RuleType::Validation, &message)
            }
            Verdict::Fail(message) => {
                if self.downgrade_existing_violation(
                    rule, validation, loader, ctx, action, &message,
                )
                .await?
                {
                    RuleResponse::skip(
                        &rule.name,
                        RuleType::Validation,
                        "violation pre-exists on the old object, not newly introduced",
                    )
                } else {
                    RuleResponse::fail(&rule.name, RuleType::Validation, &message)
                }
            }
        };
        Ok(Some(
            response
                .with_failure_action(action)
                .with_pod_security_checks(checks),
        ))
    }

    async fn validation_verdict(
        &self,
        rule: &Rule,
        validation: &Validation,
        loader: &ContextLoader<'_>,
        ctx: &mut EvaluationContext,
    ) -> Result<(Option<Verdict>, Vec<PodSecurityCheck>), EngineError> {
        if !validation.foreach.is_empty() {
            return Ok((validate_foreach(loader, ctx, validation).await?, Vec::new()));
        }
        if let Some(pod_security) = &validation.pod_security {
            let (verdict, checks) = check_pod_security(ctx, pod_security)?;
            return Ok((Some(verdict), checks));
        }
        if let Some(cel) = &validation.cel {
            let verdict = check_cel(ctx, &*self.resource_client, cel).await?;
            return Ok((Some(verdict), Vec::new()));
        }
        match check_declarative(ctx, validation)? {
            Some(verdict) => Ok((Some(verdict), Vec::new())),
            None => Err(EngineError::EmptyRule(rule.name.clone())),
        }
    }

    /// On UPDATE, an enforced failure is downgraded when the old object
    /// already violated the rule identically: the request does not
    /// introduce the violation, it merely preserves it.
    async fn downgrade_existing_violation(
        &self,
        rule: &Rule,
        validation: &Validation,
        loader: &ContextLoader<'_>,
        ctx: &mut EvaluationContext,
        action: ValidationFailureAction,
        new_message: &str,
    ) -> Result<bool, EngineError> {
        if !validation.allow_existing_violations
            || action != ValidationFailureAction::Enforce
            || ctx.request().operation != Operation::Update
        {
            return Ok(false);
        }
        let Some(old_object) = ctx.request().old_object.clone() else {
            return Ok(false);
        };

        ctx.checkpoint();
        ctx.bind_request_override(old_object, Operation::Create);
        let old_run = self.validation_verdict(rule, validation, loader, ctx).await;
        ctx.restore()?;

        match old_run {
            Ok((Some(Verdict::Fail(old_message)), _)) => Ok(old_message == new_message),
            // the old object passing, skipping or erroring means the
            // violation is newly introduced
            _ => Ok(false),
        }
    }

    async fn evaluate_verify_images(
        &self,
        policy: &PolicySpec,
        rule: &Rule,
        exception_action: Option<ValidationFailureAction>,
        ctx: &mut EvaluationContext,
    ) -> Result<Option<RuleResponse>, EngineError> {
        let Some(resource) = ctx.resource().cloned() else {
            return Ok(Some(RuleResponse::skip(
                &rule.name,
                RuleType::ImageVerify,
                "the request carries no resource to verify",
            )));
        };

        let images = extract_images(&resource);
        ctx.bind_images(images_index(&images));

        let verifier = ImageVerifier::new(
            &*self.registry_client,
            &*self.verify_cache,
            &policy.name,
            &rule.name,
        );

        let mut patches = Vec::new();
        let mut metadata = ImageVerificationMetadata::default();
        let mut verdict: Option<Verdict> = None;
        for config in &rule.verify_images {
            let outcome = verifier.verify(ctx, &images, config).await?;
            patches.extend(outcome.patches);
            for (image, verified) in outcome.metadata.0 {
                metadata.record(&image, verified);
            }
            if let Some(v) = outcome.verdict {
                verdict = Some(combine(verdict.take(), v));
            }
        }

        let Some(verdict) = verdict else {
            return Ok(None);
        };

        let response = match verdict {
            Verdict::Pass => {
                if !metadata.is_empty() {
                    patches.push(annotation_patch(&resource, &metadata)?);
                }
                RuleResponse::pass(&rule.name, RuleType::ImageVerify, "images verified")
            }
            Verdict::Skip(message) => {
                RuleResponse::skip(&rule.name, RuleType::ImageVerify, &message)
            }
            Verdict::Fail(message) => {
                let action =
                    resolve_failure_action(policy, None, exception_action, ctx.request());
                return Ok(Some(
                    RuleResponse::fail(&rule.name, RuleType::ImageVerify, &message)
                        .with_patches(patches)
                        .with_failure_action(action),
                ));
            }
        };
        Ok(Some(response.with_patches(patches)))
    }
}

fn rule_type_of(rule: &Rule) -> RuleType {
    if !rule.verify_images.is_empty() {
        RuleType::ImageVerify
    } else if rule.mutate.is_some() {
        RuleType::Mutation
    } else {
        RuleType::Validation
    }
}

/// Resolve the failure action with precedence: exception override, then the
/// rule level setting, then the first matching policy-level namespace
/// override, then the policy default.
pub fn resolve_failure_action(
    policy: &PolicySpec,
    rule_level: Option<ValidationFailureAction>,
    exception: Option<ValidationFailureAction>,
    request: &AdmissionRequest,
) -> ValidationFailureAction {
    if let Some(action) = exception {
        return action;
    }
    if let Some(action) = rule_level {
        return action;
    }

    let namespace = request.namespace.as_deref().unwrap_or("");
    let namespace_labels = request.namespace_labels();
    for override_ in &policy.validation_failure_action_overrides {
        let by_name = override_
            .namespaces
            .iter()
            .any(|pattern| wildcard_match(pattern, namespace));
        let by_selector = override_
            .namespace_selector
            .as_ref()
            .map(|selector| label_selector_matches(selector, &namespace_labels))
            .unwrap_or(false);
        if by_name || by_selector {
            return override_.action;
        }
    }
    policy.validation_failure_action
}

fn resource_labels(request: &AdmissionRequest) -> std::collections::HashMap<String, String> {
    request
        .target_object()
        .and_then(|o| o.pointer("/metadata/labels"))
        .and_then(|labels| serde_json::from_value(labels.clone()).ok())
        .unwrap_or_default()
}

/// Patch recording the verification payload on the resource, creating the
/// annotations object when the resource has none.
fn annotation_patch(
    resource: &Value,
    metadata: &ImageVerificationMetadata,
) -> Result<json_patch::PatchOperation, EngineError> {
    let payload = metadata
        .to_json()
        .map_err(|e| EngineError::MalformedPatch(e.to_string()))?;
    let operation = if resource.pointer("/metadata/annotations").is_some() {
        // json-pointer escaping: `/` inside the key becomes `~1`
        serde_json::json!({
            "op": "add",
            "path": format!("/metadata/annotations/{}", VERIFY_ANNOTATION.replace('/', "~1")),
            "value": payload,
        })
    } else {
        serde_json::json!({
            "op": "add",
            "path": "/metadata/annotations",
            "value": { VERIFY_ANNOTATION: payload },
        })
    };
    serde_json::from_value(operation).map_err(|e| EngineError::MalformedPatch(e.to_string()))
}
