mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use serde_json::{json, Value};

use common::{
    create_request, engine, exception, policy, update_request, NullConfigmaps, NullResource,
    SignedRegistry, SlowResource, StaticExceptions, UnsignedRegistry, SIGNING_KEY,
};
use policy_engine::clients::cache::InMemoryImageVerifyCache;
use policy_engine::clients::ImageVerifyCache;
use policy_engine::response::{RuleStatus, RuleType};
use policy_engine::{EngineConfig, PolicyEngine, ValidationFailureAction};

fn labeled_pod(labels: Value) -> Value {
    json!({
        "kind": "Pod",
        "metadata": {"name": "web", "labels": labels},
        "spec": {"containers": [{"name": "app", "image": "ghcr.io/acme/app:v1"}]}
    })
}

fn require_app_label() -> Value {
    json!({
        "name": "require-labels",
        "rules": [{
            "name": "check-app",
            "validate": {
                "message": "label app is required",
                "pattern": {"metadata": {"labels": {"app": "?*"}}}
            }
        }]
    })
}

#[tokio::test]
async fn pattern_rule_passes_and_fails_on_the_label() {
    let engine = engine();
    let policy = policy(require_app_label());

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({"app": "web"}))))
        .await;
    assert_eq!(response.rules.len(), 1);
    assert_eq!(response.rules[0].status, RuleStatus::Pass);
    assert_eq!(response.rules_applied(), 1);

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Fail);
    assert!(rule.message.contains("label app is required"));
    assert!(rule.message.contains("/metadata/labels"));
    // the policy default is Audit, so the failure is recorded but not blocking
    assert_eq!(rule.failure_action, Some(ValidationFailureAction::Audit));
    assert!(!rule.blocks());
}

#[tokio::test]
async fn namespace_overrides_select_the_failure_action() {
    let engine = engine();
    let mut spec = require_app_label();
    spec["validationFailureActionOverrides"] = json!([
        {"action": "Enforce", "namespaces": ["prod-*"]},
        {"action": "Audit", "namespaces": ["*"]}
    ]);
    let policy = policy(spec);

    let mut request = create_request(labeled_pod(json!({})));
    request.namespace = Some("prod-payments".to_string());
    let response = engine.apply(&policy, &request).await;
    assert!(response.rules[0].blocks());

    request.namespace = Some("dev".to_string());
    let response = engine.apply(&policy, &request).await;
    assert_eq!(
        response.rules[0].failure_action,
        Some(ValidationFailureAction::Audit)
    );
    assert!(!response.rules[0].blocks());
}

#[tokio::test]
async fn a_plain_exception_skips_the_rule() {
    let granted = exception(json!({
        "name": "grant-legacy",
        "exceptions": [{"policyName": "require-labels", "ruleNames": ["check-app"]}],
        "matchResources": {"kinds": ["Pod"]}
    }));
    let engine = engine().with_exception_selector(Arc::new(StaticExceptions(vec![granted])));
    let policy = policy(require_app_label());

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Skip);
    assert_eq!(rule.exception.as_deref(), Some("grant-legacy"));
    assert!(rule.message.contains("grant-legacy"));
    assert_eq!(response.rules_applied(), 0);
}

#[tokio::test]
async fn exceptions_for_other_rules_or_kinds_do_not_apply() {
    let unrelated = exception(json!({
        "name": "grant-other",
        "exceptions": [{"policyName": "require-labels", "ruleNames": ["other-rule"]}]
    }));
    let wrong_kind = exception(json!({
        "name": "grant-services",
        "exceptions": [{"policyName": "require-labels", "ruleNames": ["*"]}],
        "matchResources": {"kinds": ["Service"]}
    }));
    let engine = engine()
        .with_exception_selector(Arc::new(StaticExceptions(vec![unrelated, wrong_kind])));
    let policy = policy(require_app_label());

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    assert_eq!(response.rules[0].status, RuleStatus::Fail);
}

#[tokio::test]
async fn exception_action_override_beats_rule_and_policy_levels() {
    let override_only = exception(json!({
        "name": "enforce-for-legacy",
        "failureAction": "Enforce",
        "exceptions": [{"policyName": "require-labels", "ruleNames": ["check-app"]}]
    }));
    let engine =
        engine().with_exception_selector(Arc::new(StaticExceptions(vec![override_only])));

    // rule level says Audit, policy default says Audit; the exception wins
    let mut spec = require_app_label();
    spec["rules"][0]["validate"]["failureAction"] = json!("Audit");
    // identical old object would downgrade the enforced failure, so pin the
    // request to CREATE semantics
    let policy = policy(spec);

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Fail);
    assert_eq!(rule.failure_action, Some(ValidationFailureAction::Enforce));
    assert!(rule.blocks());
}

#[tokio::test]
async fn unmet_preconditions_skip_the_rule() {
    let engine = engine();
    let mut spec = require_app_label();
    spec["rules"][0]["preconditions"] = json!({
        "all": [{"key": "{{ request.operation }}", "operator": "Equals", "value": "UPDATE"}]
    });
    let policy = policy(spec);

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Skip);
    assert!(rule.message.contains("preconditions not met"));
}

#[tokio::test]
async fn pre_existing_violations_are_not_enforced_on_update() {
    let engine = engine();
    let mut spec = require_app_label();
    spec["rules"][0]["validate"]["failureAction"] = json!("Enforce");
    let policy = policy(spec);

    // old and new object violate identically: the update did not introduce
    // the violation, so it is tolerated
    let response = engine
        .apply(
            &policy,
            &update_request(labeled_pod(json!({})), labeled_pod(json!({}))),
        )
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Skip);
    assert!(rule.message.contains("pre-exists"));

    // a compliant old object means the violation is new: enforce
    let response = engine
        .apply(
            &policy,
            &update_request(labeled_pod(json!({})), labeled_pod(json!({"app": "web"}))),
        )
        .await;
    assert_eq!(response.rules[0].status, RuleStatus::Fail);
    assert!(response.rules[0].blocks());
}

#[tokio::test]
async fn existing_violations_still_fail_under_audit() {
    let engine = engine();
    let policy = policy(require_app_label());

    let response = engine
        .apply(
            &policy,
            &update_request(labeled_pod(json!({})), labeled_pod(json!({}))),
        )
        .await;
    // the downgrade only shields Enforce rules; audited failures stay visible
    assert_eq!(response.rules[0].status, RuleStatus::Fail);
}

#[tokio::test]
async fn mutation_feeds_the_following_validation_and_is_idempotent() {
    let engine = engine();
    let policy = policy(json!({
        "name": "default-app-label",
        "rules": [
            {
                "name": "add-app-label",
                "mutate": {
                    "patchStrategicMerge": {"metadata": {"labels": {"+(app)": "web"}}}
                }
            },
            {
                "name": "check-app",
                "validate": {
                    "message": "label app is required",
                    "pattern": {"metadata": {"labels": {"app": "?*"}}}
                }
            }
        ]
    }));

    let original = labeled_pod(json!({}));
    let response = engine.apply(&policy, &create_request(original.clone())).await;
    assert_eq!(response.rules[0].status, RuleStatus::Pass);
    assert_eq!(response.rules[0].rule_type, RuleType::Mutation);
    assert!(!response.rules[0].patches.is_empty());
    // the validation sees the resource with the label already applied
    assert_eq!(response.rules[1].status, RuleStatus::Pass);

    let mut patched = original;
    json_patch::patch(&mut patched, &response.patches()).unwrap();
    assert_json_eq!(patched.clone(), labeled_pod(json!({"app": "web"})));

    // a second admission of the mutated resource changes nothing
    let response = engine.apply(&policy, &create_request(patched)).await;
    assert_eq!(response.rules[0].status, RuleStatus::Skip);
    assert!(response.rules[0].patches.is_empty());
    assert_eq!(response.rules[1].status, RuleStatus::Pass);
}

#[tokio::test]
async fn foreach_over_an_absent_list_emits_no_response() {
    let engine = engine();
    let policy = policy(json!({
        "name": "volume-checks",
        "rules": [{
            "name": "check-volumes",
            "validate": {
                "foreach": [{
                    "list": "request.object.spec.volumes",
                    "deny": {"conditions": {"all": [
                        {"key": "{{ element.hostPath }}", "operator": "NotEquals", "value": null}
                    ]}}
                }]
            }
        }]
    }));

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    assert!(response.rules.is_empty());
}

#[tokio::test]
async fn a_rule_without_a_body_is_an_error() {
    let engine = engine();
    let policy = policy(json!({
        "name": "broken",
        "rules": [{"name": "noop"}]
    }));

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Error);
    assert!(rule.message.contains("noop"));
    assert_eq!(response.rules_errored(), 1);
}

#[tokio::test]
async fn excluded_groups_bypass_evaluation() {
    let engine = engine().with_config(EngineConfig {
        excluded_groups: vec!["system:nodes".to_string()],
        rule_timeout: None,
    });
    let policy = policy(require_app_label());

    let mut request = create_request(labeled_pod(json!({})));
    request.user_info.groups = Some(vec![
        "system:authenticated".to_string(),
        "system:nodes".to_string(),
    ]);

    let response = engine.apply(&policy, &request).await;
    assert!(response.rules.is_empty());
}

#[tokio::test]
async fn slow_context_loading_hits_the_rule_deadline() {
    let engine = PolicyEngine::new(
        Arc::new(SlowResource {
            delay: Duration::from_millis(250),
        }),
        Arc::new(SignedRegistry::new()),
        Arc::new(NullConfigmaps),
        Arc::new(InMemoryImageVerifyCache::default()),
    )
    .with_config(EngineConfig {
        excluded_groups: Vec::new(),
        rule_timeout: Some(Duration::from_millis(20)),
    });

    let mut spec = require_app_label();
    spec["rules"][0]["context"] =
        json!([{"name": "metrics", "apiCall": {"urlPath": "/apis/metrics"}}]);
    let policy = policy(spec);

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Error);
    assert!(rule.message.contains("deadline"));
}

fn verify_policy() -> Value {
    json!({
        "name": "verify-acme-images",
        "rules": [{
            "name": "check-signatures",
            "verifyImages": [{
                "imageReferences": ["ghcr.io/acme/*"],
                "attestors": [{"entries": [{"keys": {"publicKeys": SIGNING_KEY}}]}]
            }]
        }]
    })
}

#[tokio::test]
async fn signed_images_verify_with_digest_and_annotation_patches() {
    let registry = Arc::new(SignedRegistry::new());
    let cache = Arc::new(InMemoryImageVerifyCache::default());
    let engine = PolicyEngine::new(
        Arc::new(NullResource),
        registry.clone(),
        Arc::new(NullConfigmaps),
        cache.clone(),
    );
    let policy = policy(verify_policy());

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({"app": "web"}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Pass);
    assert_eq!(rule.rule_type, RuleType::ImageVerify);

    let patches = serde_json::to_value(&rule.patches).unwrap();
    assert_eq!(patches[0]["path"], json!("/spec/containers/0/image"));
    assert_eq!(
        patches[0]["value"],
        json!("ghcr.io/acme/app@sha256:feedface")
    );
    assert_eq!(patches[1]["path"], json!("/metadata/annotations"));

    // the verified outcome lands in the shared cache
    assert!(cache
        .get("verify-acme-images", "check-signatures", "ghcr.io/acme/app:v1")
        .await
        .unwrap());

    // a second admission is served from the cache without registry traffic
    let calls_after_first = registry.calls();
    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({"app": "web"}))))
        .await;
    assert_eq!(response.rules[0].status, RuleStatus::Pass);
    assert_eq!(registry.calls(), calls_after_first);
}

#[tokio::test]
async fn unsigned_images_fail_verification() {
    let engine = PolicyEngine::new(
        Arc::new(NullResource),
        Arc::new(UnsignedRegistry),
        Arc::new(NullConfigmaps),
        Arc::new(InMemoryImageVerifyCache::default()),
    );
    let policy = policy(verify_policy());

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({"app": "web"}))))
        .await;
    let rule = &response.rules[0];
    assert_eq!(rule.status, RuleStatus::Fail);
    assert!(rule.message.contains("ghcr.io/acme/app:v1"));
    assert_eq!(response.rules_failed(), 1);
}

#[tokio::test]
async fn verify_rules_not_matching_any_image_emit_no_response() {
    let engine = engine();
    let mut spec = verify_policy();
    spec["rules"][0]["verifyImages"][0]["imageReferences"] = json!(["quay.io/other/*"]);
    let policy = policy(spec);

    let response = engine
        .apply(&policy, &create_request(labeled_pod(json!({"app": "web"}))))
        .await;
    assert!(response.rules.is_empty());
}
