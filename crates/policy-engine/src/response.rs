use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::ValidationFailureAction;

/// Outcome class of a single rule evaluation.
///
/// `Skip` means the rule intentionally did not apply and is never counted as
/// a failure. `Error` means the rule could not be evaluated at all
/// (unreachable registry, malformed substitution, ...) and is surfaced apart
/// from `Fail` so that enforcement can treat infrastructure problems
/// differently from genuine violations.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Pass,
    Fail,
    Warn,
    Error,
    Skip,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Mutation,
    #[default]
    Validation,
    Generation,
    ImageVerify,
}

/// Result of one pod-security control evaluated by a `podSecurity` rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityCheck {
    pub control: String,
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    /// Wall-clock time spent evaluating the rule, in milliseconds.
    pub processing_time_ms: u128,
}

/// Outcome of evaluating one rule against one resource.
///
/// A response is immutable once built: derived responses are produced with
/// the `with_*` transforms, which copy the original and change one aspect.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub name: String,
    pub rule_type: RuleType,
    pub status: RuleStatus,
    pub message: String,

    /// RFC 6902 operations produced by mutation or digest rewriting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<json_patch::PatchOperation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_security_checks: Vec<PodSecurityCheck>,

    /// Name of the policy exception that short-circuited this rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,

    /// Failure action resolved for this rule (exception override, then rule
    /// level, then policy default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<ValidationFailureAction>,

    #[serde(default)]
    pub stats: ExecutionStats,
}

impl RuleResponse {
    fn new(name: &str, rule_type: RuleType, status: RuleStatus, message: &str) -> Self {
        RuleResponse {
            name: name.to_string(),
            rule_type,
            status,
            message: message.to_string(),
            ..Default::default()
        }
    }

    pub fn pass(name: &str, rule_type: RuleType, message: &str) -> Self {
        Self::new(name, rule_type, RuleStatus::Pass, message)
    }

    pub fn fail(name: &str, rule_type: RuleType, message: &str) -> Self {
        Self::new(name, rule_type, RuleStatus::Fail, message)
    }

    pub fn warn(name: &str, rule_type: RuleType, message: &str) -> Self {
        Self::new(name, rule_type, RuleStatus::Warn, message)
    }

    pub fn error(name: &str, rule_type: RuleType, message: &str) -> Self {
        Self::new(name, rule_type, RuleStatus::Error, message)
    }

    pub fn skip(name: &str, rule_type: RuleType, message: &str) -> Self {
        Self::new(name, rule_type, RuleStatus::Skip, message)
    }

    pub fn with_patches(self, patches: Vec<json_patch::PatchOperation>) -> Self {
        RuleResponse { patches, ..self }
    }

    pub fn with_pod_security_checks(self, checks: Vec<PodSecurityCheck>) -> Self {
        RuleResponse {
            pod_security_checks: checks,
            ..self
        }
    }

    pub fn with_exception(self, exception: &str) -> Self {
        RuleResponse {
            exception: Some(exception.to_string()),
            ..self
        }
    }

    pub fn with_failure_action(self, action: ValidationFailureAction) -> Self {
        RuleResponse {
            failure_action: Some(action),
            ..self
        }
    }

    pub fn with_stats(self, elapsed: Duration) -> Self {
        RuleResponse {
            stats: ExecutionStats {
                processing_time_ms: elapsed.as_millis(),
            },
            ..self
        }
    }

    pub fn with_status(self, status: RuleStatus, message: &str) -> Self {
        RuleResponse {
            status,
            message: message.to_string(),
            ..self
        }
    }

    /// True when the resolved failure action makes this failure block the
    /// admission request.
    pub fn blocks(&self) -> bool {
        matches!(self.status, RuleStatus::Fail | RuleStatus::Error)
            && self.failure_action.unwrap_or_default() == ValidationFailureAction::Enforce
    }
}

/// All rule outcomes for one policy applied to one resource.
///
/// The counters are a pure function of the response sequence; they are not
/// stored separately so they can never drift out of sync.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResponse {
    pub policy: String,
    #[serde(default)]
    pub rules: Vec<RuleResponse>,
}

impl PolicyResponse {
    pub fn new(policy: &str) -> Self {
        PolicyResponse {
            policy: policy.to_string(),
            rules: Vec::new(),
        }
    }

    pub fn push(&mut self, response: RuleResponse) {
        self.rules.push(response);
    }

    /// Number of rules that actually applied (everything but skips).
    pub fn rules_applied(&self) -> usize {
        self.rules
            .iter()
            .filter(|r| r.status != RuleStatus::Skip)
            .count()
    }

    pub fn rules_failed(&self) -> usize {
        self.rules
            .iter()
            .filter(|r| r.status == RuleStatus::Fail)
            .count()
    }

    pub fn rules_errored(&self) -> usize {
        self.rules
            .iter()
            .filter(|r| r.status == RuleStatus::Error)
            .count()
    }

    /// Concatenation of every rule's patches, in rule order. JSON-patch
    /// application is order sensitive, so the order is part of the contract.
    pub fn patches(&self) -> Vec<json_patch::PatchOperation> {
        self.rules.iter().flat_map(|r| r.patches.clone()).collect()
    }
}

/// The image-verification annotation payload: image reference -> verified.
///
/// Serialized with sorted keys (BTreeMap) so the payload is byte
/// reproducible, which idempotence checks rely on.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageVerificationMetadata(pub BTreeMap<String, bool>);

impl ImageVerificationMetadata {
    pub fn record(&mut self, image: &str, verified: bool) {
        self.0.insert(image.to_string(), verified);
    }

    pub fn is_verified(&self, image: &str) -> bool {
        self.0.get(image).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }
}
