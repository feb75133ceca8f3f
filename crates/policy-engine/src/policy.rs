use std::collections::HashMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wildcard::wildcard_match;

/// Whether a rule violation blocks the request (`Enforce`) or is only
/// recorded (`Audit`).
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailureAction {
    Enforce,
    #[default]
    Audit,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidationFailureActionOverride {
    pub action: ValidationFailureAction,
    /// Namespace names, `*` wildcards allowed. Evaluated in declaration
    /// order, first match wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    pub validation_failure_action: ValidationFailureAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_failure_action_overrides: Vec<ValidationFailureActionOverride>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<AnyAllConditions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutate: Option<Mutation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<Validation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify_images: Vec<ImageVerification>,
}

/// A declared context entry. Exactly one of the loader sub-fields must be
/// populated; the loader is selected by which one it is.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContextEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable: Option<VariableEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_call: Option<ApiCallEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_registry: Option<ImageRegistryEntry>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VariableEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiCallEntry {
    pub url_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigMapEntry {
    pub name: String,
    /// Defaults to the namespace of the admission request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImageRegistryEntry {
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnyAllConditions {
    /// At least one condition must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Condition>,
    /// Every condition must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Condition {
    pub key: Value,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    In,
    NotIn,
    AnyIn,
    AllIn,
    AllNotIn,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    DurationGreaterThan,
    DurationGreaterThanOrEquals,
    DurationLessThan,
    DurationLessThanOrEquals,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Rule-level override of the policy's validationFailureAction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<ValidationFailureAction>,
    /// On UPDATE, downgrade a failure to skip when the old object already
    /// failed identically.
    #[serde(default = "default_true")]
    pub allow_existing_violations: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_pattern: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<Deny>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assert: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cel: Option<CelValidation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_security: Option<PodSecurity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreach: Vec<ForEach>,
}

impl Default for Validation {
    fn default() -> Self {
        Validation {
            message: None,
            failure_action: None,
            allow_existing_violations: true,
            pattern: None,
            any_pattern: None,
            deny: None,
            assert: None,
            cel: None,
            pod_security: None,
            foreach: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Deny {
    pub conditions: AnyAllConditions,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CelValidation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<CelVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expressions: Vec<CelExpression>,
    /// Optional parameter resource resolved through the resource client and
    /// bound as `params`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_ref: Option<ParamRef>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CelVariable {
    pub name: String,
    pub expression: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CelExpression {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ParamRef {
    pub api_version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PodSecurityLevel {
    Baseline,
    Restricted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PodSecurity {
    pub level: PodSecurityLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<PodSecurityExclusion>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PodSecurityExclusion {
    pub control_name: String,
    /// When set, the exclusion only applies to containers whose image
    /// matches one of these wildcards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IterationOrder {
    Ascending,
    Descending,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ElementScope {
    /// The element replaces the resource binding for the body evaluation.
    /// This is the behavior when no scope is declared.
    Root,
    /// The element is bound as `element` next to the untouched resource,
    /// which stays the target of the body's checks.
    Nested,
}

/// One foreach declaration: a list expression plus a rule body applied to
/// every element. The body may itself be another foreach list.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForEach {
    pub list: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<IterationOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_scope: Option<ElementScope>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preconditions: Option<AnyAllConditions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_pattern: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<Deny>,
    /// RFC 6902 patch list, serialized as YAML/JSON text so variables can be
    /// substituted before parsing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patches_json6902: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_strategic_merge: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreach: Vec<ForEach>,
}

impl ForEach {
    /// Descending iteration is explicit, or implied by a raw strategic-merge
    /// patch (removals must walk array indices from the back).
    pub fn is_descending(&self) -> bool {
        match self.order {
            Some(order) => order == IterationOrder::Descending,
            None => self.patch_strategic_merge.is_some(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patches_json6902: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_strategic_merge: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreach: Vec<ForEach>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageVerification {
    /// Wildcard patterns selecting the images this rule applies to.
    pub image_references: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestors: Vec<AttestorSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestations: Vec<Attestation>,
    /// Rewrite tag references to digest-qualified form.
    #[serde(default = "default_true")]
    pub mutate_digest: bool,
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub predicate_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestors: Vec<AttestorSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AnyAllConditions>,
}

/// A named group of attestors; `count` defaults to all entries.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttestorSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<AttestorEntry>,
}

impl AttestorSet {
    pub fn required_count(&self) -> usize {
        match self.count {
            Some(count) if count > 0 => count.min(self.entries.len()),
            _ => self.entries.len(),
        }
    }
}

/// One attestor-set entry: a leaf verification method or a nested set, which
/// recurses with the same semantics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum AttestorEntry {
    Keys(KeyAttestor),
    Certificates(CertificateAttestor),
    Keyless(KeylessAttestor),
    Attestor(AttestorSet),
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeyAttestor {
    /// PEM encoded public key(s).
    pub public_keys: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CertificateAttestor {
    /// PEM encoded certificate.
    pub cert: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeylessAttestor {
    pub issuer: String,
    pub subject: Subject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum Subject {
    Equal(String),
    #[serde(deserialize_with = "deserialize_subject_url_prefix")]
    UrlPrefix(url::Url),
}

fn deserialize_subject_url_prefix<'de, D>(deserializer: D) -> Result<url::Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let mut url = url::Url::deserialize(deserializer)?;
    if !url.path().ends_with('/') {
        // sanitize url prefix path by postfixing `/`, to prevent
        // `https://github.com/acme` matching
        // `https://github.com/acme-malicious/`
        url.set_path(format!("{}{}", url.path(), '/').as_str());
    }
    Ok(url)
}

/// A declarative override that exempts matching resources from specific
/// (policy, rule) pairs. Supplied by the exception-selector collaborator;
/// the engine treats it as read-only input.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyException {
    pub name: String,
    #[serde(default)]
    pub match_resources: MatchResources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<ExceptionRuleRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_action: Option<ValidationFailureAction>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExceptionRuleRef {
    pub policy_name: String,
    pub rule_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MatchResources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl PolicyException {
    /// True when this exception names the (policy, rule) pair.
    pub fn references(&self, policy: &str, rule: &str) -> bool {
        self.exceptions.iter().any(|r| {
            r.policy_name == policy && r.rule_names.iter().any(|n| n == rule || n == "*")
        })
    }

    /// True when the match selector matches the resource coordinates.
    pub fn matches(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
        labels: &HashMap<String, String>,
    ) -> bool {
        let m = &self.match_resources;
        if !m.kinds.is_empty() && !m.kinds.iter().any(|k| wildcard_match(k, kind)) {
            return false;
        }
        if !m.namespaces.is_empty() {
            let ns = namespace.unwrap_or("");
            if !m.namespaces.iter().any(|n| wildcard_match(n, ns)) {
                return false;
            }
        }
        if !m.names.is_empty() {
            let name = name.unwrap_or("");
            if !m.names.iter().any(|n| wildcard_match(n, name)) {
                return false;
            }
        }
        if let Some(selector) = &m.selector {
            if !label_selector_matches(selector, labels) {
                return false;
            }
        }
        true
    }
}

/// Evaluate a Kubernetes label selector (matchLabels + matchExpressions)
/// against a flat label map.
pub fn label_selector_matches(
    selector: &LabelSelector,
    labels: &HashMap<String, String>,
) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let actual = labels.get(&expr.key);
            let values = expr.values.clone().unwrap_or_default();
            let holds = match expr.operator.as_str() {
                "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !holds {
                return false;
            }
        }
    }
    true
}
