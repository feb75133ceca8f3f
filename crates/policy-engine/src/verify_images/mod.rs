//! Per-image signature and attestation verification.
//!
//! The state machine per matched image is: annotation short-circuit →
//! cache lookup → attestor verification → attestation verification →
//! verified (cached) or failed. Network-class registry errors surface as
//! engine errors, never as policy failures, since they mean the check
//! could not run.

pub mod attestors;

use std::collections::BTreeMap;

use json_patch::PatchOperation;
use oci_distribution::Reference;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clients::errors::RegistryError;
use crate::clients::{ImageVerifyCache, RegistryClient};
use crate::context::EvaluationContext;
use crate::errors::EngineError;
use crate::images::ImageInfo;
use crate::policy::{Attestation, ImageVerification};
use crate::response::ImageVerificationMetadata;
use crate::validate::conditions::evaluate_conditions;
use crate::validate::Verdict;
use crate::wildcard::wildcard_match;

/// Resource annotation carrying the verification payload of a previous
/// admission, image reference → verified.
pub const VERIFY_ANNOTATION: &str = "policy-engine.io/verify-images";

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no signature of \"{image}\" matches the attestor")]
    NoMatchingSignature { image: String },

    #[error(
        "attestor threshold not met for \"{image}\": {verified} of {required} verified ({})",
        failures.join("; ")
    )]
    Threshold {
        image: String,
        verified: usize,
        required: usize,
        failures: Vec<String>,
    },

    #[error("no attestation of \"{image}\" carries predicate type \"{predicate_type}\"")]
    NoStatements {
        image: String,
        predicate_type: String,
    },

    #[error("attestation conditions not met for \"{image}\" ({predicate_type})")]
    ConditionsNotMet {
        image: String,
        predicate_type: String,
    },

    #[error("attestor nesting exceeds the supported depth of {0}")]
    TooDeep(usize),
}

impl VerifyError {
    /// True when the failure means the registry could not be consulted,
    /// as opposed to the image failing verification.
    pub fn is_network(&self) -> bool {
        matches!(self, VerifyError::Registry(e) if e.is_network())
    }
}

#[derive(Debug, Default)]
pub struct ImageVerifyOutcome {
    pub verdict: Option<Verdict>,
    /// Digest rewrite patches; emitted whenever a digest was newly
    /// resolved, independent of the verification verdict.
    pub patches: Vec<PatchOperation>,
    pub metadata: ImageVerificationMetadata,
}

pub struct ImageVerifier<'a> {
    registry: &'a dyn RegistryClient,
    cache: &'a dyn ImageVerifyCache,
    policy: &'a str,
    rule: &'a str,
}

impl<'a> ImageVerifier<'a> {
    pub fn new(
        registry: &'a dyn RegistryClient,
        cache: &'a dyn ImageVerifyCache,
        policy: &'a str,
        rule: &'a str,
    ) -> Self {
        Self {
            registry,
            cache,
            policy,
            rule,
        }
    }

    /// Verify every extracted image the rule's reference patterns select.
    /// `None` verdict means no image matched (rule not applicable).
    pub async fn verify(
        &self,
        ctx: &mut EvaluationContext,
        images: &[ImageInfo],
        config: &ImageVerification,
    ) -> Result<ImageVerifyOutcome, EngineError> {
        let mut outcome = ImageVerifyOutcome::default();
        let prior = prior_annotation_payload(ctx);
        let mut matched_any = false;

        for info in images {
            if !reference_selected(info, &config.image_references) {
                continue;
            }
            matched_any = true;

            // a previous admission already recorded this exact reference
            // as verified; nothing changed, so skip even the cache
            if prior.get(&info.reference).copied().unwrap_or(false) {
                debug!(image = %info.reference, "verified by prior annotation payload");
                outcome.metadata.record(&info.reference, true);
                continue;
            }

            match self.cache.get(self.policy, self.rule, &info.reference).await {
                Ok(true) => {
                    debug!(image = %info.reference, "image verification cache hit");
                    outcome.metadata.record(&info.reference, true);
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(image = %info.reference, error = %e, "cache read failed, treating as miss"),
            }

            let Ok(reference) = info.reference.parse::<Reference>() else {
                warn!(image = %info.reference, "unparseable reference, skipping");
                continue;
            };

            if config.mutate_digest && info.digest.is_none() {
                let descriptor = self
                    .registry
                    .fetch_descriptor(&reference)
                    .await
                    .map_err(EngineError::Registry)?;
                outcome
                    .patches
                    .push(digest_patch(info, &descriptor.digest)?);
            }

            match self.verify_image(ctx, &reference, config).await {
                Ok(()) => {
                    outcome.metadata.record(&info.reference, true);
                    if let Err(e) = self
                        .cache
                        .set(self.policy, self.rule, &info.reference)
                        .await
                    {
                        warn!(image = %info.reference, error = %e, "cache write failed");
                    }
                }
                Err(e) if e.is_network() => {
                    return Err(match e {
                        VerifyError::Registry(inner) => EngineError::Registry(inner),
                        other => EngineError::Registry(RegistryError::Network(other.to_string())),
                    });
                }
                Err(VerifyError::TooDeep(depth)) => {
                    return Err(EngineError::AttestorTooDeep(depth))
                }
                Err(e) => {
                    outcome.metadata.record(&info.reference, false);
                    outcome.verdict = Some(if config.required {
                        Verdict::Fail(format!(
                            "image verification failed for {}: {e}",
                            info.reference
                        ))
                    } else {
                        Verdict::Skip(format!(
                            "image {} is not verifiable and verification is optional",
                            info.reference
                        ))
                    });
                    return Ok(outcome);
                }
            }
        }

        if outcome.verdict.is_none() {
            outcome.verdict = matched_any.then_some(Verdict::Pass);
        }
        Ok(outcome)
    }

    async fn verify_image(
        &self,
        ctx: &mut EvaluationContext,
        reference: &Reference,
        config: &ImageVerification,
    ) -> Result<(), VerifyError> {
        for set in &config.attestors {
            attestors::verify_attestor_set(self.registry, reference, set).await?;
        }

        if !config.attestations.is_empty() {
            let statements = self
                .registry
                .fetch_attestation_statements(reference)
                .await?;
            for attestation in &config.attestations {
                self.verify_attestation(ctx, reference, attestation, &statements)?;
            }
        }
        Ok(())
    }

    fn verify_attestation(
        &self,
        ctx: &mut EvaluationContext,
        reference: &Reference,
        attestation: &Attestation,
        statements: &[crate::clients::AttestationStatement],
    ) -> Result<(), VerifyError> {
        let matching: Vec<_> = statements
            .iter()
            .filter(|s| s.predicate_type == attestation.predicate_type)
            .collect();
        if matching.is_empty() {
            return Err(VerifyError::NoStatements {
                image: reference.whole(),
                predicate_type: attestation.predicate_type.clone(),
            });
        }

        for set in &attestation.attestors {
            let layers: Vec<_> = matching.iter().map(|s| s.layer.clone()).collect();
            if !attestors::set_matched_by_layers(set, &layers, 0)? {
                return Err(VerifyError::Threshold {
                    image: reference.whole(),
                    verified: 0,
                    required: set.required_count(),
                    failures: vec!["no attestation signature matches the attestor".to_string()],
                });
            }
        }

        // each condition tree must hold for at least one statement; the
        // predicate is bound under a fresh checkpoint, restored afterwards
        for tree in &attestation.conditions {
            let mut satisfied = false;
            for statement in &matching {
                ctx.checkpoint();
                ctx.bind("type", Value::String(statement.predicate_type.clone()));
                ctx.bind("predicate", statement.predicate.clone());
                let held = evaluate_conditions(ctx, tree)
                    .map(|verdict| verdict.matched)
                    .unwrap_or(false);
                let _ = ctx.restore();
                if held {
                    satisfied = true;
                    break;
                }
            }
            if !satisfied {
                return Err(VerifyError::ConditionsNotMet {
                    image: reference.whole(),
                    predicate_type: attestation.predicate_type.clone(),
                });
            }
        }
        Ok(())
    }
}

fn reference_selected(info: &ImageInfo, patterns: &[String]) -> bool {
    let canonical = format!("{}/{}", info.registry, info.repository);
    patterns.iter().any(|pattern| {
        pattern == "*"
            || wildcard_match(pattern, &info.reference)
            || wildcard_match(pattern, &canonical)
    })
}

fn digest_patch(info: &ImageInfo, digest: &str) -> Result<PatchOperation, EngineError> {
    serde_json::from_value(json!({
        "op": "replace",
        "path": info.pointer,
        "value": info.with_digest(digest),
    }))
    .map_err(|e| EngineError::MalformedPatch(e.to_string()))
}

fn prior_annotation_payload(ctx: &EvaluationContext) -> BTreeMap<String, bool> {
    ctx.resource()
        .and_then(|r| r.pointer("/metadata/annotations"))
        .and_then(|a| a.get(VERIFY_ANNOTATION))
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}
