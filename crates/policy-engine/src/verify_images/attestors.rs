//! Attestor-set verification: matching attestor configuration against the
//! validated signature layers of an image.
//!
//! Entries are tried in declaration order and every successful entry
//! increments a counter; once the set's required count is reached,
//! verification stops without invoking the remaining entries. Leaf entries
//! each perform their own registry fetch, so the early exit directly saves
//! network calls.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use oci_distribution::Reference;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::VerifyError;
use crate::clients::{RegistryClient, SignatureLayer};
use crate::policy::{
    AttestorEntry, AttestorSet, CertificateAttestor, KeyAttestor, KeylessAttestor, Subject,
};

/// Nested attestor sets beyond this depth abort verification.
pub const MAX_ATTESTOR_DEPTH: usize = 10;

type BoxedVerify<'a> = Pin<Box<dyn Future<Output = Result<(), VerifyError>> + Send + 'a>>;

/// Verify one attestor set against the image's signatures, honoring the
/// required count.
pub async fn verify_attestor_set(
    registry: &dyn RegistryClient,
    image: &Reference,
    set: &AttestorSet,
) -> Result<(), VerifyError> {
    verify_set_at(registry, image, set, 0).await
}

fn verify_set_at<'a>(
    registry: &'a dyn RegistryClient,
    image: &'a Reference,
    set: &'a AttestorSet,
    depth: usize,
) -> BoxedVerify<'a> {
    Box::pin(async move {
        if depth >= MAX_ATTESTOR_DEPTH {
            return Err(VerifyError::TooDeep(MAX_ATTESTOR_DEPTH));
        }

        let required = set.required_count();
        let mut verified = 0;
        let mut failures = Vec::new();

        for entry in &set.entries {
            let outcome = match entry {
                AttestorEntry::Attestor(nested) => {
                    verify_set_at(registry, image, nested, depth + 1).await
                }
                leaf => verify_leaf(registry, image, leaf).await,
            };
            match outcome {
                Ok(()) => {
                    verified += 1;
                    if verified >= required {
                        debug!(
                            image = %image.whole(),
                            verified,
                            required,
                            "attestor threshold reached, stopping early"
                        );
                        return Ok(());
                    }
                }
                // network failures abort immediately, they are not a
                // statement about the image
                Err(e) if e.is_network() => return Err(e),
                Err(e) => failures.push(e.to_string()),
            }
        }

        Err(VerifyError::Threshold {
            image: image.whole(),
            verified,
            required,
            failures,
        })
    })
}

async fn verify_leaf(
    registry: &dyn RegistryClient,
    image: &Reference,
    entry: &AttestorEntry,
) -> Result<(), VerifyError> {
    let layers = registry.fetch_signature_layers(image).await?;
    match entry {
        AttestorEntry::Keys(config) => match_any_layer(image, &layers, |layer| {
            key_matches(config, layer)
        }),
        AttestorEntry::Certificates(config) => match_any_layer(image, &layers, |layer| {
            certificate_matches(config, layer)
        }),
        AttestorEntry::Keyless(config) => match_any_layer(image, &layers, |layer| {
            keyless_matches(config, layer)
        }),
        AttestorEntry::Attestor(_) => unreachable!("nested sets recurse before this point"),
    }
}

fn match_any_layer(
    image: &Reference,
    layers: &[SignatureLayer],
    matches: impl Fn(&SignatureLayer) -> bool,
) -> Result<(), VerifyError> {
    if layers.iter().any(matches) {
        Ok(())
    } else {
        Err(VerifyError::NoMatchingSignature {
            image: image.whole(),
        })
    }
}

/// Hex sha256 over the trimmed PEM text, the same fingerprint the registry
/// client records on key-signed layers.
pub fn pem_fingerprint(pem: &str) -> String {
    hex::encode(Sha256::digest(pem.trim().as_bytes()))
}

fn key_matches(config: &KeyAttestor, layer: &SignatureLayer) -> bool {
    let fingerprint = pem_fingerprint(&config.public_keys);
    layer.key_fingerprint.as_deref() == Some(fingerprint.as_str())
        && annotations_match(config.annotations.as_ref(), &layer.annotations)
}

fn certificate_matches(config: &CertificateAttestor, layer: &SignatureLayer) -> bool {
    let fingerprint = pem_fingerprint(&config.cert);
    layer
        .certificate
        .as_ref()
        .map(|cert| cert.fingerprint == fingerprint)
        .unwrap_or(false)
        && annotations_match(config.annotations.as_ref(), &layer.annotations)
}

fn keyless_matches(config: &KeylessAttestor, layer: &SignatureLayer) -> bool {
    let Some(certificate) = &layer.certificate else {
        return false;
    };
    if certificate.issuer.as_deref() != Some(config.issuer.as_str()) {
        return false;
    }
    let subject_ok = match &config.subject {
        Subject::Equal(expected) => &certificate.subject == expected,
        Subject::UrlPrefix(prefix) => match url::Url::parse(&certificate.subject) {
            Ok(mut subject) => {
                if !subject.path().ends_with('/') {
                    subject.set_path(&format!("{}/", subject.path()));
                }
                subject.as_str().starts_with(prefix.as_str())
            }
            Err(_) => false,
        },
    };
    subject_ok && annotations_match(config.annotations.as_ref(), &layer.annotations)
}

/// Match a set against already-fetched layers (used for attestation
/// statements, whose signatures arrive with the statement). Same counting
/// and early-exit rules, no network.
pub(crate) fn set_matched_by_layers(
    set: &AttestorSet,
    layers: &[SignatureLayer],
    depth: usize,
) -> Result<bool, VerifyError> {
    if depth >= MAX_ATTESTOR_DEPTH {
        return Err(VerifyError::TooDeep(MAX_ATTESTOR_DEPTH));
    }
    let required = set.required_count();
    let mut verified = 0;
    for entry in &set.entries {
        let matched = match entry {
            AttestorEntry::Attestor(nested) => set_matched_by_layers(nested, layers, depth + 1)?,
            AttestorEntry::Keys(config) => layers.iter().any(|l| key_matches(config, l)),
            AttestorEntry::Certificates(config) => {
                layers.iter().any(|l| certificate_matches(config, l))
            }
            AttestorEntry::Keyless(config) => layers.iter().any(|l| keyless_matches(config, l)),
        };
        if matched {
            verified += 1;
            if verified >= required {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn annotations_match(
    expected: Option<&HashMap<String, String>>,
    actual: &HashMap<String, String>,
) -> bool {
    let Some(expected) = expected else { return true };
    expected
        .iter()
        .all(|(key, value)| actual.get(key) == Some(value))
}
