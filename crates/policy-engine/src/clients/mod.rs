//! Collaborator interfaces consumed by the engine.
//!
//! All clients are constructor-injected (no process-wide singletons) so that
//! tests can substitute fakes without touching global state. Every call is
//! async and honors the ambient tokio cancellation; callers enforce the
//! overall request deadline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use oci_distribution::Reference;
use serde_json::Value;

pub mod cache;
pub mod errors;

use errors::{CacheError, ClientError, RegistryError};

use crate::policy::PolicyException;

/// Kubernetes resource access used during api-call context loading, CEL
/// parameter resolution and authorization checks.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get_resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClientError>;

    async fn list_resources(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClientError>;

    /// Perform a raw API call against `url_path` and return the JSON body.
    async fn api_call(&self, url_path: &str) -> Result<Value, ClientError>;

    /// SubjectAccessReview-style authorization check.
    async fn can_i(
        &self,
        kind: &str,
        namespace: &str,
        verb: &str,
        subresource: &str,
        user: &str,
    ) -> Result<bool, ClientError>;
}

/// Raw manifest, config and content digest of an image, as returned by the
/// registry. Manifest and config are JSON round-tripped by the caller so the
/// query evaluator sees comparable numeric types.
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub digest: String,
    pub manifest: Value,
    pub config: Value,
}

/// Identity baked into the signing certificate of a keyless signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub issuer: Option<String>,
    pub subject: String,
    /// Hex sha256 fingerprint of the signing certificate.
    pub fingerprint: String,
}

/// One validated signature attached to an image.
///
/// The registry client only returns layers whose cryptographic signature it
/// has already validated against the embedded key or certificate; the engine
/// matches attestor configuration against these trusted layers, the same
/// split the cosign client uses.
#[derive(Debug, Clone, Default)]
pub struct SignatureLayer {
    /// The docker-manifest-digest recorded in the simple-signing payload.
    pub payload_digest: String,
    /// Hex sha256 fingerprint of the signing public key, when key-based.
    pub key_fingerprint: Option<String>,
    pub certificate: Option<CertificateIdentity>,
    pub annotations: HashMap<String, String>,
}

/// A signed in-toto statement about an image, together with the signature
/// layer that carried it.
#[derive(Debug, Clone)]
pub struct AttestationStatement {
    pub predicate_type: String,
    pub predicate: Value,
    pub layer: SignatureLayer,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch_descriptor(&self, image: &Reference) -> Result<ImageDescriptor, RegistryError>;

    async fn fetch_signature_layers(
        &self,
        image: &Reference,
    ) -> Result<Vec<SignatureLayer>, RegistryError>;

    async fn fetch_attestation_statements(
        &self,
        image: &Reference,
    ) -> Result<Vec<AttestationStatement>, RegistryError>;
}

#[async_trait]
pub trait ConfigmapResolver: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClientError>;
}

/// Ordered fallback chain of resolvers: sub-resolvers are tried in order and
/// the first success wins; when everything fails the last error is returned.
pub struct ChainConfigmapResolver {
    resolvers: Vec<Arc<dyn ConfigmapResolver>>,
}

impl ChainConfigmapResolver {
    pub fn new(resolvers: Vec<Arc<dyn ConfigmapResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl ConfigmapResolver for ChainConfigmapResolver {
    async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClientError> {
        let mut last_error = ClientError::Api("no configmap resolver configured".to_string());
        for resolver in &self.resolvers {
            match resolver.get(namespace, name).await {
                Ok(cm) => return Ok(cm),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

/// Shared cache of image verification outcomes.
///
/// Keys are (policy identity, rule name, image reference); distinct policies
/// never race on the same key. Implementations must support concurrent
/// get/set/delete from in-flight rule evaluations.
#[async_trait]
pub trait ImageVerifyCache: Send + Sync {
    async fn get(&self, policy: &str, rule: &str, image: &str) -> Result<bool, CacheError>;
    async fn set(&self, policy: &str, rule: &str, image: &str) -> Result<(), CacheError>;
    async fn delete(&self, policy: &str, rule: &str, image: &str) -> Result<(), CacheError>;
    async fn delete_for_rule(&self, policy: &str, rule: &str) -> Result<(), CacheError>;
    async fn delete_for_policy(&self, policy: &str) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

/// Supplies the policy exceptions relevant to one (policy, rule) pair.
#[async_trait]
pub trait PolicyExceptionSelector: Send + Sync {
    async fn exceptions_for(
        &self,
        policy: &str,
        rule: &str,
    ) -> Result<Vec<PolicyException>, ClientError>;
}

/// Selector that never returns exceptions; the default wiring for engines
/// running without the exception machinery.
pub struct NoExceptions;

#[async_trait]
impl PolicyExceptionSelector for NoExceptions {
    async fn exceptions_for(
        &self,
        _policy: &str,
        _rule: &str,
    ) -> Result<Vec<PolicyException>, ClientError> {
        Ok(Vec::new())
    }
}
