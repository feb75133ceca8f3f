//! Fake collaborators shared by the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::Reference;
use serde_json::{json, Value};

use policy_engine::clients::cache::InMemoryImageVerifyCache;
use policy_engine::clients::errors::{ClientError, RegistryError};
use policy_engine::clients::{
    AttestationStatement, ConfigmapResolver, ImageDescriptor, PolicyExceptionSelector,
    RegistryClient, ResourceClient, SignatureLayer,
};
use policy_engine::policy::{PolicyException, PolicySpec};
use policy_engine::verify_images::attestors::pem_fingerprint;
use policy_engine::{AdmissionRequest, Operation, PolicyEngine};

pub const SIGNING_KEY: &str = "-----BEGIN PUBLIC KEY-----\nZm9v\n-----END PUBLIC KEY-----";

/// Resource client for rules that never reach the cluster.
pub struct NullResource;

#[async_trait]
impl ResourceClient for NullResource {
    async fn get_resource(
        &self,
        _api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClientError> {
        Err(ClientError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.unwrap_or("").to_string(),
            name: name.to_string(),
        })
    }

    async fn list_resources(
        &self,
        _api_version: &str,
        _kind: &str,
        _namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClientError> {
        Ok(Vec::new())
    }

    async fn api_call(&self, url_path: &str) -> Result<Value, ClientError> {
        Err(ClientError::Api(format!("no fixture for {url_path}")))
    }

    async fn can_i(
        &self,
        _kind: &str,
        _namespace: &str,
        _verb: &str,
        _subresource: &str,
        _user: &str,
    ) -> Result<bool, ClientError> {
        Ok(false)
    }
}

/// Resource client whose api calls stall, for deadline tests.
pub struct SlowResource {
    pub delay: Duration,
}

#[async_trait]
impl ResourceClient for SlowResource {
    async fn get_resource(
        &self,
        _api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Value, ClientError> {
        Err(ClientError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.unwrap_or("").to_string(),
            name: name.to_string(),
        })
    }

    async fn list_resources(
        &self,
        _api_version: &str,
        _kind: &str,
        _namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClientError> {
        Ok(Vec::new())
    }

    async fn api_call(&self, _url_path: &str) -> Result<Value, ClientError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({}))
    }

    async fn can_i(
        &self,
        _kind: &str,
        _namespace: &str,
        _verb: &str,
        _subresource: &str,
        _user: &str,
    ) -> Result<bool, ClientError> {
        Ok(false)
    }
}

/// Registry serving one validated signature layer for every image, signed by
/// [`SIGNING_KEY`]. Counts its invocations so tests can assert on cache and
/// short-circuit behavior.
pub struct SignedRegistry {
    calls: AtomicUsize,
}

impl SignedRegistry {
    pub fn new() -> Self {
        SignedRegistry {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for SignedRegistry {
    async fn fetch_descriptor(&self, image: &Reference) -> Result<ImageDescriptor, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = image;
        Ok(ImageDescriptor {
            digest: "sha256:feedface".to_string(),
            manifest: json!({}),
            config: json!({}),
        })
    }

    async fn fetch_signature_layers(
        &self,
        _image: &Reference,
    ) -> Result<Vec<SignatureLayer>, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![SignatureLayer {
            payload_digest: "sha256:feedface".to_string(),
            key_fingerprint: Some(pem_fingerprint(SIGNING_KEY)),
            certificate: None,
            annotations: HashMap::new(),
        }])
    }

    async fn fetch_attestation_statements(
        &self,
        _image: &Reference,
    ) -> Result<Vec<AttestationStatement>, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Registry with no signatures at all.
pub struct UnsignedRegistry;

#[async_trait]
impl RegistryClient for UnsignedRegistry {
    async fn fetch_descriptor(
        &self,
        _image: &Reference,
    ) -> Result<ImageDescriptor, RegistryError> {
        Ok(ImageDescriptor {
            digest: "sha256:feedface".to_string(),
            manifest: json!({}),
            config: json!({}),
        })
    }

    async fn fetch_signature_layers(
        &self,
        _image: &Reference,
    ) -> Result<Vec<SignatureLayer>, RegistryError> {
        Ok(Vec::new())
    }

    async fn fetch_attestation_statements(
        &self,
        _image: &Reference,
    ) -> Result<Vec<AttestationStatement>, RegistryError> {
        Ok(Vec::new())
    }
}

pub struct NullConfigmaps;

#[async_trait]
impl ConfigmapResolver for NullConfigmaps {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<k8s_openapi::api::core::v1::ConfigMap, ClientError> {
        Err(ClientError::NotFound {
            kind: "ConfigMap".to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// Selector returning a fixed list of exceptions, regardless of the pair
/// asked about; the engine's own reference filtering is under test.
pub struct StaticExceptions(pub Vec<PolicyException>);

#[async_trait]
impl PolicyExceptionSelector for StaticExceptions {
    async fn exceptions_for(
        &self,
        _policy: &str,
        _rule: &str,
    ) -> Result<Vec<PolicyException>, ClientError> {
        Ok(self.0.clone())
    }
}

pub fn engine() -> PolicyEngine {
    PolicyEngine::new(
        Arc::new(NullResource),
        Arc::new(SignedRegistry::new()),
        Arc::new(NullConfigmaps),
        Arc::new(InMemoryImageVerifyCache::default()),
    )
}

pub fn policy(value: Value) -> PolicySpec {
    serde_json::from_value(value).expect("policy fixture must deserialize")
}

pub fn exception(value: Value) -> PolicyException {
    serde_json::from_value(value).expect("exception fixture must deserialize")
}

pub fn create_request(object: Value) -> AdmissionRequest {
    request(object, None, Operation::Create)
}

pub fn update_request(object: Value, old_object: Value) -> AdmissionRequest {
    request(object, Some(old_object), Operation::Update)
}

pub fn request(
    object: Value,
    old_object: Option<Value>,
    operation: Operation,
) -> AdmissionRequest {
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("Pod")
        .to_string();
    AdmissionRequest {
        uid: "e911ec78".to_string(),
        kind: policy_engine::admission::GroupVersionKind {
            group: "".to_string(),
            version: "v1".to_string(),
            kind,
        },
        resource: policy_engine::admission::GroupVersionResource {
            group: "".to_string(),
            version: "v1".to_string(),
            resource: "pods".to_string(),
        },
        sub_resource: None,
        request_kind: None,
        request_resource: None,
        name: object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map(str::to_string),
        namespace: Some("default".to_string()),
        operation,
        user_info: Default::default(),
        object: Some(object),
        old_object,
        dry_run: None,
        options: None,
    }
}
