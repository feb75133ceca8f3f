//! Populates declared context entries from their four sources: literal /
//! path-resolved variables, external API calls, configmap lookups and image
//! registry metadata.
//!
//! Entries load in declaration order; later entries may read variables
//! produced by earlier ones through the shared context.

use oci_distribution::Reference;
use serde_json::{json, Value};
use tracing::debug;

use super::substitution::{substitute_str, substitute_value};
use super::EvaluationContext;
use crate::clients::{ConfigmapResolver, RegistryClient, ResourceClient};
use crate::errors::{LoadError, QueryError};
use crate::policy::ContextEntry;

pub struct ContextLoader<'a> {
    resource_client: &'a dyn ResourceClient,
    registry_client: &'a dyn RegistryClient,
    configmap_resolver: &'a dyn ConfigmapResolver,
}

impl<'a> ContextLoader<'a> {
    pub fn new(
        resource_client: &'a dyn ResourceClient,
        registry_client: &'a dyn RegistryClient,
        configmap_resolver: &'a dyn ConfigmapResolver,
    ) -> Self {
        Self {
            resource_client,
            registry_client,
            configmap_resolver,
        }
    }

    pub async fn load(
        &self,
        ctx: &mut EvaluationContext,
        entries: &[ContextEntry],
    ) -> Result<(), LoadError> {
        for entry in entries {
            let populated = [
                entry.variable.is_some(),
                entry.api_call.is_some(),
                entry.config_map.is_some(),
                entry.image_registry.is_some(),
            ]
            .iter()
            .filter(|p| **p)
            .count();
            if populated != 1 {
                return Err(LoadError::AmbiguousEntry {
                    name: entry.name.clone(),
                });
            }

            let value = if entry.variable.is_some() {
                self.load_variable(ctx, entry)?
            } else if entry.api_call.is_some() {
                self.load_api_call(ctx, entry).await?
            } else if entry.config_map.is_some() {
                self.load_config_map(ctx, entry).await?
            } else {
                self.load_image_registry(ctx, entry).await?
            };

            debug!(entry = entry.name.as_str(), "context entry loaded");
            ctx.replace_entry(&entry.name, value)?;
        }
        Ok(())
    }

    fn load_variable(
        &self,
        ctx: &EvaluationContext,
        entry: &ContextEntry,
    ) -> Result<Value, LoadError> {
        let variable = entry.variable.as_ref().expect("checked by caller");

        let resolved = if let Some(value) = &variable.value {
            Some(substitute_value(ctx, value)?)
        } else if let Some(path) = &variable.jmes_path {
            let path = scalar_string(ctx, path)?;
            match ctx.query(&path) {
                Ok(value) => Some(value),
                Err(_) => None,
            }
        } else {
            None
        };

        // a failed resolution falls back to the default, with variables
        // substituted inside of it
        let fallback = |v: &Value| substitute_value(ctx, v);
        let value = match resolved {
            Some(Value::Null) | None => match &variable.default {
                Some(default) => fallback(default)?,
                None => Value::Null,
            },
            Some(value) => value,
        };

        if value.is_null() {
            return Err(LoadError::VariableUnresolved {
                name: entry.name.clone(),
            });
        }
        Ok(value)
    }

    async fn load_api_call(
        &self,
        ctx: &EvaluationContext,
        entry: &ContextEntry,
    ) -> Result<Value, LoadError> {
        let api_call = entry.api_call.as_ref().expect("checked by caller");

        let url_path = scalar_string(ctx, &api_call.url_path)?;
        let result = self
            .resource_client
            .api_call(&url_path)
            .await
            .map_err(|source| LoadError::ContextLoad {
                name: entry.name.clone(),
                source,
            })?;

        match &api_call.jmes_path {
            Some(expr) => {
                let expr = scalar_string(ctx, expr)?;
                Ok(apply_jmespath(&result, &expr)?)
            }
            None => Ok(result),
        }
    }

    async fn load_config_map(
        &self,
        ctx: &EvaluationContext,
        entry: &ContextEntry,
    ) -> Result<Value, LoadError> {
        let config_map = entry.config_map.as_ref().expect("checked by caller");

        let name = scalar_string(ctx, &config_map.name)?;
        let namespace = match &config_map.namespace {
            Some(ns) => scalar_string(ctx, ns)?,
            None => ctx
                .request()
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        };

        let cm = self
            .configmap_resolver
            .get(&namespace, &name)
            .await
            .map_err(|source| LoadError::ContextLoad {
                name: entry.name.clone(),
                source,
            })?;

        let data = cm.data.unwrap_or_default();
        // values holding serialized JSON containers are exposed parsed as
        // well, so rules can index into them without an explicit parse step
        let mut parsed = serde_json::Map::new();
        for (key, raw) in &data {
            if let Ok(value) = serde_json::from_str::<Value>(raw) {
                if value.is_array() || value.is_object() {
                    parsed.insert(key.clone(), value);
                }
            }
        }

        let metadata = serde_json::to_value(&cm.metadata).map_err(|e| QueryError::Evaluation {
            expression: entry.name.clone(),
            reason: e.to_string(),
        })?;

        Ok(json!({
            "data": data,
            "parsedData": parsed,
            "metadata": metadata,
        }))
    }

    async fn load_image_registry(
        &self,
        ctx: &EvaluationContext,
        entry: &ContextEntry,
    ) -> Result<Value, LoadError> {
        let image_registry = entry.image_registry.as_ref().expect("checked by caller");

        let reference_str = scalar_string(ctx, &image_registry.reference)?;
        let reference: Reference =
            reference_str
                .parse()
                .map_err(|e: oci_distribution::ParseError| LoadError::MalformedReference {
                    reference: reference_str.clone(),
                    reason: e.to_string(),
                })?;

        let descriptor = self
            .registry_client
            .fetch_descriptor(&reference)
            .await
            .map_err(|source| LoadError::Registry {
                name: entry.name.clone(),
                source,
            })?;

        let value = json!({
            "image": reference.whole(),
            "registry": reference.registry(),
            "repository": reference.repository(),
            "tag": reference.tag(),
            "digest": descriptor.digest,
            "manifest": descriptor.manifest,
            "configData": descriptor.config,
        });
        // round-trip so that every number ends up in the canonical JSON
        // representation the query evaluator compares with
        let value = normalize(value)?;

        match &image_registry.jmes_path {
            Some(expr) => {
                let expr = scalar_string(ctx, expr)?;
                Ok(apply_jmespath(&value, &expr)?)
            }
            None => Ok(value),
        }
    }
}

/// Substitute variables inside `input` and require a scalar string result.
fn scalar_string(ctx: &EvaluationContext, input: &str) -> Result<String, LoadError> {
    match substitute_str(ctx, input)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Ok(other.to_string()),
    }
}

/// Evaluate a JMESPath expression against a standalone value (not the whole
/// context). A null result stays null; only evaluation problems error.
fn apply_jmespath(value: &Value, expression: &str) -> Result<Value, QueryError> {
    let compiled = jmespath::compile(expression).map_err(|e| QueryError::Evaluation {
        expression: expression.to_string(),
        reason: e.to_string(),
    })?;
    let data =
        jmespath::Variable::from_serializable(value).map_err(|e| QueryError::Evaluation {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
    let result = compiled.search(data).map_err(|e| QueryError::Evaluation {
        expression: expression.to_string(),
        reason: e.to_string(),
    })?;
    serde_json::to_value(&*result).map_err(|e| QueryError::Evaluation {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn normalize(value: Value) -> Result<Value, QueryError> {
    let text = serde_json::to_string(&value).map_err(|e| QueryError::Evaluation {
        expression: "normalize".to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&text).map_err(|e| QueryError::Evaluation {
        expression: "normalize".to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::errors::{ClientError, RegistryError};
    use crate::clients::ImageDescriptor;
    use crate::policy::{ApiCallEntry, ConfigMapEntry, ImageRegistryEntry, VariableEntry};
    use crate::test_utils::test_request;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::collections::BTreeMap;

    struct FakeResourceClient;

    #[async_trait]
    impl ResourceClient for FakeResourceClient {
        async fn get_resource(
            &self,
            _api_version: &str,
            _kind: &str,
            _namespace: Option<&str>,
            _name: &str,
        ) -> Result<Value, ClientError> {
            Err(ClientError::Api("not wired".to_string()))
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
            if url_path == "/api/v1/namespaces/default/pods" {
                Ok(json!({"items": [{"metadata": {"name": "a"}}, {"metadata": {"name": "b"}}]}))
            } else {
                Err(ClientError::Api(format!("unexpected path {url_path}")))
            }
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

    struct FakeRegistryClient;

    #[async_trait]
    impl RegistryClient for FakeRegistryClient {
        async fn fetch_descriptor(
            &self,
            image: &Reference,
        ) -> Result<ImageDescriptor, RegistryError> {
            Ok(ImageDescriptor {
                digest: "sha256:abc123".to_string(),
                manifest: json!({"schemaVersion": 2, "layers": [{"size": 1024u64}]}),
                config: json!({"architecture": "amd64", "os": "linux", "image": image.whole()}),
            })
        }

        async fn fetch_signature_layers(
            &self,
            _image: &Reference,
        ) -> Result<Vec<crate::clients::SignatureLayer>, RegistryError> {
            Ok(Vec::new())
        }

        async fn fetch_attestation_statements(
            &self,
            _image: &Reference,
        ) -> Result<Vec<crate::clients::AttestationStatement>, RegistryError> {
            Ok(Vec::new())
        }
    }

    struct FakeConfigmapResolver;

    #[async_trait]
    impl ConfigmapResolver for FakeConfigmapResolver {
        async fn get(&self, namespace: &str, name: &str) -> Result<ConfigMap, ClientError> {
            if namespace == "default" && name == "clusterwide-settings" {
                Ok(ConfigMap {
                    data: Some(BTreeMap::from([
                        ("maxReplicas".to_string(), "5".to_string()),
                        (
                            "allowedRegistries".to_string(),
                            r#"["ghcr.io", "docker.io"]"#.to_string(),
                        ),
                    ])),
                    ..Default::default()
                })
            } else {
                Err(ClientError::NotFound {
                    kind: "ConfigMap".to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
        }
    }

    fn loader_fixtures() -> (
        FakeResourceClient,
        FakeRegistryClient,
        FakeConfigmapResolver,
    ) {
        (FakeResourceClient, FakeRegistryClient, FakeConfigmapResolver)
    }

    fn context() -> EvaluationContext {
        EvaluationContext::new(test_request(json!({
            "metadata": {"name": "web", "namespace": "default"}
        })))
        .unwrap()
    }

    #[tokio::test]
    async fn variable_entry_resolves_path_with_default_fallback() {
        let (rc, reg, cm) = loader_fixtures();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = context();

        let entries = vec![
            ContextEntry {
                name: "podName".to_string(),
                variable: Some(VariableEntry {
                    jmes_path: Some("object.metadata.name".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ContextEntry {
                name: "tier".to_string(),
                variable: Some(VariableEntry {
                    jmes_path: Some("object.metadata.labels.tier".to_string()),
                    default: Some(json!("backend-{{ podName }}")),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        loader.load(&mut ctx, &entries).await.unwrap();
        assert_eq!(ctx.query("podName").unwrap(), json!("web"));
        // missing label fell back to the default, which itself read the
        // variable loaded right before it
        assert_eq!(ctx.query("tier").unwrap(), json!("backend-web"));
    }

    #[tokio::test]
    async fn variable_entry_without_value_or_default_is_unresolved() {
        let (rc, reg, cm) = loader_fixtures();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = context();

        let entries = vec![ContextEntry {
            name: "missing".to_string(),
            variable: Some(VariableEntry {
                jmes_path: Some("object.spec.nope".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }];

        let err = loader.load(&mut ctx, &entries).await.unwrap_err();
        assert!(matches!(err, LoadError::VariableUnresolved { name } if name == "missing"));
    }

    #[tokio::test]
    async fn api_call_substitutes_variables_and_narrows() {
        let (rc, reg, cm) = loader_fixtures();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = context();

        let entries = vec![ContextEntry {
            name: "podNames".to_string(),
            api_call: Some(ApiCallEntry {
                url_path: "/api/v1/namespaces/{{ request.namespace }}/pods".to_string(),
                jmes_path: Some("items[*].metadata.name".to_string()),
            }),
            ..Default::default()
        }];

        loader.load(&mut ctx, &entries).await.unwrap();
        assert_eq!(ctx.query("podNames").unwrap(), json!(["a", "b"]));
    }

    #[tokio::test]
    async fn config_map_defaults_namespace_and_parses_container_values() {
        let (rc, reg, cm) = loader_fixtures();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = context();

        let entries = vec![ContextEntry {
            name: "settings".to_string(),
            config_map: Some(ConfigMapEntry {
                name: "clusterwide-settings".to_string(),
                namespace: None,
            }),
            ..Default::default()
        }];

        loader.load(&mut ctx, &entries).await.unwrap();
        assert_eq!(ctx.query("settings.data.maxReplicas").unwrap(), json!("5"));
        assert_eq!(
            ctx.query("settings.parsedData.allowedRegistries").unwrap(),
            json!(["ghcr.io", "docker.io"])
        );
    }

    #[tokio::test]
    async fn image_registry_entry_exposes_descriptor_and_narrows() {
        let (rc, reg, cm) = loader_fixtures();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = context();

        let entries = vec![ContextEntry {
            name: "imageData".to_string(),
            image_registry: Some(ImageRegistryEntry {
                reference: "ghcr.io/acme/app:v1".to_string(),
                jmes_path: None,
            }),
            ..Default::default()
        }];

        loader.load(&mut ctx, &entries).await.unwrap();
        assert_eq!(ctx.query("imageData.digest").unwrap(), json!("sha256:abc123"));
        assert_eq!(
            ctx.query("imageData.configData.architecture").unwrap(),
            json!("amd64")
        );
    }

    #[tokio::test]
    async fn an_entry_with_two_loaders_is_rejected() {
        let (rc, reg, cm) = loader_fixtures();
        let loader = ContextLoader::new(&rc, &reg, &cm);
        let mut ctx = context();

        let entries = vec![ContextEntry {
            name: "broken".to_string(),
            variable: Some(VariableEntry::default()),
            api_call: Some(ApiCallEntry::default()),
            ..Default::default()
        }];

        let err = loader.load(&mut ctx, &entries).await.unwrap_err();
        assert!(matches!(err, LoadError::AmbiguousEntry { name } if name == "broken"));
    }
}
