//! Extraction of container image references from pod-carrying resources,
//! and the `images` context index bound for rules that reference
//! `{{ images.containers.<name>.tag }}` style variables.

use oci_distribution::Reference;
use serde_json::{json, Value};
use tracing::warn;

/// One container image reference, parsed and located inside the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Container name the image belongs to.
    pub container: String,
    /// The reference exactly as written in the resource.
    pub reference: String,
    pub registry: String,
    pub repository: String,
    /// Last path segment of the repository.
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
    /// JSON pointer to the image field, used to emit digest rewrite patches.
    pub pointer: String,
    /// Which container list the image came from.
    pub section: ImageSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSection {
    Containers,
    InitContainers,
    EphemeralContainers,
}

impl ImageSection {
    fn key(self) -> &'static str {
        match self {
            ImageSection::Containers => "containers",
            ImageSection::InitContainers => "initContainers",
            ImageSection::EphemeralContainers => "ephemeralContainers",
        }
    }
}

impl ImageInfo {
    /// The digest-qualified form of this reference, used for rewrite
    /// patches.
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}/{}@{}", self.registry, self.repository, digest)
    }
}

/// Collect every container image of the resource, walking the pod spec
/// wherever the resource kind keeps it. Unparseable references are skipped
/// with a warning rather than failing the whole extraction.
pub fn extract_images(resource: &Value) -> Vec<ImageInfo> {
    let Some((spec, prefix)) = pod_spec_pointer(resource) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for section in [
        ImageSection::Containers,
        ImageSection::InitContainers,
        ImageSection::EphemeralContainers,
    ] {
        let Some(containers) = spec.get(section.key()).and_then(Value::as_array) else {
            continue;
        };
        for (i, container) in containers.iter().enumerate() {
            let name = container.get("name").and_then(Value::as_str).unwrap_or("");
            let Some(image) = container.get("image").and_then(Value::as_str) else {
                continue;
            };
            let pointer = format!("{prefix}/{}/{i}/image", section.key());
            match parse_reference(name, image, &pointer, section) {
                Some(info) => out.push(info),
                None => warn!(container = name, image, "skipping unparseable image reference"),
            }
        }
    }
    out
}

fn parse_reference(
    container: &str,
    image: &str,
    pointer: &str,
    section: ImageSection,
) -> Option<ImageInfo> {
    let reference: Reference = image.parse().ok()?;
    let repository = reference.repository().to_string();
    let name = repository
        .rsplit('/')
        .next()
        .unwrap_or(repository.as_str())
        .to_string();
    Some(ImageInfo {
        container: container.to_string(),
        reference: image.to_string(),
        registry: reference.registry().to_string(),
        repository,
        name,
        tag: reference.tag().map(str::to_string),
        digest: reference.digest().map(str::to_string),
        pointer: pointer.to_string(),
        section,
    })
}

/// The JSON value bound as the `images` variable: one map per container
/// section, keyed by container name.
pub fn images_index(images: &[ImageInfo]) -> Value {
    let mut sections = serde_json::Map::new();
    for info in images {
        let entry = json!({
            "image": info.reference,
            "registry": info.registry,
            "repository": info.repository,
            "name": info.name,
            "tag": info.tag,
            "digest": info.digest,
            "jsonPointer": info.pointer,
        });
        sections
            .entry(info.section.key().to_string())
            .or_insert_with(|| Value::Object(Default::default()))
            .as_object_mut()
            .expect("section entries are objects")
            .insert(info.container.clone(), entry);
    }
    Value::Object(sections)
}

fn pod_spec_pointer(resource: &Value) -> Option<(&Value, String)> {
    let kind = resource.get("kind").and_then(Value::as_str).unwrap_or("");
    match kind {
        "Pod" => resource.get("spec").map(|s| (s, "/spec".to_string())),
        "CronJob" => resource
            .pointer("/spec/jobTemplate/spec/template/spec")
            .map(|s| (s, "/spec/jobTemplate/spec/template/spec".to_string())),
        _ => resource
            .pointer("/spec/template/spec")
            .map(|s| (s, "/spec/template/spec".to_string()))
            .or_else(|| resource.get("spec").map(|s| (s, "/spec".to_string()))),
    }
}
