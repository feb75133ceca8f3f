use thiserror::Error;

/// Errors raised by the Kubernetes resource client and the configmap
/// resolver chain.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("resource {kind} \"{name}\" not found in namespace \"{namespace}\"")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("API error: {0}")]
    Api(String),

    #[error("request was cancelled: {0}")]
    Cancelled(String),
}

/// Errors raised by the registry client.
///
/// Network-class errors are kept apart from everything else: they turn into
/// the *error* status (the check could not run), never into *fail* (the
/// image is non-compliant).
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("image \"{0}\" not found in the registry")]
    NotFound(String),

    #[error("registry is unreachable: {0}")]
    Network(String),

    #[error("registry request was cancelled: {0}")]
    Cancelled(String),

    #[error("malformed registry payload for \"{image}\": {reason}")]
    Malformed { image: String, reason: String },
}

impl RegistryError {
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            RegistryError::Network(_) | RegistryError::Cancelled(_)
        )
    }
}

/// Cache backend failure. Callers degrade these to "treat as not cached";
/// they never fail a rule.
#[derive(Error, Debug)]
#[error("image verification cache error: {0}")]
pub struct CacheError(pub String);
