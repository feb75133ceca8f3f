use thiserror::Error;

use crate::clients::errors::{CacheError, ClientError, RegistryError};

/// Error raised when querying the evaluation context.
///
/// `NotFound` is deliberately kept apart from `Evaluation`: precondition
/// checks treat an unresolved path as "false", while a malformed expression
/// always aborts the rule.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("path \"{path}\" cannot be resolved against the current context")]
    NotFound { path: String },

    #[error("cannot evaluate \"{expression}\": {reason}")]
    Evaluation { expression: String, reason: String },
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryError::NotFound { .. })
    }
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("\"{0}\" is a reserved variable name")]
    ReservedName(String),

    #[error("variable \"{0}\" is already bound in the current scope")]
    DuplicateName(String),

    #[error("restore invoked without a matching checkpoint")]
    NoCheckpoint,
}

#[derive(Error, Debug)]
pub enum SubstitutionError {
    #[error("variable substitution failed for \"{expression}\": {source}")]
    Unresolved {
        expression: String,
        #[source]
        source: QueryError,
    },

    #[error("variable \"{expression}\" resolves to a compound value and cannot be spliced into a string")]
    NotAScalar { expression: String },
}

impl SubstitutionError {
    /// True when the substitution failed only because the referenced path is
    /// absent from the context, as opposed to being malformed.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SubstitutionError::Unresolved { source, .. } if source.is_not_found()
        )
    }
}

/// Errors raised while populating context entries declared by a rule.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("variable \"{name}\" resolved to null and no default value is provided")]
    VariableUnresolved { name: String },

    #[error("cannot load context entry \"{name}\": {source}")]
    ContextLoad {
        name: String,
        #[source]
        source: ClientError,
    },

    #[error("cannot load context entry \"{name}\" from the registry: {source}")]
    Registry {
        name: String,
        #[source]
        source: RegistryError,
    },

    #[error("context entry \"{name}\" must declare exactly one of variable, apiCall, configMap or imageRegistry")]
    AmbiguousEntry { name: String },

    #[error("malformed image reference \"{reference}\": {reason}")]
    MalformedReference { reference: String, reason: String },

    #[error(transparent)]
    Substitution(#[from] SubstitutionError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Top level error for a rule that could not be evaluated. A value of this
/// type always maps to the *error* status, never to *fail*.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Substitution(#[from] SubstitutionError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("malformed condition: {0}")]
    MalformedCondition(String),

    #[error("foreach list \"{expression}\" did not evaluate to an array")]
    ForeachListNotAnArray { expression: String },

    #[error("foreach nesting exceeds the supported depth of {0}")]
    ForeachTooDeep(usize),

    #[error("attestor nesting exceeds the supported depth of {0}")]
    AttestorTooDeep(usize),

    #[error("cannot compile expression \"{expression}\": {reason}")]
    ExpressionCompile { expression: String, reason: String },

    #[error("cannot evaluate expression \"{expression}\": {reason}")]
    ExpressionEvaluation { expression: String, reason: String },

    #[error("malformed patch: {0}")]
    MalformedPatch(String),

    #[error("cannot apply patch: {0}")]
    PatchApplication(String),

    #[error("rule \"{0}\" does not declare a mutate, validate or verifyImages body")]
    EmptyRule(String),

    #[error("resource does not contain a pod spec: {0}")]
    NotAPodSpec(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("registry failure while verifying images: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("evaluation deadline exceeded while {0}")]
    DeadlineExceeded(String),
}
