//! The scoped, checkpointable variable store a rule is evaluated against.
//!
//! Bindings live in an append-only arena of (name, value) pairs; later
//! entries shadow earlier ones. `checkpoint` pushes the current arena length
//! and `restore` truncates back to it, which guarantees that sibling foreach
//! elements and sibling rules never observe each other's bindings.

pub mod loader;
pub mod substitution;

use serde_json::Value;

use crate::admission::{AdmissionRequest, Operation};
use crate::errors::{ContextError, QueryError};

/// Variable names owned by the engine; rules cannot rebind them directly.
const RESERVED_NAMES: [&str; 6] = [
    "request",
    "object",
    "oldObject",
    "element",
    "elementIndex",
    "images",
];

#[derive(Clone, Debug)]
pub struct EvaluationContext {
    request: AdmissionRequest,
    entries: Vec<(String, Value)>,
    checkpoints: Vec<usize>,
    /// Arena length right after construction; `reset` never truncates below
    /// this point.
    base_len: usize,
}

impl EvaluationContext {
    pub fn new(request: AdmissionRequest) -> Result<Self, QueryError> {
        let request_value = serde_json::to_value(&request).map_err(|e| QueryError::Evaluation {
            expression: "request".to_string(),
            reason: e.to_string(),
        })?;

        let mut entries = vec![("request".to_string(), request_value)];
        if let Some(object) = &request.object {
            entries.push(("object".to_string(), object.clone()));
        }
        if let Some(old_object) = &request.old_object {
            entries.push(("oldObject".to_string(), old_object.clone()));
        }

        let base_len = entries.len();
        Ok(EvaluationContext {
            request,
            entries,
            checkpoints: Vec::new(),
            base_len,
        })
    }

    pub fn request(&self) -> &AdmissionRequest {
        &self.request
    }

    /// The resource currently bound for evaluation: the latest `object`
    /// shadow, falling back to the admission request's target object.
    pub fn resource(&self) -> Option<&Value> {
        self.lookup("object")
            .or_else(|| self.request.target_object())
    }

    pub fn old_resource(&self) -> Option<&Value> {
        self.lookup("oldObject")
    }

    /// The admission operation currently in effect. Old-object re-evaluation
    /// shadows it through the `request` binding.
    pub fn operation(&self) -> Operation {
        self.lookup("request")
            .and_then(|r| r.get("operation"))
            .and_then(|o| serde_json::from_value(o.clone()).ok())
            .unwrap_or(self.request.operation)
    }

    /// Bind a rule-declared variable. Reserved names are rejected; a name
    /// already bound in the current scope is rejected as well (shadowing a
    /// parent scope's binding is fine).
    pub fn add_entry(&mut self, name: &str, value: Value) -> Result<(), ContextError> {
        if RESERVED_NAMES.contains(&name) {
            return Err(ContextError::ReservedName(name.to_string()));
        }
        let scope_start = self.checkpoints.last().copied().unwrap_or(self.base_len);
        if self.entries[scope_start..].iter().any(|(n, _)| n == name) {
            return Err(ContextError::DuplicateName(name.to_string()));
        }
        self.entries.push((name.to_string(), value));
        Ok(())
    }

    /// Bind or shadow a variable without the uniqueness check.
    pub fn replace_entry(&mut self, name: &str, value: Value) -> Result<(), ContextError> {
        if RESERVED_NAMES.contains(&name) {
            return Err(ContextError::ReservedName(name.to_string()));
        }
        self.entries.push((name.to_string(), value));
        Ok(())
    }

    /// Engine-internal binding of reserved names (element, images, resource
    /// swaps). Always a shadow push so `restore` undoes it.
    pub(crate) fn bind(&mut self, name: &str, value: Value) {
        self.entries.push((name.to_string(), value));
    }

    pub(crate) fn bind_resource(&mut self, resource: Value) {
        self.bind("object", resource);
    }

    pub(crate) fn bind_element(&mut self, element: Value, index: usize) {
        self.bind("element", element);
        self.bind("elementIndex", Value::from(index));
    }

    pub(crate) fn bind_images(&mut self, images: Value) {
        self.bind("images", images);
    }

    /// Shadow the `request` binding, adjusting `object`/`oldObject`/
    /// `operation` for old-object re-evaluation. Wrapped in checkpoint /
    /// restore by the caller.
    pub(crate) fn bind_request_override(&mut self, object: Value, operation: Operation) {
        let mut request_value = self
            .lookup("request")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Value::Object(map) = &mut request_value {
            map.insert("object".to_string(), object.clone());
            map.insert("oldObject".to_string(), Value::Null);
            map.insert(
                "operation".to_string(),
                Value::String(operation.to_string()),
            );
        }
        self.bind("request", request_value);
        self.bind("oldObject", Value::Null);
        self.bind_resource(object);
    }

    /// Push a checkpoint. Every binding added afterwards is removed by the
    /// matching `restore`.
    pub fn checkpoint(&mut self) {
        self.checkpoints.push(self.entries.len());
    }

    /// Pop the last checkpoint and drop every binding added since.
    pub fn restore(&mut self) -> Result<(), ContextError> {
        let mark = self.checkpoints.pop().ok_or(ContextError::NoCheckpoint)?;
        self.entries.truncate(mark);
        Ok(())
    }

    /// Drop bindings added since the last checkpoint without popping it,
    /// ready for the next foreach element.
    pub fn reset(&mut self) {
        let mark = self.checkpoints.last().copied().unwrap_or(self.base_len);
        self.entries.truncate(mark);
    }

    /// An independent scope sharing the same backing request data.
    pub fn copy(&self) -> Self {
        EvaluationContext {
            request: self.request.clone(),
            entries: self.entries.clone(),
            checkpoints: Vec::new(),
            base_len: self.base_len,
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// The union of all visible bindings, later bindings shadowing earlier
    /// ones, as one JSON object for the query evaluator.
    fn snapshot(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.entries {
            map.insert(name.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Evaluate a JMESPath expression against the visible bindings.
    ///
    /// A null result is reported as `NotFound` so that precondition
    /// evaluation can treat missing data as false rather than erroring.
    pub fn query(&self, expression: &str) -> Result<Value, QueryError> {
        let compiled =
            jmespath::compile(expression).map_err(|e| QueryError::Evaluation {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        let data = jmespath::Variable::from_serializable(self.snapshot()).map_err(|e| {
            QueryError::Evaluation {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;

        let result = compiled
            .search(data)
            .map_err(|e| QueryError::Evaluation {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        if result.is_null() {
            return Err(QueryError::NotFound {
                path: expression.to_string(),
            });
        }

        serde_json::to_value(&*result).map_err(|e| QueryError::Evaluation {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
    }
}
