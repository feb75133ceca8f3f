//! Helpers shared by the unit tests of several modules.

use serde_json::Value;

use crate::admission::{AdmissionRequest, GroupVersionKind, GroupVersionResource, Operation};

pub(crate) fn test_request(object: Value) -> AdmissionRequest {
    test_request_with_operation(object, None, Operation::Create)
}

pub(crate) fn test_request_with_operation(
    object: Value,
    old_object: Option<Value>,
    operation: Operation,
) -> AdmissionRequest {
    AdmissionRequest {
        uid: "uid".to_string(),
        kind: GroupVersionKind {
            group: "".to_string(),
            version: "v1".to_string(),
            kind: "Pod".to_string(),
        },
        resource: GroupVersionResource {
            group: "".to_string(),
            version: "v1".to_string(),
            resource: "pods".to_string(),
        },
        sub_resource: None,
        request_kind: None,
        request_resource: None,
        name: Some("test-pod".to_string()),
        namespace: Some("default".to_string()),
        operation,
        user_info: Default::default(),
        object: Some(object),
        old_object,
        dry_run: None,
        options: None,
    }
}
