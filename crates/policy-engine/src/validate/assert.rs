//! Subset assertions: a declarative "these fields must look exactly like
//! this" check, stricter than patterns. No anchors, no operators; objects
//! recurse, list elements are compared by index, scalars by equality (a
//! lone `*` accepts any present value).

use serde_json::Value;

use super::pattern::{PatternViolation, ViolationKind};
use crate::wildcard::wildcard_match;

pub fn match_assert(resource: &Value, assertion: &Value) -> Result<(), PatternViolation> {
    assert_at(resource, assertion, "")
}

fn assert_at(resource: &Value, assertion: &Value, path: &str) -> Result<(), PatternViolation> {
    match assertion {
        Value::Object(fields) => {
            let Value::Object(resource_map) = resource else {
                return Err(fail(path, format!("expected an object, found {resource}")));
            };
            for (field, expected) in fields {
                let child = format!("{path}/{field}");
                match resource_map.get(field) {
                    None => {
                        return Err(fail(
                            &child,
                            format!("required field \"{field}\" is missing"),
                        ))
                    }
                    Some(actual) => assert_at(actual, expected, &child)?,
                }
            }
            Ok(())
        }
        Value::Array(expected_items) => {
            let Value::Array(actual_items) = resource else {
                return Err(fail(path, format!("expected a list, found {resource}")));
            };
            for (i, expected) in expected_items.iter().enumerate() {
                let child = format!("{path}/{i}");
                match actual_items.get(i) {
                    None => return Err(fail(&child, format!("list element {i} is missing"))),
                    Some(actual) => assert_at(actual, expected, &child)?,
                }
            }
            Ok(())
        }
        Value::String(expected) => {
            let matched = match resource {
                Value::String(actual) => {
                    expected == actual || (expected == "*" || wildcard_match(expected, actual))
                }
                other => expected == "*" && !other.is_null(),
            };
            if matched {
                Ok(())
            } else {
                Err(fail(
                    path,
                    format!("expected \"{expected}\", found {resource}"),
                ))
            }
        }
        other => {
            if resource == other {
                Ok(())
            } else {
                Err(fail(path, format!("expected {other}, found {resource}")))
            }
        }
    }
}

fn fail(path: &str, message: String) -> PatternViolation {
    PatternViolation {
        kind: ViolationKind::Fail,
        path: path.to_string(),
        message,
    }
}
