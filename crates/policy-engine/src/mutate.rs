//! Resource mutation: RFC 6902 patch lists and strategic-merge overlays.
//!
//! Both flavors return the patched resource together with the list of
//! `{op, path, value}` operations actually applied, so the caller can emit
//! them on the rule response. The operation list must be reproducible for
//! the same input, as reports diff it across runs.

use json_patch::PatchOperation;
use serde_json::Value;

use crate::context::substitution::substitute_value;
use crate::context::EvaluationContext;
use crate::errors::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub patched: Value,
    pub patches: Vec<PatchOperation>,
}

impl MutationOutcome {
    pub fn is_noop(&self) -> bool {
        self.patches.is_empty()
    }
}

/// Apply an RFC 6902 patch list, declared as YAML or JSON text so that
/// variables can be substituted before parsing.
pub fn apply_patches_json6902(
    ctx: &EvaluationContext,
    resource: &Value,
    declared: &str,
) -> Result<MutationOutcome, EngineError> {
    let raw: Value = serde_yaml::from_str(declared)
        .map_err(|e| EngineError::MalformedPatch(e.to_string()))?;
    let substituted = substitute_value(ctx, &raw)?;
    let patch: json_patch::Patch = serde_json::from_value(substituted)
        .map_err(|e| EngineError::MalformedPatch(e.to_string()))?;

    let mut patched = resource.clone();
    json_patch::patch(&mut patched, &patch)
        .map_err(|e| EngineError::PatchApplication(e.to_string()))?;

    Ok(MutationOutcome {
        patched,
        patches: patch.0,
    })
}

/// Merge a strategic-merge overlay into the resource and report the change
/// as a JSON-patch list (computed by diffing before and after).
///
/// Overlay keys may carry two anchors: `(field)` makes the enclosing object
/// merge conditional on the resource value matching, and `+(field)` sets
/// the field only when it is absent.
pub fn apply_strategic_merge(
    ctx: &EvaluationContext,
    resource: &Value,
    overlay: &Value,
) -> Result<MutationOutcome, EngineError> {
    let overlay = substitute_value(ctx, overlay)?;
    let mut patched = resource.clone();
    merge_into(&mut patched, &overlay);

    let patch = json_patch::diff(resource, &patched);
    Ok(MutationOutcome {
        patched,
        patches: patch.0,
    })
}

fn merge_into(target: &mut Value, overlay: &Value) {
    match overlay {
        Value::Object(overlay_map) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            let target_map = target.as_object_mut().expect("made an object above");

            // conditional anchors gate the whole object merge
            for (key, condition) in overlay_map {
                if let Some(field) = conditional_anchor(key) {
                    let holds = target_map
                        .get(field)
                        .map(|actual| anchor_matches(actual, condition))
                        .unwrap_or(false);
                    if !holds {
                        return;
                    }
                }
            }

            for (key, value) in overlay_map {
                if conditional_anchor(key).is_some() {
                    continue;
                }
                if let Some(field) = add_if_absent_anchor(key) {
                    if !target_map.contains_key(field) {
                        target_map.insert(field.to_string(), strip_anchors(value));
                    }
                    continue;
                }
                match target_map.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        target_map.insert(key.clone(), strip_anchors(value));
                    }
                }
            }
        }
        Value::Array(overlay_items) => match target {
            // named list elements merge by their `name` key, kubernetes style
            Value::Array(target_items) if merges_by_name(overlay_items, target_items) => {
                for overlay_item in overlay_items {
                    let name = overlay_item.get("name").and_then(Value::as_str);
                    let existing = target_items.iter_mut().find(|item| {
                        item.get("name").and_then(Value::as_str) == name
                    });
                    match existing {
                        Some(item) => merge_into(item, overlay_item),
                        None => target_items.push(strip_anchors(overlay_item)),
                    }
                }
            }
            _ => *target = strip_anchors(overlay),
        },
        scalar => *target = scalar.clone(),
    }
}

fn merges_by_name(overlay_items: &[Value], target_items: &[Value]) -> bool {
    let named = |items: &[Value]| {
        !items.is_empty()
            && items
                .iter()
                .all(|item| item.get("name").map(Value::is_string).unwrap_or(false))
    };
    named(overlay_items) && (target_items.is_empty() || named(target_items))
}

fn anchor_matches(actual: &Value, condition: &Value) -> bool {
    match (actual, condition) {
        (Value::String(a), Value::String(c)) => crate::wildcard::wildcard_match(c, a),
        _ => actual == condition,
    }
}

fn conditional_anchor(key: &str) -> Option<&str> {
    if key.starts_with("+(") {
        return None;
    }
    key.strip_prefix('(').and_then(|rest| rest.strip_suffix(')'))
}

fn add_if_absent_anchor(key: &str) -> Option<&str> {
    key.strip_prefix("+(").and_then(|rest| rest.strip_suffix(')'))
}

/// Deep-copy an overlay value with anchor markers removed from object keys,
/// for insertion into the resource.
fn strip_anchors(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                if conditional_anchor(key).is_some() {
                    continue;
                }
                let key = add_if_absent_anchor(key).unwrap_or(key);
                out.insert(key.to_string(), strip_anchors(item));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_anchors).collect()),
        other => other.clone(),
    }
}
