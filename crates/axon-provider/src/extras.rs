//! Extra-parameter plumbing for provider requests.

use serde_json::{Map, Value};

/// Merge the client-wide extras map with per-request overrides.
///
/// The inputs are copied — the client-wide map is never mutated in place.
/// `parallel_tool_calls` is stripped when the request carries no tools;
/// several backends reject it on tool-free requests.
pub fn merge_extras(base: &Map<String, Value>, overrides: &Map<String, Value>, has_tools: bool) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    if !has_tools {
        merged.remove("parallel_tool_calls");
    }
    merged
}

/// Apply merged extras onto a request body object. Existing keys set by the
/// driver are overwritten deliberately — extras are the escape hatch.
pub fn apply_extras(body: &mut Value, extras: &Map<String, Value>) {
    if let Some(obj) = body.as_object_mut() {
        for (key, value) in extras {
            obj.insert(key.clone(), value.clone());
        }
    }
}
