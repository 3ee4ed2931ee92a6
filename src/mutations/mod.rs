pub mod daemonset;
pub mod namespace;
pub mod node_selector;
pub mod placement;
pub mod resources;
pub mod tolerations;

use std::collections::BTreeMap;

use serde_json::Value;

/// Renders a label/selector map as a JSON object value. BTreeMap iteration
/// keeps the emitted keys sorted, so identical inputs produce identical
/// patch bytes.
pub(crate) fn labels_value(labels: &BTreeMap<String, String>) -> Value {
    Value::Object(
        labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
pub(crate) fn render(ops: &[json_patch::PatchOperation]) -> Vec<String> {
    ops.iter()
        .map(|op| serde_json::to_string(op).unwrap())
        .collect()
}
