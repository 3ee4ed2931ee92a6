use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation};
use tracing::{debug, info};

use super::labels_value;
use crate::rules::NamespaceRule;

/// Merges configured labels onto the first matching namespace rule. The
/// emitted value is the full merged label map, with the rule's additions
/// winning on collision.
pub fn add_namespace_labels(
    name: &str,
    labels: &BTreeMap<String, String>,
    rules: &[NamespaceRule],
) -> Vec<PatchOperation> {
    for rule in rules {
        if !rule.matches(name) {
            debug!(namespace = name, "namespace rule skipped");
            continue;
        }

        let mut merged = labels.clone();
        merged.extend(
            rule.add_labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        info!(
            namespace = name,
            existing = ?labels,
            adding = ?rule.add_labels,
            "adding namespace labels"
        );

        return vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "labels"]),
            value: labels_value(&merged),
        })];
    }

    Vec::new()
}
