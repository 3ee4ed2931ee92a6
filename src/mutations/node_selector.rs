use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{PatchOperation, RemoveOperation};
use tracing::info;

use crate::rules::PodFacts;

/// Removes every node-selector key outside the allow-list.
///
/// Key escaping for the JSON-Pointer path (`~` then `/`) is handled by the
/// pointer token encoding.
pub fn remove_node_selectors(
    pod: &PodFacts<'_>,
    node_selector: &BTreeMap<String, String>,
    accept: &[String],
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();

    for key in node_selector.keys() {
        let accepted = accept.iter().any(|a| a == key);
        info!(
            namespace = pod.namespace,
            pod = pod.name,
            key = %key,
            accepted,
            "node selector"
        );
        if !accepted {
            ops.push(PatchOperation::Remove(RemoveOperation {
                path: PointerBuf::from_tokens(["spec", "nodeSelector", key.as_str()]),
            }));
        }
    }

    ops
}
