use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation};
use tracing::{debug, info};

use super::labels_value;
use crate::rules::DaemonSetRule;

/// Node selector forced onto disabled daemon-sets when a rule configures
/// none. No node carries this label, so the daemon-set schedules nowhere.
const UNSATISFIABLE_SELECTOR: (&str, &str) = ("non-existing", "true");

/// Forces a node selector onto the pod template of the first matching
/// daemon-set rule.
pub fn disable_daemonset(
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    rules: &[DaemonSetRule],
) -> Vec<PatchOperation> {
    for rule in rules {
        if !rule.matches(namespace, name, labels) {
            debug!(namespace, daemonset = name, "daemonset rule skipped");
            continue;
        }

        let node_selector = if rule.node_selector.is_empty() {
            BTreeMap::from([(
                UNSATISFIABLE_SELECTOR.0.to_string(),
                UNSATISFIABLE_SELECTOR.1.to_string(),
            )])
        } else {
            rule.node_selector.clone()
        };

        info!(
            namespace,
            daemonset = name,
            selector = ?node_selector,
            "disabling daemonset"
        );

        return vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "template", "spec", "nodeSelector"]),
            value: labels_value(&node_selector),
        })];
    }

    Vec::new()
}
