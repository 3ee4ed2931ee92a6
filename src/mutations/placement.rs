use std::collections::{BTreeMap, HashMap, HashSet};

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation, RemoveOperation};
use k8s_openapi::api::core::v1::Container;
use serde_json::Value;
use tracing::{error, info};

use super::labels_value;
use crate::rules::{AddSpec, ContainerAdditions, PlacePods, PodFacts, TolerationSpec};

/// Applies the first matching placement entry: appended tolerations, node
/// selector, container env vars, and priority class.
pub fn add_placement(
    pod: &PodFacts<'_>,
    priority: Option<i32>,
    containers: &[Container],
    place_pods: &[PlacePods],
) -> Vec<PatchOperation> {
    for entry in place_pods {
        if entry.matches(pod) {
            return apply_additions(pod, priority, containers, &entry.add);
        }
    }
    Vec::new()
}

fn apply_additions(
    pod: &PodFacts<'_>,
    priority: Option<i32>,
    containers: &[Container],
    add: &AddSpec,
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();

    for toleration in &add.tolerations {
        ops.push(append_toleration(pod, toleration));
    }

    if !add.node_selector.is_empty() {
        info!(
            namespace = pod.namespace,
            pod = pod.name,
            selector = ?add.node_selector,
            "setting node selector"
        );
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "nodeSelector"]),
            value: labels_value(&add.node_selector),
        }));
    }

    if !add.containers.is_empty() {
        ops.extend(append_container_env(pod, containers, &add.containers));
    }

    if !add.priority_class_name.is_empty() {
        ops.extend(set_priority_class(pod, &add.priority_class_name, priority));
    }

    ops
}

fn append_toleration(pod: &PodFacts<'_>, toleration: &TolerationSpec) -> PatchOperation {
    info!(
        namespace = pod.namespace,
        pod = pod.name,
        key = %toleration.key,
        operator = %toleration.operator,
        value = %toleration.value,
        effect = %toleration.effect,
        "appending toleration"
    );
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["spec", "tolerations", "-"]),
        value: serde_json::to_value(toleration)
            .expect("toleration spec serialization is infallible"),
    })
}

fn append_container_env(
    pod: &PodFacts<'_>,
    containers: &[Container],
    configured: &BTreeMap<String, ContainerAdditions>,
) -> Vec<PatchOperation> {
    let index_by_name: HashMap<&str, usize> = containers
        .iter()
        .enumerate()
        .map(|(index, container)| (container.name.as_str(), index))
        .collect();
    let mut initialized: HashSet<usize> = HashSet::new();
    let mut ops = Vec::new();

    for (name, additions) in configured {
        let Some(&index) = index_by_name.get(name.as_str()) else {
            error!(
                namespace = pod.namespace,
                pod = pod.name,
                container = %name,
                "container not found for env additions"
            );
            continue;
        };
        let index_str = index.to_string();

        for entry in &additions.env {
            let Some(env_name) = entry.get("name") else {
                error!(
                    namespace = pod.namespace,
                    pod = pod.name,
                    container = %name,
                    "env entry missing name"
                );
                continue;
            };
            let Some(env_name) = env_name.as_str() else {
                error!(
                    namespace = pod.namespace,
                    pod = pod.name,
                    container = %name,
                    name_value = %env_name,
                    "env entry name is not a string"
                );
                continue;
            };

            // Appending with the `-` index requires the env array to exist.
            let env_missing = containers[index]
                .env
                .as_ref()
                .map_or(true, |env| env.is_empty());
            if env_missing && initialized.insert(index) {
                ops.push(PatchOperation::Add(AddOperation {
                    path: PointerBuf::from_tokens([
                        "spec",
                        "containers",
                        index_str.as_str(),
                        "env",
                    ]),
                    value: Value::Array(Vec::new()),
                }));
            }

            info!(
                namespace = pod.namespace,
                pod = pod.name,
                container = %name,
                index,
                env = env_name,
                "appending env var"
            );
            ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens([
                    "spec",
                    "containers",
                    index_str.as_str(),
                    "env",
                    "-",
                ]),
                value: entry.clone(),
            }));
        }
    }

    ops
}

fn set_priority_class(
    pod: &PodFacts<'_>,
    new_class: &str,
    priority: Option<i32>,
) -> Vec<PatchOperation> {
    info!(
        namespace = pod.namespace,
        pod = pod.name,
        old_class = pod.priority_class_name,
        new_class,
        old_priority = ?priority,
        "setting priority class"
    );

    let mut ops = vec![PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["spec", "priorityClassName"]),
        value: Value::String(new_class.to_string()),
    })];

    // The numeric priority was computed from the old class; drop it so the
    // control plane recomputes it from the new one.
    if priority.is_some() {
        ops.push(PatchOperation::Remove(RemoveOperation {
            path: PointerBuf::from_tokens(["spec", "priority"]),
        }));
    }

    ops
}
