use std::collections::BTreeMap;

use json_patch::jsonptr::PointerBuf;
use json_patch::{PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::rules::{PodFacts, ResourceRule};

/// Fills container requests/limits from the rule tree.
///
/// Each target is the first non-empty entry of its precedence chain; a value
/// already declared on the pod is never overwritten, and a declared request
/// (or limit) backfills the missing counterpart before the rule value is
/// consulted. Containers where no target changes receive no patch.
pub fn derive_resources(
    pod: &PodFacts<'_>,
    containers: &[Container],
    rules: &[ResourceRule],
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();

    for rule in rules {
        if !rule.pod.matches(pod) {
            continue;
        }

        for (index, container) in containers.iter().enumerate() {
            if !rule.container.matches(&container.name) {
                continue;
            }

            let resources = container.resources.as_ref();
            let requests = resources.and_then(|r| r.requests.as_ref());
            let limits = resources.and_then(|r| r.limits.as_ref());

            let orig_req_cpu = quantity_value(requests, "cpu");
            let orig_req_mem = quantity_value(requests, "memory");
            let orig_req_es = quantity_value(requests, "ephemeral-storage");

            let orig_lim_cpu = quantity_value(limits, "cpu");
            let orig_lim_mem = quantity_value(limits, "memory");
            let orig_lim_es = quantity_value(limits, "ephemeral-storage");

            let req_cpu = derive([&orig_req_cpu, &orig_lim_cpu, &rule.cpu.requests]);
            let req_mem = derive([&orig_req_mem, &orig_lim_mem, &rule.memory.requests]);
            let req_es = derive([
                &orig_req_es,
                &orig_lim_es,
                &rule.ephemeral_storage.requests,
            ]);

            let lim_cpu = derive([&orig_lim_cpu, &orig_req_cpu, &rule.cpu.limits]);
            let lim_mem = derive([&orig_lim_mem, &orig_req_mem, &rule.memory.limits]);
            let lim_es = derive([&orig_lim_es, &orig_req_es, &rule.ephemeral_storage.limits]);

            let mut changes = Vec::new();
            record_change(&mut changes, req_cpu, &orig_req_cpu, "requests", "cpu");
            record_change(&mut changes, req_mem, &orig_req_mem, "requests", "memory");
            record_change(
                &mut changes,
                req_es,
                &orig_req_es,
                "requests",
                "ephemeral-storage",
            );
            record_change(&mut changes, lim_cpu, &orig_lim_cpu, "limits", "cpu");
            record_change(&mut changes, lim_mem, &orig_lim_mem, "limits", "memory");
            record_change(&mut changes, lim_es, &orig_lim_es, "limits", "ephemeral-storage");

            if changes.is_empty() {
                debug!(
                    namespace = pod.namespace,
                    pod = pod.name,
                    container = %container.name,
                    index,
                    "resources unchanged"
                );
                continue;
            }

            info!(
                namespace = pod.namespace,
                pod = pod.name,
                container = %container.name,
                index,
                changes = ?changes,
                "deriving resources"
            );

            let index_str = index.to_string();
            if let Some(value) = resource_object(req_cpu, req_es, req_mem) {
                ops.push(PatchOperation::Replace(ReplaceOperation {
                    path: PointerBuf::from_tokens([
                        "spec",
                        "containers",
                        index_str.as_str(),
                        "resources",
                        "requests",
                    ]),
                    value,
                }));
            }
            if let Some(value) = resource_object(lim_cpu, lim_es, lim_mem) {
                ops.push(PatchOperation::Replace(ReplaceOperation {
                    path: PointerBuf::from_tokens([
                        "spec",
                        "containers",
                        index_str.as_str(),
                        "resources",
                        "limits",
                    ]),
                    value,
                }));
            }
        }
    }

    ops
}

/// First non-empty value of the precedence chain.
fn derive<'a>(values: [&'a str; 3]) -> &'a str {
    values.into_iter().find(|v| !v.is_empty()).unwrap_or("")
}

fn record_change(changes: &mut Vec<String>, value: &str, original: &str, section: &str, name: &str) {
    if value != original {
        changes.push(format!("{section}.{name}:(old='{original}',new='{value}')"));
    }
}

/// The declared quantity for `key`, with zero treated as absent.
fn quantity_value(list: Option<&BTreeMap<String, Quantity>>, key: &str) -> String {
    match list.and_then(|quantities| quantities.get(key)) {
        Some(quantity) if !is_zero(&quantity.0) => quantity.0.clone(),
        _ => String::new(),
    }
}

fn is_zero(quantity: &str) -> bool {
    let end = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());
    let number = &quantity[..end];
    !number.is_empty() && number.parse::<f64>().is_ok_and(|v| v == 0.0)
}

fn resource_object(cpu: &str, ephemeral_storage: &str, memory: &str) -> Option<Value> {
    let mut map = Map::new();
    if !cpu.is_empty() {
        map.insert("cpu".to_string(), Value::String(cpu.to_string()));
    }
    if !ephemeral_storage.is_empty() {
        map.insert(
            "ephemeral-storage".to_string(),
            Value::String(ephemeral_storage.to_string()),
        );
    }
    if !memory.is_empty() {
        map.insert("memory".to_string(), Value::String(memory.to_string()));
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}
