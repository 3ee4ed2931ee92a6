use json_patch::jsonptr::PointerBuf;
use json_patch::{PatchOperation, RemoveOperation};
use k8s_openapi::api::core::v1::Toleration;
use tracing::{debug, info};

use crate::rules::{PodFacts, RestrictTolerations};

/// Strips restricted tolerations from a pod.
///
/// Emits one `remove` per rejected toleration, in descending index order so
/// the operations can be applied sequentially without shifting the indices
/// of tolerations still to be removed.
pub fn remove_tolerations(
    pod: &PodFacts<'_>,
    tolerations: &[Toleration],
    rules: &[RestrictTolerations],
) -> Vec<PatchOperation> {
    removal_indices(pod, tolerations, rules)
        .into_iter()
        .map(|index| {
            let index = index.to_string();
            PatchOperation::Remove(RemoveOperation {
                path: PointerBuf::from_tokens(["spec", "tolerations", index.as_str()]),
            })
        })
        .collect()
}

/// Indices of tolerations the pod may not keep, last index first.
pub fn removal_indices(
    pod: &PodFacts<'_>,
    tolerations: &[Toleration],
    rules: &[RestrictTolerations],
) -> Vec<usize> {
    let mut to_remove = Vec::new();

    // Walk from the last toleration down so the removal list comes out in
    // descending order.
    for (index, toleration) in tolerations.iter().enumerate().rev() {
        let mut removed = false;

        for (rule_index, rule) in rules.iter().enumerate() {
            if !rule.toleration.matches(toleration) {
                continue;
            }

            // The toleration is restricted; the pod keeps it only when at
            // least one allowed-pod predicate matches.
            let permitted = rule.allowed_pods.iter().any(|allowed| allowed.matches(pod));
            if !permitted {
                to_remove.push(index);
                removed = true;
                info!(
                    namespace = pod.namespace,
                    pod = pod.name,
                    index,
                    rule = rule_index,
                    toleration = %describe_toleration(toleration),
                    "removing restricted toleration"
                );
                break;
            }
        }

        if !removed {
            debug!(
                namespace = pod.namespace,
                pod = pod.name,
                index,
                toleration = %describe_toleration(toleration),
                "toleration retained"
            );
        }
    }

    to_remove
}

fn describe_toleration(toleration: &Toleration) -> String {
    format!(
        "key({}) op({}) value({}) effect({})",
        toleration.key.as_deref().unwrap_or_default(),
        toleration.operator.as_deref().unwrap_or_default(),
        toleration.value.as_deref().unwrap_or_default(),
        toleration.effect.as_deref().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::mutations::render;
    use crate::rules::RuleSet;

    const TOLERATIONS_ONE: &str =
        r#"[{"key":"key1","operator":"Equal","value":"value1","effect":"NoSchedule"}]"#;
    const TOLERATIONS_THREE: &str = r#"[
        {"key":"key1","operator":"Equal","value":"value1","effect":"NoSchedule"},
        {"key":"key2","operator":"Equal","value":"value2","effect":"NoSchedule"},
        {"key":"key3","operator":"Equal","value":"value3","effect":"NoSchedule"}
        ]"#;
    const TOLERATIONS_EXISTS: &str = r#"[
        {"key":"key1","operator":"Equal","value":"value1","effect":"NoSchedule"},
        {"operator":"Exists"},
        {"key":"key3","operator":"Exists"},
        {"operator":"Exists","value":"value3"},
        {"operator":"Exists","effect":"NoSchedule"}
        ]"#;

    const RULES_REJECT_KEY2: &str = r#"
rules:
- restrict_tolerations:
  - toleration:
      key: ^key2$
    allowed_pods:
    # negated empty patterns match nothing
    - namespace: _
      name: _
"#;

    const RULES_REJECT_ALL: &str = r#"
rules:
- restrict_tolerations:
  - toleration: {}
    allowed_pods:
    - namespace: _
      name: _
"#;

    const RULES_REJECT_ONLY_EXISTS: &str = r#"
rules:
- restrict_tolerations:
  - toleration:
      key: ^$
      operator: ^Exists$
      value: ^$
      effect: ^$
    allowed_pods:
    - namespace: _
      name: _
"#;

    const RULES_DAEMONSET_PODS_MAY_KEEP_EXISTS: &str = r#"
rules:
- restrict_tolerations:
  - toleration:
      key: ^$
      operator: ^Exists$
      value: ^$
      effect: ^$
    allowed_pods:
    # first entry matches nothing, exercising multiple allowed-pod rules
    - namespace: _
      name: _
    - name: ^daemonset-
"#;

    const RULES_DATADOG_AND: &str = r#"
rules:
- restrict_tolerations:
  - toleration:
      key: ^$
      operator: ^Exists$
      value: ^$
      effect: ^$
    allowed_pods:
    - namespace: _
      name: _
    - and:
      - namespace: ^datadog$
        name: ^datadog-
      - namespace: ^datadog$
        name: _^datadog-agent-
"#;

    const RULES_LABEL_MAY_KEEP_KEY2: &str = r#"
rules:
- restrict_tolerations:
  - toleration:
      key: ^key2$
    allowed_pods:
    - labels:
        good: pod
"#;

    struct Case {
        name: &'static str,
        rules: &'static str,
        tolerations: &'static str,
        namespace: &'static str,
        pod_name: &'static str,
        labels: &'static [(&'static str, &'static str)],
        expected: &'static [usize],
    }

    const TABLE: &[Case] = &[
        Case {
            name: "empty rule, empty tolerations",
            rules: "",
            tolerations: "[]",
            namespace: "default",
            pod_name: "pod-1",
            labels: &[],
            expected: &[],
        },
        Case {
            name: "empty rule, one toleration",
            rules: "",
            tolerations: TOLERATIONS_ONE,
            namespace: "default",
            pod_name: "pod-1",
            labels: &[],
            expected: &[],
        },
        Case {
            name: "rule rejects all, one toleration",
            rules: RULES_REJECT_ALL,
            tolerations: TOLERATIONS_ONE,
            namespace: "default",
            pod_name: "pod-1",
            labels: &[],
            expected: &[0],
        },
        Case {
            name: "rule rejects all, three tolerations",
            rules: RULES_REJECT_ALL,
            tolerations: TOLERATIONS_THREE,
            namespace: "default",
            pod_name: "pod-1",
            labels: &[],
            expected: &[2, 1, 0],
        },
        Case {
            name: "rule rejects key2",
            rules: RULES_REJECT_KEY2,
            tolerations: TOLERATIONS_THREE,
            namespace: "default",
            pod_name: "pod-1",
            labels: &[],
            expected: &[1],
        },
        Case {
            name: "no pod may carry the exact Exists toleration",
            rules: RULES_REJECT_ONLY_EXISTS,
            tolerations: TOLERATIONS_EXISTS,
            namespace: "default",
            pod_name: "pod-1",
            labels: &[],
            expected: &[1],
        },
        Case {
            name: "daemonset- prefixed pods may keep Exists, plain pod",
            rules: RULES_DAEMONSET_PODS_MAY_KEEP_EXISTS,
            tolerations: TOLERATIONS_EXISTS,
            namespace: "default",
            pod_name: "pod-1",
            labels: &[],
            expected: &[1],
        },
        Case {
            name: "daemonset- prefixed pods may keep Exists, daemonset pod",
            rules: RULES_DAEMONSET_PODS_MAY_KEEP_EXISTS,
            tolerations: TOLERATIONS_EXISTS,
            namespace: "default",
            pod_name: "daemonset-1",
            labels: &[],
            expected: &[],
        },
        Case {
            name: "and-conjunction accepts datadog- prefix",
            rules: RULES_DATADOG_AND,
            tolerations: TOLERATIONS_EXISTS,
            namespace: "datadog",
            pod_name: "datadog-",
            labels: &[],
            expected: &[],
        },
        Case {
            name: "and-conjunction rejects datadog-agent- prefix",
            rules: RULES_DATADOG_AND,
            tolerations: TOLERATIONS_EXISTS,
            namespace: "datadog",
            pod_name: "datadog-agent-",
            labels: &[],
            expected: &[1],
        },
        Case {
            name: "pod label allows key2",
            rules: RULES_LABEL_MAY_KEEP_KEY2,
            tolerations: TOLERATIONS_THREE,
            namespace: "default",
            pod_name: "pod-good-1",
            labels: &[("good", "pod")],
            expected: &[],
        },
        Case {
            name: "pod without the label loses key2",
            rules: RULES_LABEL_MAY_KEEP_KEY2,
            tolerations: TOLERATIONS_THREE,
            namespace: "default",
            pod_name: "pod-good-1",
            labels: &[],
            expected: &[1],
        },
        Case {
            name: "wrong label key loses key2",
            rules: RULES_LABEL_MAY_KEEP_KEY2,
            tolerations: TOLERATIONS_THREE,
            namespace: "default",
            pod_name: "pod-good-1",
            labels: &[("bad", "news")],
            expected: &[1],
        },
        Case {
            name: "wrong label value loses key2",
            rules: RULES_LABEL_MAY_KEEP_KEY2,
            tolerations: TOLERATIONS_THREE,
            namespace: "default",
            pod_name: "pod-good-1",
            labels: &[("good", "POD")],
            expected: &[1],
        },
    ];

    #[test]
    fn removal_indices_table() {
        for case in TABLE {
            let rules = RuleSet::load(case.rules).unwrap();
            let tolerations: Vec<Toleration> = serde_json::from_str(case.tolerations).unwrap();
            let labels: BTreeMap<String, String> = case
                .labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let pod = PodFacts {
                namespace: case.namespace,
                name: case.pod_name,
                priority_class_name: "",
                labels: &labels,
                owner_references: &[],
            };

            let indices = removal_indices(&pod, &tolerations, &rules.restrict_tolerations);
            assert_eq!(indices, case.expected, "{}", case.name);
        }
    }

    #[test]
    fn removal_indices_are_strictly_descending_and_in_bounds() {
        let rules = RuleSet::load(RULES_REJECT_ALL).unwrap();
        let tolerations: Vec<Toleration> = serde_json::from_str(TOLERATIONS_EXISTS).unwrap();
        let labels = BTreeMap::new();
        let pod = PodFacts {
            namespace: "default",
            name: "pod-1",
            priority_class_name: "",
            labels: &labels,
            owner_references: &[],
        };

        let indices = removal_indices(&pod, &tolerations, &rules.restrict_tolerations);
        assert!(!indices.is_empty());
        assert!(indices.windows(2).all(|w| w[0] > w[1]));
        assert!(indices.iter().all(|&i| i < tolerations.len()));
    }

    #[test]
    fn removal_patches() {
        let rules = RuleSet::load(RULES_REJECT_KEY2).unwrap();
        let tolerations: Vec<Toleration> = serde_json::from_str(TOLERATIONS_THREE).unwrap();
        let labels = BTreeMap::new();
        let pod = PodFacts {
            namespace: "default",
            name: "pod-1",
            priority_class_name: "",
            labels: &labels,
            owner_references: &[],
        };

        let ops = remove_tolerations(&pod, &tolerations, &rules.restrict_tolerations);
        assert_eq!(
            render(&ops),
            vec![r#"{"op":"remove","path":"/spec/tolerations/1"}"#]
        );
    }
}
