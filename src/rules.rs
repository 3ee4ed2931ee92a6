use std::collections::BTreeMap;
use std::fs;

use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::pattern::Pattern;

/// Ceiling on recursive `and` nesting inside pod predicates.
pub const MAX_AND_DEPTH: usize = 32;

/// Label values carrying this prefix are matched as regular expressions
/// instead of literal strings. The prefix is part of the value, so a literal
/// value starting with `regexp=` cannot be expressed.
pub const LABEL_REGEXP_PREFIX: &str = "regexp=";

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse rules document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("pod predicate 'and' nesting exceeds depth limit {limit}")]
    NestingTooDeep { limit: usize },
}

/// The compiled rule tree. Built once at startup, read-only afterwards.
///
/// Every pattern field is compiled while the document deserializes, so the
/// request path never compiles rule regexes. The one exception is
/// `regexp=`-prefixed label values, which compile lazily per evaluation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub restrict_tolerations: Vec<RestrictTolerations>,
    pub place_pods: Vec<PlacePods>,
    pub resources: Vec<ResourceRule>,
    pub disable_daemonsets: Vec<DaemonSetRule>,
    pub namespaces_add_labels: Vec<NamespaceRule>,
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    rules: Option<Vec<RuleSet>>,
}

impl RuleSet {
    pub fn load_file(path: &str) -> Result<Self, RulesError> {
        let data = fs::read_to_string(path).map_err(|source| RulesError::FileRead {
            path: path.to_string(),
            source,
        })?;
        Self::load(&data)
    }

    /// Parses the rule document. The canonical form is a top-level `rules:`
    /// list; a document whose top level is a bare rule group is treated as a
    /// list of length one, and an empty document yields an empty rule set.
    /// Multiple list entries are merged element-wise, concatenating each
    /// family's lists in document order.
    pub fn load(document: &str) -> Result<Self, RulesError> {
        let value: serde_yaml::Value = serde_yaml::from_str(document)?;

        let groups = if value.is_null() {
            Vec::new()
        } else if value.get("rules").is_some() {
            serde_yaml::from_value::<RuleDocument>(value)?
                .rules
                .unwrap_or_default()
        } else {
            vec![serde_yaml::from_value::<RuleSet>(value)?]
        };

        let mut merged = Self::default();
        for group in groups {
            merged.restrict_tolerations.extend(group.restrict_tolerations);
            merged.place_pods.extend(group.place_pods);
            merged.resources.extend(group.resources);
            merged.disable_daemonsets.extend(group.disable_daemonsets);
            merged
                .namespaces_add_labels
                .extend(group.namespaces_add_labels);
        }
        merged.check_depth()?;
        Ok(merged)
    }

    fn check_depth(&self) -> Result<(), RulesError> {
        fn within(rule: &PodRule, remaining: usize) -> bool {
            if remaining == 0 {
                return rule.and.is_empty();
            }
            rule.and.iter().all(|sub| within(sub, remaining - 1))
        }

        let pods = self
            .restrict_tolerations
            .iter()
            .flat_map(|r| &r.allowed_pods)
            .chain(self.place_pods.iter().flat_map(|p| &p.pods))
            .chain(self.resources.iter().map(|r| &r.pod));

        for rule in pods {
            if !within(rule, MAX_AND_DEPTH) {
                return Err(RulesError::NestingTooDeep {
                    limit: MAX_AND_DEPTH,
                });
            }
        }
        Ok(())
    }
}

/// The pod-side facts every predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct PodFacts<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub priority_class_name: &'a str,
    pub labels: &'a BTreeMap<String, String>,
    pub owner_references: &'a [OwnerReference],
}

/// A toleration shape plus the pods allowed to carry tolerations matching it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RestrictTolerations {
    pub toleration: TolerationRule,
    pub allowed_pods: Vec<PodRule>,
}

/// Four-pattern toleration shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TolerationRule {
    pub key: Pattern,
    pub operator: Pattern,
    pub value: Pattern,
    pub effect: Pattern,
}

impl TolerationRule {
    pub fn matches(&self, toleration: &Toleration) -> bool {
        self.key.matches(toleration.key.as_deref().unwrap_or_default())
            && self
                .operator
                .matches(toleration.operator.as_deref().unwrap_or_default())
            && self
                .value
                .matches(toleration.value.as_deref().unwrap_or_default())
            && self
                .effect
                .matches(toleration.effect.as_deref().unwrap_or_default())
    }
}

/// Pod predicate: every pattern must match its field, the label and
/// owner-reference requirements must be satisfied, and every entry of the
/// `and` list must itself match.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodRule {
    pub namespace: Pattern,
    pub name: Pattern,
    pub has_priority_class_name: Pattern,
    pub labels: BTreeMap<String, String>,
    pub has_owner_reference: OwnerRefRule,
    pub and: Vec<PodRule>,
}

impl PodRule {
    pub fn matches(&self, pod: &PodFacts<'_>) -> bool {
        self.and.iter().all(|sub| sub.matches(pod))
            && self.namespace.matches(pod.namespace)
            && self.name.matches(pod.name)
            && self
                .has_priority_class_name
                .matches(pod.priority_class_name)
            && labels_satisfy(pod.labels, &self.labels)
            && owner_refs_satisfy(pod.owner_references, &self.has_owner_reference)
    }
}

/// Partial owner-reference requirement. Empty/unset fields match anything;
/// the fully empty requirement matches every object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OwnerRefRule {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: Option<bool>,
    pub block_owner_deletion: Option<bool>,
}

impl OwnerRefRule {
    fn is_empty(&self) -> bool {
        self.api_version.is_empty()
            && self.kind.is_empty()
            && self.name.is_empty()
            && self.uid.is_empty()
            && self.controller.is_none()
            && self.block_owner_deletion.is_none()
    }

    fn matches(&self, existing: &OwnerReference) -> bool {
        if !self.api_version.is_empty() && existing.api_version != self.api_version {
            return false;
        }
        if !self.kind.is_empty() && existing.kind != self.kind {
            return false;
        }
        if !self.name.is_empty() && existing.name != self.name {
            return false;
        }
        if !self.uid.is_empty() && existing.uid != self.uid {
            return false;
        }
        // Booleans are three-valued: an unset requirement is a don't-care,
        // while an unset candidate never equals a set requirement.
        if let Some(required) = self.controller {
            if existing.controller != Some(required) {
                return false;
            }
        }
        if let Some(required) = self.block_owner_deletion {
            if existing.block_owner_deletion != Some(required) {
                return false;
            }
        }
        true
    }
}

pub fn owner_refs_satisfy(existing: &[OwnerReference], required: &OwnerRefRule) -> bool {
    if required.is_empty() {
        return true;
    }
    existing.iter().any(|reference| required.matches(reference))
}

/// True when the candidate label set carries every required key with a
/// matching value.
pub fn labels_satisfy(
    existing: &BTreeMap<String, String>,
    required: &BTreeMap<String, String>,
) -> bool {
    required.iter().all(|(key, want)| {
        existing
            .get(key)
            .is_some_and(|have| label_value_matches(have, want))
    })
}

fn label_value_matches(existing: &str, required: &str) -> bool {
    let Some(source) = required.strip_prefix(LABEL_REGEXP_PREFIX) else {
        return existing == required;
    };
    match Regex::new(source) {
        Ok(re) => re.is_match(existing),
        Err(err) => {
            error!(value = required, %err, "bad label value pattern in rule");
            false
        }
    }
}

/// Pod predicates plus the additions applied to a matching pod.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlacePods {
    pub pods: Vec<PodRule>,
    pub add: AddSpec,
}

impl PlacePods {
    pub fn matches(&self, pod: &PodFacts<'_>) -> bool {
        self.pods.iter().any(|rule| rule.matches(pod))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AddSpec {
    pub tolerations: Vec<TolerationSpec>,
    pub node_selector: BTreeMap<String, String>,
    pub priority_class_name: String,
    pub containers: BTreeMap<String, ContainerAdditions>,
}

/// Literal toleration appended to a pod. Field order here fixes the key
/// order of the emitted JSON value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TolerationSpec {
    pub key: String,
    pub operator: String,
    pub effect: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerAdditions {
    pub env: Vec<serde_json::Value>,
}

/// Resource quantities derived for containers of a matching pod.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceRule {
    pub pod: PodRule,
    pub container: Pattern,
    pub cpu: QuantityPair,
    pub memory: QuantityPair,
    #[serde(rename = "ephemeral-storage")]
    pub ephemeral_storage: QuantityPair,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuantityPair {
    pub requests: String,
    pub limits: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonSetRule {
    pub namespace: Pattern,
    pub name: Pattern,
    pub labels: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
}

impl DaemonSetRule {
    pub fn matches(&self, namespace: &str, name: &str, labels: &BTreeMap<String, String>) -> bool {
        self.namespace.matches(namespace)
            && self.name.matches(name)
            && labels_satisfy(labels, &self.labels)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NamespaceRule {
    pub name: Pattern,
    pub add_labels: BTreeMap<String, String>,
}

impl NamespaceRule {
    pub fn matches(&self, name: &str) -> bool {
        self.name.matches(name)
    }
}
