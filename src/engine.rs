use std::collections::BTreeMap;

use json_patch::{Patch, PatchOperation};
use k8s_openapi::api::core::v1::PodSpec;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::mutations::{daemonset, namespace, node_selector, placement, resources, tolerations};
use crate::rules::{PodFacts, RuleSet};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("did not receive pod/daemonset/namespace, got: {0}")]
    UnsupportedResource(String),
    #[error("admission request carries no object")]
    MissingObject,
    #[error("error decoding raw {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// The mutation engine: owns the rule tree and the request-time decision.
///
/// Constructed once at startup and shared read-only across request handlers;
/// per-request state lives on the stack of `mutate`.
pub struct MutationEngine {
    rules: RuleSet,
    ignore_namespaces: Vec<String>,
    accept_node_selectors: Vec<String>,
}

impl MutationEngine {
    pub fn new(
        rules: RuleSet,
        ignore_namespaces: Vec<String>,
        accept_node_selectors: Vec<String>,
    ) -> Self {
        Self {
            rules,
            ignore_namespaces,
            accept_node_selectors,
        }
    }

    /// Produces the admission decision for one request: always an allow,
    /// optionally carrying a JSON-Patch.
    pub fn mutate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, EngineError> {
        let resource = &req.resource;
        let ops = match (resource.group.as_str(), resource.resource.as_str()) {
            ("", "pods") => self.mutate_pod(req)?,
            ("apps", "daemonsets") => self.mutate_daemonset(req)?,
            ("", "namespaces") => self.mutate_namespace(req)?,
            (group, resource) => {
                let got = if group.is_empty() {
                    resource.to_string()
                } else {
                    format!("{group}/{resource}")
                };
                return Err(EngineError::UnsupportedResource(got));
            }
        };

        let response = AdmissionResponse::from(req);
        if ops.is_empty() {
            return Ok(response);
        }

        debug!(uid = %req.uid, ops = ops.len(), "patch assembled");
        match response.with_patch(Patch(ops)) {
            Ok(patched) => Ok(patched),
            Err(err) => {
                // Dropping the patch keeps the decision an allow; the skip is
                // visible only here.
                error!(uid = %req.uid, %err, "failed to serialize patch, allowing without it");
                Ok(AdmissionResponse::from(req))
            }
        }
    }

    fn mutate_pod(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<Vec<PatchOperation>, EngineError> {
        let object = req.object.as_ref().ok_or(EngineError::MissingObject)?;
        let namespace = req.namespace.clone().unwrap_or_default();
        let name = object_identity(object);

        if self.ignored(&namespace) {
            info!(namespace, pod = %name, "namespace ignored");
            return Ok(Vec::new());
        }

        let spec: PodSpec = match object.data.get("spec") {
            Some(spec) => serde_json::from_value(spec.clone())
                .map_err(|source| EngineError::Decode { kind: "pod", source })?,
            None => PodSpec::default(),
        };

        let no_labels = BTreeMap::new();
        let labels = object.metadata.labels.as_ref().unwrap_or(&no_labels);
        let owner_references = object.metadata.owner_references.as_deref().unwrap_or_default();
        let pod = PodFacts {
            namespace: &namespace,
            name: &name,
            priority_class_name: spec.priority_class_name.as_deref().unwrap_or_default(),
            labels,
            owner_references,
        };

        let pod_tolerations = spec.tolerations.as_deref().unwrap_or_default();
        let no_selector = BTreeMap::new();
        let pod_node_selector = spec.node_selector.as_ref().unwrap_or(&no_selector);

        // Fragment order is part of the contract: removals first, then
        // additions, then resource settings.
        let mut ops =
            tolerations::remove_tolerations(&pod, pod_tolerations, &self.rules.restrict_tolerations);
        ops.extend(node_selector::remove_node_selectors(
            &pod,
            pod_node_selector,
            &self.accept_node_selectors,
        ));
        ops.extend(placement::add_placement(
            &pod,
            spec.priority,
            &spec.containers,
            &self.rules.place_pods,
        ));
        ops.extend(resources::derive_resources(
            &pod,
            &spec.containers,
            &self.rules.resources,
        ));
        Ok(ops)
    }

    fn mutate_daemonset(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<Vec<PatchOperation>, EngineError> {
        let object = req.object.as_ref().ok_or(EngineError::MissingObject)?;
        let namespace = req.namespace.clone().unwrap_or_default();
        let name = object_identity(object);

        if self.ignored(&namespace) {
            info!(namespace, daemonset = %name, "namespace ignored");
            return Ok(Vec::new());
        }

        let no_labels = BTreeMap::new();
        let labels = object.metadata.labels.as_ref().unwrap_or(&no_labels);
        Ok(daemonset::disable_daemonset(
            &namespace,
            &name,
            labels,
            &self.rules.disable_daemonsets,
        ))
    }

    fn mutate_namespace(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<Vec<PatchOperation>, EngineError> {
        let object = req.object.as_ref().ok_or(EngineError::MissingObject)?;
        let name = match &object.metadata.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => req.name.clone(),
        };

        let no_labels = BTreeMap::new();
        let labels = object.metadata.labels.as_ref().unwrap_or(&no_labels);
        Ok(namespace::add_namespace_labels(
            &name,
            labels,
            &self.rules.namespaces_add_labels,
        ))
    }

    fn ignored(&self, namespace: &str) -> bool {
        self.ignore_namespaces.iter().any(|ns| ns == namespace)
    }
}

/// Object identity for matching and logging: pods created through generators
/// (deployments, jobs) have no name yet, only a `generateName`.
fn object_identity(object: &DynamicObject) -> String {
    object
        .metadata
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| object.metadata.generate_name.clone())
        .unwrap_or_default()
}
