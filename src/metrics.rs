use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::rules::RuleSet;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub operation: String,
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResponseLabels {
    pub resource: String,
    pub patched: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FamilyLabels {
    pub family: &'static str,
}

pub struct StewardMetrics {
    pub admission_requests_total: Family<RequestLabels, Counter>,
    pub admission_responses_total: Family<ResponseLabels, Counter>,
    pub admission_request_duration_seconds: Histogram,
}

const DURATION_BUCKETS: [f64; 14] = [
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

impl StewardMetrics {
    pub fn new(registry: &mut Registry, rules: &RuleSet) -> Self {
        let admission_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "steward_admission_requests",
            "Total number of admission requests received",
            admission_requests_total.clone(),
        );

        let admission_responses_total = Family::<ResponseLabels, Counter>::default();
        registry.register(
            "steward_admission_responses",
            "Total number of admission responses sent",
            admission_responses_total.clone(),
        );

        let admission_request_duration_seconds =
            Histogram::new(DURATION_BUCKETS.iter().copied());
        registry.register(
            "steward_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        let rules_loaded = Family::<FamilyLabels, Gauge>::default();
        registry.register(
            "steward_rules_loaded",
            "Number of rules loaded per rule family",
            rules_loaded.clone(),
        );
        for (family, count) in [
            ("restrict_tolerations", rules.restrict_tolerations.len()),
            ("place_pods", rules.place_pods.len()),
            ("resources", rules.resources.len()),
            ("disable_daemonsets", rules.disable_daemonsets.len()),
            ("namespaces_add_labels", rules.namespaces_add_labels.len()),
        ] {
            rules_loaded
                .get_or_create(&FamilyLabels { family })
                .set(count as i64);
        }

        Self {
            admission_requests_total,
            admission_responses_total,
            admission_request_duration_seconds,
        }
    }
}
