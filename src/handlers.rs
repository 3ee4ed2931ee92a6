use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, error, warn};

use crate::engine::{EngineError, MutationEngine};
use crate::metrics::{RequestLabels, ResponseLabels, StewardMetrics};

pub struct AppState {
    pub engine: MutationEngine,
    pub metrics: StewardMetrics,
}

pub type SharedState = Arc<AppState>;

pub async fn handle_mutate(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let start = Instant::now();

    let review: AdmissionReview<DynamicObject> = match serde_json::from_value(body) {
        Ok(review) => review,
        Err(err) => {
            warn!(%err, "failed to deserialize AdmissionReview");
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to deserialize AdmissionReview: {err}"),
            )
                .into_response();
        }
    };

    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            warn!(%err, "AdmissionReview missing request field");
            return (
                StatusCode::BAD_REQUEST,
                "missing request in AdmissionReview".to_string(),
            )
                .into_response();
        }
    };

    debug!(
        uid = %req.uid,
        operation = ?req.operation,
        resource = %req.resource.resource,
        namespace = req.namespace.as_deref().unwrap_or_default(),
        name = %req.name,
        "admission request"
    );
    record_request(&state, &req);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        state.engine.mutate(&req)
    }));

    let response = match result {
        Ok(Ok(response)) => response,
        Ok(Err(err @ EngineError::UnsupportedResource(_))) => {
            warn!(uid = %req.uid, %err, "rejecting admission request");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
        Ok(Err(err)) => {
            error!(uid = %req.uid, %err, "failed to process admission request");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
        Err(_) => {
            error!(uid = %req.uid, "mutation panicked, failing open");
            let mut response = AdmissionResponse::from(&req);
            response.warnings = Some(vec![
                "steward: internal error during mutation, failing open".to_string(),
            ]);
            response
        }
    };

    record_response(&state, &req, response.patch.is_some());
    state
        .metrics
        .admission_request_duration_seconds
        .observe(start.elapsed().as_secs_f64());

    Json(
        serde_json::to_value(response.into_review())
            .expect("AdmissionReview serialization is infallible"),
    )
    .into_response()
}

fn record_request(state: &AppState, req: &AdmissionRequest<DynamicObject>) {
    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            operation: format!("{:?}", req.operation).to_uppercase(),
            resource: req.resource.resource.clone(),
        })
        .inc();
}

fn record_response(state: &AppState, req: &AdmissionRequest<DynamicObject>, patched: bool) {
    state
        .metrics
        .admission_responses_total
        .get_or_create(&ResponseLabels {
            resource: req.resource.resource.clone(),
            patched: if patched { "true" } else { "false" },
        })
        .inc();
}
