//! Operator endpoints under `/internal/v1`. These are not part of the Docker
//! API and are served unversioned only.

use crate::api::AppState;
use crate::metrics::MetricsSnapshot;
use crate::types::{
    CheckResponse, CheckResult, ContainerSummaryEntry, HealthResponse, StatusResponse,
};
use axum::extract::State;
use axum::Json;
use sockerless_core::filter::ContainerFilter;

const COMPONENT: &str = "backend";

fn active_resources(state: &AppState) -> usize {
    state.runtime.store().container_counts().active()
}

/// Liveness.
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        component: COMPONENT.to_string(),
        uptime_seconds: state.uptime().as_secs(),
    })
}

/// Backend identity and counters.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        component: COMPONENT.to_string(),
        backend_type: state.descriptor.driver.clone(),
        instance_id: state.descriptor.instance_id.clone(),
        uptime_seconds: state.uptime().as_secs(),
        containers: state.runtime.store().container_counts().total,
        active_resources: active_resources(&state),
    })
}

/// Every container, including stopped ones.
pub async fn container_summary(State(state): State<AppState>) -> Json<Vec<ContainerSummaryEntry>> {
    let containers = state.runtime.store().list_containers(&ContainerFilter::default());
    Json(containers.iter().map(ContainerSummaryEntry::from).collect())
}

/// Request counts and latencies per route.
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let mut snapshot = state.metrics.snapshot();
    snapshot.uptime_seconds = state.uptime().as_secs();
    snapshot.containers = state.runtime.store().container_counts().total;
    snapshot.active_resources = active_resources(&state);
    Json(snapshot)
}

/// Self checks.
pub async fn check(State(state): State<AppState>) -> Json<CheckResponse> {
    let counts = state.runtime.store().container_counts();
    let mut checks = vec![
        CheckResult {
            name: "store".to_string(),
            status: "ok".to_string(),
            detail: format!(
                "{} containers, {} images",
                counts.total,
                state.runtime.store().image_count()
            ),
        },
        CheckResult {
            name: "registry".to_string(),
            status: "ok".to_string(),
            detail: format!("{} active resources", counts.active()),
        },
    ];
    checks.push(match state.runtime.factory() {
        Some(factory) => CheckResult {
            name: "process_factory".to_string(),
            status: "ok".to_string(),
            detail: factory.name().to_string(),
        },
        None => CheckResult {
            name: "process_factory".to_string(),
            status: "error".to_string(),
            detail: "no process factory configured".to_string(),
        },
    });
    Json(CheckResponse { checks })
}
