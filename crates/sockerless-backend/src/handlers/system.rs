use crate::api::AppState;
use crate::types::{SystemInfoResponse, VersionComponent, VersionResponse};
use axum::extract::State;
use axum::http::header::HeaderName;
use axum::Json;

/// Get version.
pub async fn get_version(State(state): State<AppState>) -> Json<VersionResponse> {
    let d = &state.descriptor;
    Json(VersionResponse {
        version: d.server_version.clone(),
        api_version: crate::API_VERSION.to_string(),
        min_api_version: crate::MIN_API_VERSION.to_string(),
        git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
        go_version: "N/A (Rust)".to_string(),
        os: d.os.clone(),
        arch: d.architecture.clone(),
        kernel_version: String::new(),
        components: vec![VersionComponent {
            name: d.driver.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }],
    })
}

/// Get system info.
pub async fn get_info(State(state): State<AppState>) -> Json<SystemInfoResponse> {
    let d = &state.descriptor;
    let counts = state.runtime.store().container_counts();
    let count = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    Json(SystemInfoResponse {
        id: d.id.clone(),
        name: d.name.clone(),
        containers: count(counts.total),
        containers_running: count(counts.running),
        containers_paused: count(counts.paused),
        containers_stopped: count(counts.stopped),
        images: count(state.runtime.store().image_count()),
        driver: d.driver.clone(),
        server_version: d.server_version.clone(),
        operating_system: d.os.clone(),
        os_type: d.os_type.clone(),
        architecture: d.architecture.clone(),
        ncpu: d.ncpu,
        mem_total: d.mem_total,
        labels: vec![format!("sockerless.instance={}", d.instance_id)],
    })
}

/// Ping handler.
pub async fn ping() -> ([(HeaderName, &'static str); 1], &'static str) {
    (
        [(HeaderName::from_static("api-version"), crate::API_VERSION)],
        "OK",
    )
}
