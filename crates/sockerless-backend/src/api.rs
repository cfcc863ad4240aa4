//! Docker API router.
//!
//! Every route is served at the root and under `/v1.24` through `/v1.43`.
//! Operator endpoints live under `/internal/v1` at the root only.
//! See: https://docs.docker.com/engine/api/v1.43/

use crate::descriptor::BackendDescriptor;
use crate::error::ErrorResponse;
use crate::handlers::{self, management};
use crate::metrics::{record_request, RequestMetrics};
use crate::routes::{Route, RouteOverrides};
use crate::trace::request_id_middleware;
use axum::http::{header, Response, StatusCode};
use axum::routing::{delete, get, post, MethodRouter};
use axum::{middleware, Router};
use bytes::Bytes;
use http_body_util::Full;
use sockerless_core::Runtime;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Backend runtime.
    pub runtime: Arc<Runtime>,
    /// Identity reported by `/info` and `/version`.
    pub descriptor: Arc<BackendDescriptor>,
    /// Per-route request counters.
    pub metrics: Arc<RequestMetrics>,
    started_at: Instant,
}

impl AppState {
    /// Bundles a runtime with its descriptor.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>, descriptor: BackendDescriptor) -> Self {
        Self {
            runtime,
            descriptor: Arc::new(descriptor),
            metrics: Arc::new(RequestMetrics::new()),
            started_at: Instant::now(),
        }
    }

    /// Time since the state was built.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Creates the router with the default handlers.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    create_router_with(state, &RouteOverrides::new())
}

/// Creates the router, replacing the handlers named in `overrides`.
#[must_use]
pub fn create_router_with(state: AppState, overrides: &RouteOverrides) -> Router {
    if !overrides.is_empty() {
        tracing::debug!(overrides = ?overrides, "installing route overrides");
    }

    let metrics = Arc::clone(&state.metrics);
    let mut router = api_routes(overrides, &metrics).merge(internal_routes());
    for minor in 24..=43 {
        router = router.nest(&format!("/v1.{minor}"), api_routes(overrides, &metrics));
    }

    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn api_routes(overrides: &RouteOverrides, metrics: &Arc<RequestMetrics>) -> Router<AppState> {
    Route::ALL.iter().fold(Router::new(), |router, &route| {
        let method_router = overrides
            .method_router(route)
            .unwrap_or_else(|| default_route(route))
            .layer(middleware::from_fn_with_state(
                (Arc::clone(metrics), route),
                record_request,
            ));
        router.route(route.path(), method_router)
    })
}

fn internal_routes() -> Router<AppState> {
    Router::new()
        .route("/internal/v1/healthz", get(management::healthz))
        .route("/internal/v1/status", get(management::status))
        .route("/internal/v1/metrics", get(management::metrics))
        .route(
            "/internal/v1/containers/summary",
            get(management::container_summary),
        )
        .route("/internal/v1/check", get(management::check))
}

fn default_route(route: Route) -> MethodRouter<AppState> {
    match route {
        Route::Ping => get(handlers::ping),
        Route::Version => get(handlers::get_version),
        Route::Info => get(handlers::get_info),
        Route::Events => get(handlers::events),
        Route::ListImages => get(handlers::list_images),
        Route::PullImage => post(handlers::pull_image),
        Route::InspectImage => get(handlers::inspect_image),
        Route::TagImage => post(handlers::tag_image),
        Route::RemoveImage => delete(handlers::remove_image),
        Route::PruneImages => post(handlers::prune_images),
        Route::ListContainers => get(handlers::list_containers),
        Route::CreateContainer => post(handlers::create_container),
        Route::InspectContainer => get(handlers::inspect_container),
        Route::RenameContainer => post(handlers::rename_container),
        Route::PruneContainers => post(handlers::prune_containers),
        Route::StartContainer => post(handlers::start_container),
        Route::StopContainer => post(handlers::stop_container),
        Route::RestartContainer => post(handlers::restart_container),
        Route::KillContainer => post(handlers::kill_container),
        Route::PauseContainer => post(handlers::pause_container),
        Route::UnpauseContainer => post(handlers::unpause_container),
        Route::WaitContainer => post(handlers::wait_container),
        Route::RemoveContainer => delete(handlers::remove_container),
        Route::ContainerLogs => get(handlers::container_logs),
        Route::AttachContainer => post(handlers::attach_container),
        Route::ContainerStats => get(handlers::container_stats),
        Route::ContainerTop => get(handlers::container_top),
        Route::CreateExec => post(handlers::exec_create),
        Route::StartExec => post(handlers::exec_start),
        Route::ResizeExec => post(handlers::exec_resize),
        Route::InspectExec => get(handlers::exec_inspect),
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response<Full<Bytes>> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    tracing::error!(panic = detail, "handler panicked");

    let body = serde_json::to_vec(&ErrorResponse {
        message: "internal server error".to_string(),
    })
    .unwrap_or_default();
    let mut response = Response::new(Full::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
