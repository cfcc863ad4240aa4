//! Route table and per-route overrides.
//!
//! A backend that fronts a cloud provider replaces individual handlers (for
//! example container create) while keeping the defaults for everything else.
//! Overrides are looked up once when the router is built.

use crate::api::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::response::Response;
use axum::routing::{on, MethodFilter, MethodRouter};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Every route the backend serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Ping,
    Version,
    Info,
    Events,
    ListImages,
    PullImage,
    InspectImage,
    TagImage,
    RemoveImage,
    PruneImages,
    ListContainers,
    CreateContainer,
    InspectContainer,
    RenameContainer,
    PruneContainers,
    StartContainer,
    StopContainer,
    RestartContainer,
    KillContainer,
    PauseContainer,
    UnpauseContainer,
    WaitContainer,
    RemoveContainer,
    ContainerLogs,
    AttachContainer,
    ContainerStats,
    ContainerTop,
    CreateExec,
    StartExec,
    ResizeExec,
    InspectExec,
}

impl Route {
    /// All routes, in registration order.
    pub const ALL: &'static [Self] = &[
        Self::Ping,
        Self::Version,
        Self::Info,
        Self::Events,
        Self::ListImages,
        Self::PullImage,
        Self::InspectImage,
        Self::TagImage,
        Self::RemoveImage,
        Self::PruneImages,
        Self::ListContainers,
        Self::CreateContainer,
        Self::InspectContainer,
        Self::RenameContainer,
        Self::PruneContainers,
        Self::StartContainer,
        Self::StopContainer,
        Self::RestartContainer,
        Self::KillContainer,
        Self::PauseContainer,
        Self::UnpauseContainer,
        Self::WaitContainer,
        Self::RemoveContainer,
        Self::ContainerLogs,
        Self::AttachContainer,
        Self::ContainerStats,
        Self::ContainerTop,
        Self::CreateExec,
        Self::StartExec,
        Self::ResizeExec,
        Self::InspectExec,
    ];

    /// HTTP method.
    #[must_use]
    pub fn method(self) -> Method {
        match self {
            Self::Ping
            | Self::Version
            | Self::Info
            | Self::Events
            | Self::ListImages
            | Self::InspectImage
            | Self::ListContainers
            | Self::InspectContainer
            | Self::ContainerLogs
            | Self::ContainerStats
            | Self::ContainerTop
            | Self::InspectExec => Method::GET,
            Self::RemoveImage | Self::RemoveContainer => Method::DELETE,
            _ => Method::POST,
        }
    }

    /// Path pattern in axum syntax.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Ping => "/_ping",
            Self::Version => "/version",
            Self::Info => "/info",
            Self::Events => "/events",
            Self::ListImages => "/images/json",
            Self::PullImage => "/images/create",
            Self::InspectImage => "/images/{name}/json",
            Self::TagImage => "/images/{name}/tag",
            Self::RemoveImage => "/images/{name}",
            Self::PruneImages => "/images/prune",
            Self::ListContainers => "/containers/json",
            Self::CreateContainer => "/containers/create",
            Self::InspectContainer => "/containers/{id}/json",
            Self::RenameContainer => "/containers/{id}/rename",
            Self::PruneContainers => "/containers/prune",
            Self::StartContainer => "/containers/{id}/start",
            Self::StopContainer => "/containers/{id}/stop",
            Self::RestartContainer => "/containers/{id}/restart",
            Self::KillContainer => "/containers/{id}/kill",
            Self::PauseContainer => "/containers/{id}/pause",
            Self::UnpauseContainer => "/containers/{id}/unpause",
            Self::WaitContainer => "/containers/{id}/wait",
            Self::RemoveContainer => "/containers/{id}",
            Self::ContainerLogs => "/containers/{id}/logs",
            Self::AttachContainer => "/containers/{id}/attach",
            Self::ContainerStats => "/containers/{id}/stats",
            Self::ContainerTop => "/containers/{id}/top",
            Self::CreateExec => "/containers/{id}/exec",
            Self::StartExec => "/exec/{id}/start",
            Self::ResizeExec => "/exec/{id}/resize",
            Self::InspectExec => "/exec/{id}/json",
        }
    }

    pub(crate) fn method_filter(self) -> MethodFilter {
        match self.method() {
            Method::GET => MethodFilter::GET,
            Method::DELETE => MethodFilter::DELETE,
            _ => MethodFilter::POST,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}

/// A replacement handler. It receives the shared state and the raw request.
pub type OverrideHandler =
    Arc<dyn Fn(AppState, Request<Body>) -> BoxFuture<'static, Response> + Send + Sync>;

/// Sparse map of route replacements.
#[derive(Clone, Default)]
pub struct RouteOverrides {
    handlers: HashMap<Route, OverrideHandler>,
}

impl RouteOverrides {
    /// An empty override table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the handler for `route`.
    #[must_use]
    pub fn with<F, Fut>(mut self, route: Route, handler: F) -> Self
    where
        F: Fn(AppState, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler: OverrideHandler = Arc::new(move |state, req| Box::pin(handler(state, req)));
        self.handlers.insert(route, handler);
        self
    }

    /// Whether `route` is overridden.
    #[must_use]
    pub fn contains(&self, route: Route) -> bool {
        self.handlers.contains_key(&route)
    }

    /// Number of overridden routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no route is overridden.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn method_router(&self, route: Route) -> Option<MethodRouter<AppState>> {
        let handler = Arc::clone(self.handlers.get(&route)?);
        Some(on(
            route.method_filter(),
            move |State(state): State<AppState>, req: Request<Body>| {
                let handler = Arc::clone(&handler);
                async move { handler(state, req).await }
            },
        ))
    }
}

impl fmt::Debug for RouteOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
