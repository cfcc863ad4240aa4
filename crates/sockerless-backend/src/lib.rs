//! # sockerless-backend
//!
//! Docker-compatible HTTP surface shared by every Sockerless backend.
//!
//! The router maps Docker Engine API requests onto the runtime core in
//! [`sockerless_core`]. A backend that fronts a cloud provider keeps this
//! surface and swaps individual handlers through [`RouteOverrides`].
//!
//! ## Compatibility
//!
//! Routes are served unversioned and under `/v1.24` through `/v1.43`.
//! Operator endpoints (`/internal/v1/healthz`, `status`, `metrics`,
//! `containers/summary`, `check`) are served unversioned only.
//! Attach and exec support `Upgrade: tcp` hijacking, with multiplexed
//! framing for non-TTY workloads and raw bytes for TTY workloads.
//!
//! ## Architecture
//!
//! ```text
//! Docker front-end ──► TCP / Unix socket ──► sockerless-backend ──► sockerless-core
//!                                                  │
//!                                                  ▼
//!                                         route table (+ overrides)
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod descriptor;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod trace;
pub mod types;

pub use api::{create_router, create_router_with, AppState};
pub use descriptor::BackendDescriptor;
pub use error::{BackendError, Result};
pub use routes::{Route, RouteOverrides};
pub use server::{BackendServer, ListenAddr};

/// Docker API version this backend speaks.
pub const API_VERSION: &str = "1.43";

/// Oldest Docker API version accepted.
pub const MIN_API_VERSION: &str = "1.24";
