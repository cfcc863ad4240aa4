//! Request handlers for Docker API endpoints.
//!
//! Handlers translate Docker requests into runtime calls and runtime
//! records back into Docker JSON. They hold no state of their own.

use crate::error::{BackendError, Result};
use axum::body::Body;
use axum::extract::FromRequest;
use axum::http::Request;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

mod container;
mod event;
mod exec;
mod image;
pub mod management;
mod stream;
mod system;

pub use container::{
    attach_container, container_logs, container_stats, container_top, create_container,
    inspect_container, kill_container, list_containers, pause_container, prune_containers,
    remove_container, rename_container, restart_container, start_container, stop_container,
    unpause_container, wait_container,
};
pub use event::events;
pub use exec::{exec_create, exec_inspect, exec_resize, exec_start};
pub use image::{inspect_image, list_images, prune_images, pull_image, remove_image, tag_image};
pub use system::{get_info, get_version, ping};

/// JSON body where an empty body means `T::default()`.
///
/// Docker clients send no body at all for many POSTs, and some send bodies
/// without a content type, so this does not insist on `application/json`.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = BackendError;

    async fn from_request(req: Request<Body>, _state: &S) -> Result<Self> {
        let bytes = read_body(req.into_body()).await?;
        parse_json(&bytes).map(JsonBody)
    }
}

pub(crate) async fn read_body(body: Body) -> Result<Bytes> {
    body.collect()
        .await
        .map(http_body_util::Collected::to_bytes)
        .map_err(|e| BackendError::BadRequest(format!("failed to read request body: {e}")))
}

pub(crate) fn parse_json<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|e| BackendError::BadRequest(format!("invalid JSON body: {e}")))
}

/// Docker boolean query values: `1`, `true`, `True`.
pub(crate) fn flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

pub(crate) fn flag_or(value: Option<&str>, default: bool) -> bool {
    value.map_or(default, |v| flag(Some(v)))
}

pub(crate) fn parse_number<T: std::str::FromStr>(name: &str, value: Option<&str>) -> Result<Option<T>> {
    match value.filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| BackendError::BadRequest(format!("invalid value for {name}: {v}"))),
    }
}
