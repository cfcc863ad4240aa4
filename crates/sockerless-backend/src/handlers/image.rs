use super::flag;
use crate::api::AppState;
use crate::error::{BackendError, Result};
use crate::types::{
    ImageDeleteResponseItem, ImageInspectResponse, ImagePruneResponse, ImageSummary, PullProgress,
};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use sockerless_core::image::{normalize_reference, split_reference};
use sockerless_core::store::ImageDeletion;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PullQuery {
    #[serde(rename = "fromImage")]
    from_image: Option<String>,
    tag: Option<String>,
}

impl PullQuery {
    fn reference(&self) -> Result<String> {
        let image = self
            .from_image
            .as_deref()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| BackendError::BadRequest("fromImage is required".to_string()))?;
        Ok(match self.tag.as_deref().filter(|t| !t.is_empty()) {
            Some(tag) if tag.starts_with("sha256:") => format!("{image}@{tag}"),
            Some(tag) => format!("{image}:{tag}"),
            None => image.to_string(),
        })
    }
}

/// Pull an image. The core records the reference; workloads resolve it.
///
/// # Errors
///
/// Returns 400 without `fromImage`.
pub async fn pull_image(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> Result<Response> {
    let reference = normalize_reference(&query.reference()?);
    let (image, created) = state.runtime.pull_image(&reference);
    let (repo, tag) = split_reference(&reference);

    let final_status = if created {
        format!("Status: Downloaded newer image for {reference}")
    } else {
        format!("Status: Image is up to date for {reference}")
    };
    let progress = [
        PullProgress {
            status: format!("Pulling from {repo}"),
            id: Some(tag.to_string()),
        },
        PullProgress {
            status: format!("Digest: {}", image.id),
            id: None,
        },
        PullProgress {
            status: final_status,
            id: None,
        },
    ];

    let mut body = Vec::new();
    for line in &progress {
        serde_json::to_writer(&mut body, line)
            .map_err(|e| BackendError::Server(format!("failed to encode progress: {e}")))?;
        body.push(b'\n');
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(Bytes::from(body)))
        .map_err(|e| BackendError::Server(format!("failed to build pull response: {e}")))
}

/// List images.
pub async fn list_images(State(state): State<AppState>) -> Json<Vec<ImageSummary>> {
    let images = state.runtime.store().list_images();
    Json(images.iter().map(ImageSummary::from).collect())
}

/// Inspect an image.
///
/// # Errors
///
/// Returns 404 for an unknown reference.
pub async fn inspect_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ImageInspectResponse>> {
    let image = state.runtime.store().get_image(&name)?;
    Ok(Json(ImageInspectResponse::from(&image)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TagQuery {
    repo: Option<String>,
    tag: Option<String>,
}

/// Tag an image.
///
/// # Errors
///
/// Returns 400 without `repo`, or 404 for an unknown source.
pub async fn tag_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TagQuery>,
) -> Result<StatusCode> {
    let repo = query
        .repo
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| BackendError::BadRequest("repo is required".to_string()))?;
    let target = match query.tag.as_deref().filter(|t| !t.is_empty()) {
        Some(tag) => format!("{repo}:{tag}"),
        None => repo.to_string(),
    };
    state.runtime.store().tag_image(&name, &target)?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RemoveImageQuery {
    force: Option<String>,
}

/// Remove an image or one of its tags.
///
/// # Errors
///
/// Returns 404, or 409 if a container uses it and `force` is not set.
pub async fn remove_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RemoveImageQuery>,
) -> Result<Json<Vec<ImageDeleteResponseItem>>> {
    let steps = state
        .runtime
        .store()
        .remove_image(&name, flag(query.force.as_deref()))?;
    Ok(Json(steps.into_iter().map(delete_item).collect()))
}

fn delete_item(step: ImageDeletion) -> ImageDeleteResponseItem {
    match step {
        ImageDeletion::Untagged(tag) => ImageDeleteResponseItem {
            untagged: Some(tag),
            deleted: None,
        },
        ImageDeletion::Deleted(id) => ImageDeleteResponseItem {
            untagged: None,
            deleted: Some(id),
        },
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ImagePruneQuery {
    filters: Option<String>,
}

impl ImagePruneQuery {
    /// Only `dangling` is honoured; it defaults to true.
    fn dangling_only(&self) -> Result<bool> {
        let Some(raw) = self.filters.as_deref().filter(|f| !f.trim().is_empty()) else {
            return Ok(true);
        };
        let parsed: HashMap<String, Value> = serde_json::from_str(raw)
            .map_err(|e| BackendError::BadRequest(format!("invalid filters: {e}")))?;
        let values: Vec<String> = match parsed.get("dangling") {
            None => return Ok(true),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::Object(map)) => map
                .iter()
                .filter(|(_, on)| on.as_bool().unwrap_or(false))
                .map(|(k, _)| k.clone())
                .collect(),
            Some(other) => {
                return Err(BackendError::BadRequest(format!(
                    "invalid filter 'dangling={other}'"
                )))
            }
        };
        Ok(!values.iter().any(|v| v == "0" || v.eq_ignore_ascii_case("false")))
    }
}

/// Remove unused images. By default only untagged ones go.
///
/// # Errors
///
/// Returns 400 for malformed filters.
pub async fn prune_images(
    State(state): State<AppState>,
    Query(query): Query<ImagePruneQuery>,
) -> Result<Json<ImagePruneResponse>> {
    let (steps, space_reclaimed) = state.runtime.store().prune_images(query.dangling_only()?);
    Ok(Json(ImagePruneResponse {
        images_deleted: steps.into_iter().map(delete_item).collect(),
        space_reclaimed,
    }))
}
