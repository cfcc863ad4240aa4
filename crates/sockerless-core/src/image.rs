//! Image records and reference handling.
//!
//! The core does not store layers. An image is a named, content-hash-like
//! record that containers can point at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// An image record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    /// `sha256:<64 hex>`.
    pub id: String,
    /// Normalized `repo:tag` references.
    pub tags: BTreeSet<String>,
    /// Reported size in bytes.
    pub size: i64,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
}

impl Image {
    /// Creates a record for `reference` with a deterministic id.
    #[must_use]
    pub fn from_reference(reference: &str) -> Self {
        let normalized = normalize_reference(reference);
        Self {
            id: image_id_for(&normalized),
            tags: BTreeSet::from([normalized]),
            size: 0,
            created: Utc::now(),
            labels: BTreeMap::new(),
        }
    }
}

/// Derives the image id for a normalized reference.
#[must_use]
pub fn image_id_for(reference: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(reference.as_bytes())))
}

/// Normalizes an image reference: strips the default registry and library
/// namespace and adds `:latest` when no tag or digest is given.
#[must_use]
pub fn normalize_reference(reference: &str) -> String {
    let trimmed = reference
        .strip_prefix("docker.io/")
        .or_else(|| reference.strip_prefix("index.docker.io/"))
        .unwrap_or(reference);
    let trimmed = trimmed.strip_prefix("library/").unwrap_or(trimmed);
    if trimmed.contains('@') {
        return trimmed.to_string();
    }
    let last_segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if last_segment.contains(':') {
        trimmed.to_string()
    } else {
        format!("{trimmed}:latest")
    }
}

/// Splits `repo:tag` at the tag separator.
#[must_use]
pub fn split_reference(reference: &str) -> (&str, &str) {
    let slash = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[slash..].rfind(':') {
        Some(i) => (&reference[..slash + i], &reference[slash + i + 1..]),
        None => (reference, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_normalized() {
        assert_eq!(normalize_reference("alpine"), "alpine:latest");
        assert_eq!(normalize_reference("docker.io/library/alpine:3.19"), "alpine:3.19");
        assert_eq!(normalize_reference("ghcr.io/org/app"), "ghcr.io/org/app:latest");
        assert_eq!(normalize_reference("localhost:5000/app"), "localhost:5000/app:latest");
        assert_eq!(normalize_reference("alpine@sha256:abc"), "alpine@sha256:abc");
    }

    #[test]
    fn ids_are_stable_per_reference() {
        let a = Image::from_reference("alpine");
        let b = Image::from_reference("alpine:latest");
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("sha256:"));
        assert_eq!(a.id.len(), 7 + 64);
    }

    #[test]
    fn split_handles_registry_ports() {
        assert_eq!(split_reference("localhost:5000/app:v1"), ("localhost:5000/app", "v1"));
        assert_eq!(split_reference("alpine"), ("alpine", "latest"));
    }
}
