//! On-disk job journal.
//!
//! Backends without a provider-side inventory record their containers in a
//! JSON file at shutdown and feed it to [`recover`](crate::recovery::recover)
//! on the next start. Host processes do not outlive the backend, so every
//! journaled run comes back finished.

use crate::error::{CoreError, Result};
use crate::process::ContainerProcess;
use crate::recovery::{CloudJobState, JobInventory, ManagedJob};
use crate::state::{Container, ContainerState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One journaled container.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    instance_id: String,
    container_id: String,
    name: String,
    image: String,
    command: Vec<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    state: ContainerState,
    exit_code: Option<i64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    fn new(instance_id: &str, container: &Container) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            container_id: container.id.clone(),
            name: container.name.clone(),
            image: container.config.image.clone(),
            command: container.config.command(),
            labels: container.config.labels.clone(),
            state: container.state,
            exit_code: container.exit_code,
            created_at: container.created,
            started_at: container.started_at,
            finished_at: container.finished_at,
        }
    }

    fn into_job(self) -> ManagedJob {
        let state = match (self.state, self.exit_code) {
            (ContainerState::Created, _) => CloudJobState::Pending,
            (ContainerState::Exited, Some(0)) => CloudJobState::Succeeded,
            (ContainerState::Exited, _) => CloudJobState::Failed,
            _ => CloudJobState::Unknown,
        };
        ManagedJob {
            container_id: self.container_id,
            name: Some(self.name),
            image: self.image,
            command: self.command,
            labels: self.labels,
            state,
            exit_code: self.exit_code,
            created_at: Some(self.created_at),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// A JSON file of containers keyed by backend instance.
#[derive(Debug, Clone)]
pub struct JobJournal {
    path: PathBuf,
}

impl JobJournal {
    /// Creates a journal stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the entries of `instance_id` with `containers`. Entries of
    /// other instances are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, encoded or written.
    pub fn save(&self, instance_id: &str, containers: &[Container]) -> Result<()> {
        let mut entries: Vec<JournalEntry> = self
            .load()?
            .into_iter()
            .filter(|entry| entry.instance_id != instance_id)
            .collect();
        entries.extend(containers.iter().map(|c| JournalEntry::new(instance_id, c)));

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_vec_pretty(&entries)
            .map_err(|e| CoreError::internal(format!("Failed to encode journal: {e}")))?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, content)?;
        fs::rename(&staging, &self.path)?;

        tracing::debug!(path = %self.path.display(), containers = containers.len(), "journal saved");
        Ok(())
    }

    fn load(&self) -> Result<Vec<JournalEntry>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&content).map_err(|e| {
            CoreError::internal(format!(
                "Failed to parse journal {}: {e}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl JobInventory for JobJournal {
    async fn list_jobs(&self, instance_id: &str) -> Result<Vec<ManagedJob>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|entry| entry.instance_id == instance_id)
            .map(JournalEntry::into_job)
            .collect())
    }

    async fn reattach(&self, job: &ManagedJob) -> Result<Arc<dyn ContainerProcess>> {
        Err(CoreError::NotImplemented(format!(
            "container {} ran as a host process and cannot be reattached",
            job.container_id
        )))
    }

    async fn cleanup(&self, _job: &ManagedJob) -> Result<()> {
        Ok(())
    }
}
