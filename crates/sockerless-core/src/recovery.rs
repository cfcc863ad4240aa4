//! Registry recovery from a cloud job inventory.
//!
//! A restarted backend rebuilds its container records from the jobs it
//! previously launched. Running jobs are reattached when possible. Problems
//! with individual jobs are logged and skipped; recovery itself never fails
//! startup.

use crate::error::Result;
use crate::manager::ContainerManager;
use crate::process::{ContainerProcess, KILLED_EXIT_CODE, UNKNOWN_EXIT_CODE};
use crate::state::{Container, ContainerConfig, ContainerState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Provider-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudJobState {
    /// Accepted but not yet running.
    Pending,
    /// Running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled by a user or this backend.
    Cancelled,
    /// The provider could not report a state.
    Unknown,
}

/// A job the backend launched earlier, as reported by the provider.
#[derive(Debug, Clone)]
pub struct ManagedJob {
    /// Container id carried in the job's tags.
    pub container_id: String,
    /// Container name, if recorded.
    pub name: Option<String>,
    /// Image reference.
    pub image: String,
    /// Command line.
    pub command: Vec<String>,
    /// Job labels.
    pub labels: BTreeMap<String, String>,
    /// Provider state.
    pub state: CloudJobState,
    /// Exit code, if the provider reports one.
    pub exit_code: Option<i64>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Source of previously launched jobs.
#[async_trait]
pub trait JobInventory: Send + Sync {
    /// Jobs tagged with `instance_id`.
    async fn list_jobs(&self, instance_id: &str) -> Result<Vec<ManagedJob>>;

    /// Binds a live handle to a running job.
    async fn reattach(&self, job: &ManagedJob) -> Result<Arc<dyn ContainerProcess>>;

    /// Deletes provider resources of a job that can no longer be tracked.
    async fn cleanup(&self, job: &ManagedJob) -> Result<()>;
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Container ids inserted into the store.
    pub recovered: Vec<String>,
    /// Container ids that could not be restored.
    pub skipped: Vec<String>,
}

fn record_for(job: &ManagedJob) -> Container {
    let name = job
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .map_or_else(
            || format!("/{}", job.container_id.chars().take(12).collect::<String>()),
            |n| crate::id::canonical_name(&n),
        );
    let config = ContainerConfig {
        image: job.image.clone(),
        cmd: job.command.clone(),
        labels: job.labels.clone(),
        ..ContainerConfig::default()
    };
    let mut container = Container::new(
        job.container_id.clone(),
        name,
        crate::image::image_id_for(&job.image),
        config,
    );
    if let Some(created) = job.created_at {
        container.created = created;
    }
    container.started_at = job.started_at;
    container.finished_at = job.finished_at;
    let (state, exit_code) = match job.state {
        CloudJobState::Pending => (ContainerState::Created, None),
        CloudJobState::Running => (ContainerState::Running, None),
        CloudJobState::Succeeded => (ContainerState::Exited, Some(job.exit_code.unwrap_or(0))),
        CloudJobState::Failed => (ContainerState::Exited, Some(job.exit_code.unwrap_or(1))),
        CloudJobState::Cancelled => (ContainerState::Exited, Some(KILLED_EXIT_CODE)),
        CloudJobState::Unknown => (
            ContainerState::Dead,
            Some(job.exit_code.unwrap_or(UNKNOWN_EXIT_CODE)),
        ),
    };
    container.state = state;
    container.exit_code = exit_code;
    container
}

/// Rebuilds container records for every job tagged with `instance_id`.
pub async fn recover(
    inventory: &dyn JobInventory,
    manager: &ContainerManager,
    instance_id: &str,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let jobs = match inventory.list_jobs(instance_id).await {
        Ok(jobs) => jobs,
        Err(err) => {
            tracing::warn!(instance = %instance_id, error = %err, "listing jobs failed, skipping recovery");
            return report;
        }
    };

    for job in jobs {
        if job.container_id.is_empty() {
            tracing::warn!(image = %job.image, "job without container id, skipping");
            continue;
        }
        let record = record_for(&job);
        let process = if job.state == CloudJobState::Running {
            match inventory.reattach(&job).await {
                Ok(process) => Some(process),
                Err(err) => {
                    tracing::warn!(container = %job.container_id, error = %err, "reattach failed, skipping");
                    report.skipped.push(job.container_id.clone());
                    continue;
                }
            }
        } else {
            None
        };

        match manager.adopt(record, process) {
            Ok(container) => {
                tracing::info!(container = %container.id, state = %container.state, "container recovered");
                report.recovered.push(container.id);
            }
            Err(err) => {
                tracing::warn!(container = %job.container_id, error = %err, "could not restore container");
                if let Err(err) = inventory.cleanup(&job).await {
                    tracing::warn!(container = %job.container_id, error = %err, "job cleanup failed");
                }
                report.skipped.push(job.container_id);
            }
        }
    }
    report
}
