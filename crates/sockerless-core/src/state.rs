//! Container records and state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Created but never started.
    Created,
    /// Process is running.
    Running,
    /// Process is paused.
    Paused,
    /// Being restarted.
    Restarting,
    /// Being removed.
    Removing,
    /// Process has exited.
    Exited,
    /// Unrecoverable error state.
    Dead,
}

impl ContainerState {
    /// Terminal states allow only removal or restart.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }

    /// States in which the container owns a live process handle.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Restarting)
    }

    /// Parses the lowercase Docker spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => return None,
        })
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Restart policy name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyName {
    /// Never restart.
    #[default]
    No,
    /// Restart after every exit.
    Always,
    /// Restart after a non-zero exit, up to the retry limit.
    OnFailure,
    /// Like `always`; an explicit stop is never undone.
    UnlessStopped,
}

impl RestartPolicyName {
    /// Parses the Docker spelling. Empty means `no`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "" | "no" => Self::No,
            "always" => Self::Always,
            "on-failure" => Self::OnFailure,
            "unless-stopped" => Self::UnlessStopped,
            _ => return None,
        })
    }

    /// Docker spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::UnlessStopped => "unless-stopped",
        }
    }
}

/// What happens when a container's process exits on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Policy name.
    pub name: RestartPolicyName,
    /// Retry limit for `on-failure`; zero means unlimited.
    pub maximum_retry_count: u32,
}

impl RestartPolicy {
    /// Whether an exit with `exit_code` after `restart_count` policy restarts
    /// calls for another one. Explicit stops are filtered out by the caller.
    #[must_use]
    pub const fn should_restart(&self, exit_code: i64, restart_count: u32) -> bool {
        match self.name {
            RestartPolicyName::No => false,
            RestartPolicyName::Always | RestartPolicyName::UnlessStopped => true,
            RestartPolicyName::OnFailure => {
                exit_code != 0
                    && (self.maximum_retry_count == 0 || restart_count < self.maximum_retry_count)
            }
        }
    }
}

/// Backoff before the next policy restart: 100ms doubling per restart,
/// capped at one minute.
#[must_use]
pub fn restart_delay(restart_count: u32) -> Duration {
    const BASE_MS: u64 = 100;
    const MAX: Duration = Duration::from_secs(60);
    1u64.checked_shl(restart_count)
        .and_then(|factor| factor.checked_mul(BASE_MS))
        .map_or(MAX, |ms| Duration::from_millis(ms).min(MAX))
}

/// What a client asked for when creating a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image reference as supplied.
    pub image: String,
    /// Entrypoint; prepended to `cmd`.
    pub entrypoint: Vec<String>,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs in client order.
    pub env: Vec<String>,
    /// Working directory inside the workload.
    pub working_dir: Option<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Bind mounts, host path to container path. Stored opaquely.
    pub binds: BTreeMap<String, String>,
    /// Allocate a TTY: output is written raw instead of framed.
    pub tty: bool,
    /// Keep stdin open for attach.
    pub open_stdin: bool,
    /// Behaviour after the process exits on its own.
    pub restart_policy: RestartPolicy,
}

impl ContainerConfig {
    /// Entrypoint followed by command.
    #[must_use]
    pub fn command(&self) -> Vec<String> {
        self.entrypoint.iter().chain(&self.cmd).cloned().collect()
    }
}

/// A container record owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// 64-hex id.
    pub id: String,
    /// Canonical name with a leading slash.
    pub name: String,
    /// Id of the resolved image record.
    pub image_id: String,
    /// Creation parameters.
    pub config: ContainerConfig,
    /// Current state.
    pub state: ContainerState,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Last exit time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code; set iff the state is terminal.
    pub exit_code: Option<i64>,
    /// Host pid of the main process, when the factory reports one.
    pub pid: Option<u32>,
    /// Number of starts after the first.
    pub restart_count: u32,
}

impl Container {
    /// Creates a record in the `created` state.
    #[must_use]
    pub fn new(id: String, name: String, image_id: String, config: ContainerConfig) -> Self {
        Self {
            id,
            name,
            image_id,
            config,
            state: ContainerState::Created,
            created: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
            restart_count: 0,
        }
    }

    /// Human readable status as shown by `docker ps`.
    #[must_use]
    pub fn status_line(&self) -> String {
        match self.state {
            ContainerState::Created => "Created".to_string(),
            ContainerState::Running | ContainerState::Paused => {
                let up = self
                    .started_at
                    .map(|t| format!("Up {}", humanize(Utc::now() - t)))
                    .unwrap_or_else(|| "Up".to_string());
                if self.state == ContainerState::Paused {
                    format!("{up} (Paused)")
                } else {
                    up
                }
            }
            ContainerState::Restarting => "Restarting".to_string(),
            ContainerState::Removing => "Removal In Progress".to_string(),
            ContainerState::Exited => {
                let code = self.exit_code.unwrap_or_default();
                match self.finished_at {
                    Some(t) => format!("Exited ({code}) {} ago", humanize(Utc::now() - t)),
                    None => format!("Exited ({code})"),
                }
            }
            ContainerState::Dead => "Dead".to_string(),
        }
    }
}

fn humanize(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    match secs {
        0 => "Less than a second".to_string(),
        1 => "1 second".to_string(),
        2..=59 => format!("{secs} seconds"),
        60..=119 => "About a minute".to_string(),
        120..=3599 => format!("{} minutes", secs / 60),
        3600..=7199 => "About an hour".to_string(),
        _ => format!("{} hours", secs / 3600),
    }
}
