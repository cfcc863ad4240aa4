//! Docker API types.
//!
//! Request and response bodies in the Docker Engine API shape, limited to
//! the fields a backend reports. See: <https://docs.docker.com/engine/api/v1.43/>

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sockerless_core::event::{Event, EventKind};
use sockerless_core::exec::ExecInstance;
use sockerless_core::image::Image;
use sockerless_core::process::{ProcessStats, ProcessTopEntry};
use sockerless_core::state::{Container, ContainerState, RestartPolicy};
use std::collections::{BTreeMap, HashMap};

/// Timestamp Docker uses for "never".
pub const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

pub(crate) fn docker_time(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(
        || ZERO_TIME.to_string(),
        |t| t.to_rfc3339_opts(SecondsFormat::Nanos, true),
    )
}

/// Accepts `null`, a single string, or an array of strings.
fn string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// System Types
// ============================================================================

/// Version response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionResponse {
    pub version: String,
    pub api_version: String,
    pub min_api_version: String,
    pub git_commit: String,
    pub go_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub components: Vec<VersionComponent>,
}

/// Component entry of a version response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionComponent {
    pub name: String,
    pub version: String,
}

/// System info response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfoResponse {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub containers: i64,
    pub containers_running: i64,
    pub containers_paused: i64,
    pub containers_stopped: i64,
    pub images: i64,
    pub driver: String,
    pub server_version: String,
    pub operating_system: String,
    #[serde(rename = "OSType")]
    pub os_type: String,
    pub architecture: String,
    #[serde(rename = "NCPU")]
    pub ncpu: i64,
    pub mem_total: i64,
    pub labels: Vec<String>,
}

// ============================================================================
// Container Types
// ============================================================================

/// Container create request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerCreateRequest {
    pub image: String,
    #[serde(deserialize_with = "string_or_vec")]
    pub cmd: Vec<String>,
    #[serde(deserialize_with = "string_or_vec")]
    pub entrypoint: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub attach_stdin: bool,
    pub host_config: Option<HostConfig>,
    #[serde(alias = "name")]
    pub name: Option<String>,
}

/// Host configuration subset.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfig {
    #[serde(deserialize_with = "null_as_default")]
    pub binds: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub restart_policy: RestartPolicyBody,
}

/// Restart policy as Docker spells it.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RestartPolicyBody {
    pub name: String,
    pub maximum_retry_count: u32,
}

impl From<RestartPolicy> for RestartPolicyBody {
    fn from(policy: RestartPolicy) -> Self {
        Self {
            name: policy.name.as_str().to_string(),
            maximum_retry_count: policy.maximum_retry_count,
        }
    }
}

/// Container create response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Container summary (for list).
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    #[serde(rename = "ImageID")]
    pub image_id: String,
    pub command: String,
    pub created: i64,
    pub state: String,
    pub status: String,
    pub labels: BTreeMap<String, String>,
}

impl From<&Container> for ContainerSummary {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id.clone(),
            names: vec![c.name.clone()],
            image: c.config.image.clone(),
            image_id: c.image_id.clone(),
            command: c.config.command().join(" "),
            created: c.created.timestamp(),
            state: c.state.to_string(),
            status: c.status_line(),
            labels: c.config.labels.clone(),
        }
    }
}

/// Container inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspectResponse {
    pub id: String,
    pub name: String,
    pub created: String,
    pub path: String,
    pub args: Vec<String>,
    pub state: ContainerStateResponse,
    pub image: String,
    pub restart_count: u32,
    pub driver: String,
    pub config: ContainerConfigResponse,
    pub host_config: HostConfig,
    pub mounts: Vec<MountPoint>,
}

/// Container state in an inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStateResponse {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    pub dead: bool,
    pub pid: u32,
    pub exit_code: i64,
    pub error: String,
    pub started_at: String,
    pub finished_at: String,
}

/// Container config in an inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfigResponse {
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
}

/// Mount point.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    #[serde(rename = "Type")]
    pub mount_type: String,
    pub source: String,
    pub destination: String,
    pub mode: String,
    #[serde(rename = "RW")]
    pub rw: bool,
}

impl ContainerInspectResponse {
    /// Builds the inspect body for a record and its reporting driver.
    #[must_use]
    pub fn new(c: &Container, driver: &str) -> Self {
        let command = c.config.command();
        let (path, args) = command
            .split_first()
            .map(|(p, a)| (p.clone(), a.to_vec()))
            .unwrap_or_default();
        let binds = c
            .config
            .binds
            .iter()
            .map(|(source, spec)| {
                let mut parts = spec.splitn(2, ':');
                let dest = parts.next().unwrap_or_default().to_string();
                let mode = parts.next().unwrap_or_default().to_string();
                (dest, source.clone(), mode)
            })
            .collect::<Vec<_>>();

        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            created: docker_time(Some(c.created)),
            path,
            args,
            state: ContainerStateResponse {
                status: c.state.to_string(),
                running: matches!(c.state, ContainerState::Running | ContainerState::Paused),
                paused: c.state == ContainerState::Paused,
                restarting: c.state == ContainerState::Restarting,
                oom_killed: false,
                dead: c.state == ContainerState::Dead,
                pid: if c.state.is_active() { c.pid.unwrap_or(0) } else { 0 },
                exit_code: c.exit_code.unwrap_or(0),
                error: String::new(),
                started_at: docker_time(c.started_at),
                finished_at: docker_time(c.finished_at),
            },
            image: c.image_id.clone(),
            restart_count: c.restart_count,
            driver: driver.to_string(),
            config: ContainerConfigResponse {
                image: c.config.image.clone(),
                cmd: c.config.cmd.clone(),
                entrypoint: c.config.entrypoint.clone(),
                env: c.config.env.clone(),
                working_dir: c.config.working_dir.clone().unwrap_or_default(),
                labels: c.config.labels.clone(),
                tty: c.config.tty,
                open_stdin: c.config.open_stdin,
            },
            host_config: HostConfig {
                binds: binds
                    .iter()
                    .map(|(dest, source, mode)| {
                        if mode.is_empty() {
                            format!("{source}:{dest}")
                        } else {
                            format!("{source}:{dest}:{mode}")
                        }
                    })
                    .collect(),
                restart_policy: c.config.restart_policy.into(),
            },
            mounts: binds
                .into_iter()
                .map(|(destination, source, mode)| MountPoint {
                    mount_type: "bind".to_string(),
                    rw: !mode.split(',').any(|m| m == "ro"),
                    source,
                    destination,
                    mode,
                })
                .collect(),
        }
    }
}

/// Container prune response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerPruneResponse {
    pub containers_deleted: Vec<String>,
    pub space_reclaimed: i64,
}

/// Wait response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    pub status_code: i64,
}

/// Top response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopResponse {
    pub titles: Vec<String>,
    pub processes: Vec<Vec<String>>,
}

impl From<Vec<ProcessTopEntry>> for TopResponse {
    fn from(entries: Vec<ProcessTopEntry>) -> Self {
        Self {
            titles: vec!["PID".to_string(), "CMD".to_string()],
            processes: entries
                .into_iter()
                .map(|e| vec![e.pid.to_string(), e.command])
                .collect(),
        }
    }
}

/// One stats sample. Docker uses snake case here.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub read: String,
    pub preread: String,
    pub id: String,
    pub name: String,
    pub pids_stats: PidsStats,
    pub memory_stats: MemoryStats,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub networks: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
pub struct PidsStats {
    pub current: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct MemoryStats {
    pub usage: u64,
    pub limit: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct CpuUsage {
    pub total_usage: u64,
}

impl StatsResponse {
    /// Builds a sample from process stats. `previous` fills `precpu_stats`.
    #[must_use]
    pub fn new(
        c: &Container,
        stats: &ProcessStats,
        previous: Option<&ProcessStats>,
        mem_limit: u64,
        online_cpus: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            read: docker_time(Some(now)),
            preread: previous.map_or_else(|| ZERO_TIME.to_string(), |_| {
                docker_time(Some(now - chrono::Duration::seconds(1)))
            }),
            id: c.id.clone(),
            name: c.name.clone(),
            pids_stats: PidsStats {
                current: stats.pids,
            },
            memory_stats: MemoryStats {
                usage: stats.memory_usage,
                limit: mem_limit,
            },
            cpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: stats.cpu_nanos,
                },
                system_cpu_usage: 0,
                online_cpus,
            },
            precpu_stats: previous.map_or_else(CpuStats::default, |p| CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: p.cpu_nanos,
                },
                system_cpu_usage: 0,
                online_cpus,
            }),
            networks: HashMap::new(),
        }
    }
}

// ============================================================================
// Exec Types
// ============================================================================

/// Exec create request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecCreateRequest {
    #[serde(deserialize_with = "string_or_vec")]
    pub cmd: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub user: Option<String>,
}

/// Exec create response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecCreateResponse {
    pub id: String,
}

/// Exec start request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecStartRequest {
    pub detach: bool,
    pub tty: bool,
}

/// Exec inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspectResponse {
    #[serde(rename = "ID")]
    pub id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub process_config: ExecProcessConfig,
    pub open_stdin: bool,
    pub open_stdout: bool,
    pub open_stderr: bool,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub pid: u32,
    pub can_remove: bool,
}

/// Process config of an exec.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecProcessConfig {
    pub tty: bool,
    pub entrypoint: String,
    pub arguments: Vec<String>,
    pub privileged: bool,
    pub user: String,
}

impl From<&ExecInstance> for ExecInspectResponse {
    fn from(e: &ExecInstance) -> Self {
        let (entrypoint, arguments) = e
            .config
            .cmd
            .split_first()
            .map(|(p, a)| (p.clone(), a.to_vec()))
            .unwrap_or_default();
        Self {
            id: e.id.clone(),
            running: e.running,
            exit_code: e.exit_code,
            process_config: ExecProcessConfig {
                tty: e.config.tty,
                entrypoint,
                arguments,
                privileged: false,
                user: e.config.user.clone().unwrap_or_default(),
            },
            open_stdin: e.config.attach_stdin,
            open_stdout: e.config.attach_stdout,
            open_stderr: e.config.attach_stderr,
            container_id: e.container_id.clone(),
            pid: e.pid.unwrap_or(0),
            can_remove: !e.running,
        }
    }
}

// ============================================================================
// Image Types
// ============================================================================

/// Image summary (for list).
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    pub parent_id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub created: i64,
    pub size: i64,
    pub labels: BTreeMap<String, String>,
    pub containers: i64,
}

impl From<&Image> for ImageSummary {
    fn from(i: &Image) -> Self {
        Self {
            id: i.id.clone(),
            parent_id: String::new(),
            repo_tags: i.tags.iter().cloned().collect(),
            repo_digests: Vec::new(),
            created: i.created.timestamp(),
            size: i.size,
            labels: i.labels.clone(),
            containers: -1,
        }
    }
}

/// Image inspect response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspectResponse {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub created: String,
    pub size: i64,
    pub os: String,
    pub architecture: String,
    pub config: ImageConfig,
}

/// Image config subset.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    pub labels: BTreeMap<String, String>,
}

impl From<&Image> for ImageInspectResponse {
    fn from(i: &Image) -> Self {
        Self {
            id: i.id.clone(),
            repo_tags: i.tags.iter().cloned().collect(),
            repo_digests: Vec::new(),
            created: docker_time(Some(i.created)),
            size: i.size,
            os: "linux".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            config: ImageConfig {
                labels: i.labels.clone(),
            },
        }
    }
}

/// Image delete response item.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDeleteResponseItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub untagged: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

/// Image prune response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImagePruneResponse {
    pub images_deleted: Vec<ImageDeleteResponseItem>,
    pub space_reclaimed: i64,
}

/// Pull progress line.
#[derive(Debug, Serialize)]
pub struct PullProgress {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

// ============================================================================
// Event Types
// ============================================================================

/// One line of the `/events` stream.
#[derive(Debug, Serialize)]
pub struct EventMessage {
    #[serde(rename = "Type")]
    pub event_type: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Actor")]
    pub actor: EventActor,
    pub scope: String,
    pub time: i64,
    #[serde(rename = "timeNano")]
    pub time_nano: i64,
    /// Pre-1.22 fields, still read by older clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// The object an event is about.
#[derive(Debug, Serialize)]
pub struct EventActor {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Attributes")]
    pub attributes: BTreeMap<String, String>,
}

impl From<&Event> for EventMessage {
    fn from(event: &Event) -> Self {
        let time = event.time.timestamp();
        let container = event.kind == EventKind::Container;
        Self {
            event_type: event.kind.as_str().to_string(),
            action: event.action.clone(),
            actor: EventActor {
                id: event.actor_id.clone(),
                attributes: event.attributes.clone(),
            },
            scope: "local".to_string(),
            time,
            time_nano: event
                .time
                .timestamp_nanos_opt()
                .unwrap_or(time.saturating_mul(1_000_000_000)),
            id: Some(event.actor_id.clone()),
            status: Some(event.action.clone()),
            from: container
                .then(|| event.attributes.get("image").cloned())
                .flatten(),
        }
    }
}

// ============================================================================
// Management Types
// ============================================================================

/// `/internal/v1/healthz` response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub component: String,
    pub uptime_seconds: u64,
}

/// `/internal/v1/status` response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub component: String,
    pub backend_type: String,
    pub instance_id: String,
    pub uptime_seconds: u64,
    pub containers: usize,
    pub active_resources: usize,
}

/// One row of `/internal/v1/containers/summary`.
#[derive(Debug, Serialize)]
pub struct ContainerSummaryEntry {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub created: String,
}

impl From<&Container> for ContainerSummaryEntry {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.config.image.clone(),
            state: c.state.to_string(),
            created: docker_time(Some(c.created)),
        }
    }
}

/// Result of one self-check.
#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// `/internal/v1/check` response.
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub checks: Vec<CheckResult>,
}
