use super::stream::{self, output_response, pump_chunks, switch_protocols, take_upgrade, wants_upgrade};
use super::{flag, flag_or, parse_number, JsonBody};
use crate::api::AppState;
use crate::error::{BackendError, Result};
use crate::types::{
    ContainerCreateRequest, ContainerCreateResponse, ContainerInspectResponse,
    ContainerPruneResponse, ContainerSummary, HostConfig, StatsResponse, TopResponse,
    WaitResponse,
};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sockerless_core::filter::ContainerFilter;
use sockerless_core::logs::LogRenderOptions;
use sockerless_core::manager::{AttachSession, KillSignal, LogsOptions, WaitCondition};
use sockerless_core::state::{ContainerConfig, RestartPolicy, RestartPolicyName};
use sockerless_core::StartResult;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateQuery {
    name: Option<String>,
}

/// Create a container.
///
/// # Errors
///
/// Returns 400 for a missing image or command, 409 on a name conflict.
pub async fn create_container(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    JsonBody(body): JsonBody<ContainerCreateRequest>,
) -> Result<(StatusCode, Json<ContainerCreateResponse>)> {
    let name = query
        .name
        .filter(|n| !n.is_empty())
        .or_else(|| body.name.clone().filter(|n| !n.is_empty()));
    let binds = parse_binds(
        body.host_config
            .as_ref()
            .map_or(&[][..], |h| h.binds.as_slice()),
    )?;
    let restart_policy = restart_policy(body.host_config.as_ref())?;
    let config = ContainerConfig {
        image: body.image,
        entrypoint: body.entrypoint,
        cmd: body.cmd,
        env: body.env,
        working_dir: body.working_dir.filter(|w| !w.is_empty()),
        labels: body.labels,
        binds,
        tty: body.tty,
        open_stdin: body.open_stdin || body.attach_stdin,
        restart_policy,
    };

    let container = state.runtime.containers().create(config, name.as_deref())?;
    Ok((
        StatusCode::CREATED,
        Json(ContainerCreateResponse {
            id: container.id,
            warnings: Vec::new(),
        }),
    ))
}

/// Splits `host:container[:mode]` binds into host path to `container[:mode]`.
fn parse_binds(binds: &[String]) -> Result<BTreeMap<String, String>> {
    binds
        .iter()
        .map(|bind| match bind.split_once(':') {
            Some((host, rest)) if !host.is_empty() && !rest.is_empty() => {
                Ok((host.to_string(), rest.to_string()))
            }
            _ => Err(BackendError::BadRequest(format!("invalid bind mount spec: {bind}"))),
        })
        .collect()
}

fn restart_policy(host: Option<&HostConfig>) -> Result<RestartPolicy> {
    let Some(body) = host.map(|h| &h.restart_policy) else {
        return Ok(RestartPolicy::default());
    };
    let name = RestartPolicyName::parse(&body.name).ok_or_else(|| {
        BackendError::BadRequest(format!(
            "invalid restart policy: unknown policy '{}'; use one of 'no', 'always', 'on-failure', or 'unless-stopped'",
            body.name
        ))
    })?;
    if body.maximum_retry_count > 0 && name != RestartPolicyName::OnFailure {
        return Err(BackendError::BadRequest(
            "invalid restart policy: maximum retry count can only be used with 'on-failure'"
                .to_string(),
        ));
    }
    Ok(RestartPolicy {
        name,
        maximum_retry_count: body.maximum_retry_count,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    all: Option<String>,
    limit: Option<String>,
    filters: Option<String>,
}

/// List containers.
///
/// # Errors
///
/// Returns 400 for malformed filters.
pub async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContainerSummary>>> {
    let filter = match query.filters.as_deref().filter(|f| !f.is_empty()) {
        Some(raw) => ContainerFilter::from_docker_json(raw)?,
        None => ContainerFilter::default(),
    };
    let limit = parse_number::<i64>("limit", query.limit.as_deref())?
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0);
    let all = flag(query.all.as_deref()) || limit.is_some();

    let containers = state.runtime.containers().list(&filter, all, limit);
    Ok(Json(containers.iter().map(ContainerSummary::from).collect()))
}

/// Inspect a container.
///
/// # Errors
///
/// Returns 404 if the reference does not resolve.
pub async fn inspect_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInspectResponse>> {
    let container = state.runtime.containers().inspect(&id)?;
    Ok(Json(ContainerInspectResponse::new(
        &container,
        state.runtime.driver_name(),
    )))
}

/// Start a container. Starting a running container is a no-op.
///
/// # Errors
///
/// Returns 404, 409 for a removed or starting container, 501 without a
/// process factory.
pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    match state.runtime.containers().start(&id).await? {
        StartResult::Started => Ok(StatusCode::NO_CONTENT),
        StartResult::AlreadyRunning => Ok(StatusCode::OK),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StopQuery {
    t: Option<String>,
}

impl StopQuery {
    fn timeout(&self) -> Result<Option<Duration>> {
        Ok(parse_number::<i64>("t", self.t.as_deref())?
            .map(|secs| Duration::from_secs(u64::try_from(secs).unwrap_or(0))))
    }
}

/// Stop a container.
///
/// # Errors
///
/// Returns 404, or 409 if it is not running.
pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode> {
    let code = state.runtime.containers().stop(&id, query.timeout()?).await?;
    tracing::debug!(container = %id, exit_code = code, "stop completed");
    Ok(StatusCode::NO_CONTENT)
}

/// Restart a container.
///
/// # Errors
///
/// Returns 404, or 501 without a process factory.
pub async fn restart_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode> {
    state
        .runtime
        .containers()
        .restart(&id, query.timeout()?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KillQuery {
    signal: Option<String>,
}

/// Send a signal to a container.
///
/// # Errors
///
/// Returns 400 for an unknown signal, 404, or 409 if it is not running.
pub async fn kill_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<StatusCode> {
    let signal = KillSignal::parse(query.signal.as_deref()).ok_or_else(|| {
        BackendError::BadRequest(format!(
            "Invalid signal: {}",
            query.signal.as_deref().unwrap_or_default()
        ))
    })?;
    state.runtime.containers().kill(&id, signal).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pause a container.
///
/// # Errors
///
/// Returns 501 unless the process supports pausing.
pub async fn pause_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.runtime.containers().pause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unpause a container.
///
/// # Errors
///
/// Returns 501 unless the process supports pausing.
pub async fn unpause_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.runtime.containers().unpause(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WaitQuery {
    condition: Option<String>,
}

/// Block until a container reaches the requested condition.
///
/// # Errors
///
/// Returns 400 for an unknown condition or 404.
pub async fn wait_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<WaitResponse>> {
    let raw = query.condition.unwrap_or_default();
    let condition = WaitCondition::parse(&raw)
        .ok_or_else(|| BackendError::BadRequest(format!("invalid condition: {raw}")))?;
    let status_code = state.runtime.containers().wait(&id, condition).await?;
    Ok(Json(WaitResponse { status_code }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RemoveQuery {
    force: Option<String>,
}

/// Remove a container.
///
/// # Errors
///
/// Returns 404, or 409 if it is running and `force` is not set.
pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode> {
    state
        .runtime
        .containers()
        .remove(&id, flag(query.force.as_deref()))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RenameQuery {
    name: Option<String>,
}

/// Rename a container.
///
/// # Errors
///
/// Returns 400 for a missing or invalid name, 404, or 409 if the name is
/// taken.
pub async fn rename_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RenameQuery>,
) -> Result<StatusCode> {
    let name = query
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| BackendError::BadRequest("name is required".to_string()))?;
    state.runtime.containers().rename(&id, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PruneQuery {
    filters: Option<String>,
}

/// Remove stopped containers.
///
/// # Errors
///
/// Returns 400 for malformed filters.
pub async fn prune_containers(
    State(state): State<AppState>,
    Query(query): Query<PruneQuery>,
) -> Result<Json<ContainerPruneResponse>> {
    let filter = ContainerFilter::from_docker_json(query.filters.as_deref().unwrap_or_default())?;
    let containers_deleted = state.runtime.containers().prune(&filter).await;
    tracing::info!(count = containers_deleted.len(), "containers pruned");
    Ok(Json(ContainerPruneResponse {
        containers_deleted,
        space_reclaimed: 0,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogsQuery {
    stdout: Option<String>,
    stderr: Option<String>,
    follow: Option<String>,
    timestamps: Option<String>,
    tail: Option<String>,
    since: Option<String>,
    until: Option<String>,
}

impl LogsQuery {
    fn options(&self) -> Result<LogsOptions> {
        if !flag(self.stdout.as_deref()) && !flag(self.stderr.as_deref()) {
            return Err(BackendError::BadRequest(
                "You must choose at least one stream".to_string(),
            ));
        }
        let tail = match self.tail.as_deref() {
            None | Some("" | "all") => None,
            Some(n) => parse_number::<i64>("tail", Some(n))?.and_then(|n| usize::try_from(n).ok()),
        };
        Ok(LogsOptions {
            follow: flag(self.follow.as_deref()),
            render: LogRenderOptions {
                timestamps: flag(self.timestamps.as_deref()),
                since: unix_time("since", self.since.as_deref())?,
                until: unix_time("until", self.until.as_deref())?,
                tail,
            },
        })
    }
}

/// Parses Docker's `seconds[.nanos]` timestamps. Zero means unset.
fn unix_time(name: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let invalid = || BackendError::BadRequest(format!("invalid value for {name}: {raw}"));
    let (secs, nanos) = raw.split_once('.').unwrap_or((raw, "0"));
    let secs: i64 = secs.parse().map_err(|_| invalid())?;
    let nanos: u32 = format!("{nanos:0<9}")
        .get(..9)
        .and_then(|n| n.parse().ok())
        .ok_or_else(invalid)?;
    if secs == 0 && nanos == 0 {
        return Ok(None);
    }
    DateTime::from_timestamp(secs, nanos).map(Some).ok_or_else(invalid)
}

/// Get container logs.
///
/// # Errors
///
/// Returns 400 if no stream is selected, or 404.
pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response> {
    let options = query.options()?;
    let output = state.runtime.containers().logs(&id, &options)?;
    output_response(output)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AttachQuery {
    stdin: Option<String>,
}

/// Attach to a container.
///
/// With `Upgrade: tcp` the connection is hijacked and stdin is relayed;
/// otherwise output is streamed as the response body.
///
/// # Errors
///
/// Returns 404, or 409 if the container never started.
pub async fn attach_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AttachQuery>,
    mut req: Request<Body>,
) -> Result<Response> {
    let upgrade = wants_upgrade(req.headers()).then(|| take_upgrade(&mut req));
    let with_stdin = upgrade.is_some() && flag(query.stdin.as_deref());
    let session = state.runtime.containers().attach(&id, with_stdin).await?;

    let Some(on_upgrade) = upgrade else {
        return output_response(session.output);
    };

    let tty = session.output.tty;
    switch_protocols(on_upgrade, tty, move |mut reader, mut writer| async move {
        let AttachSession { output, stdin } = session;
        // Client EOF closes the workload's stdin; output keeps flowing
        // until the workload stops writing or the client goes away.
        let relay_stdin = tokio::spawn(async move {
            let Some(mut stdin) = stdin else {
                return;
            };
            if let Err(e) = tokio::io::copy(&mut reader, &mut stdin).await {
                stream::log_io_end(&e);
            }
            let _ = stdin.shutdown().await;
        });
        pump_chunks(stream::output_chunks(output), &mut writer).await;
        relay_stdin.abort();
        tracing::debug!(container = %id, "attach session ended");
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatsQuery {
    stream: Option<String>,
}

/// Get container resource usage.
///
/// # Errors
///
/// Returns 404.
pub async fn container_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Response> {
    let mem_limit = u64::try_from(state.descriptor.mem_total).unwrap_or(0);
    let cpus = u32::try_from(state.descriptor.ncpu).unwrap_or(1);
    let (container, stats) = state.runtime.containers().stats(&id)?;

    if !flag_or(query.stream.as_deref(), true) {
        return Ok(Json(StatsResponse::new(&container, &stats, None, mem_limit, cpus)).into_response());
    }

    let first = StatsResponse::new(&container, &stats, None, mem_limit, cpus);
    let seed = (state, id, Some(stats), container.state.is_active());
    let rest = futures::stream::unfold(seed, move |(state, id, previous, active)| async move {
        if !active {
            return None;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (container, stats) = state.runtime.containers().stats(&id).ok()?;
        let sample = StatsResponse::new(&container, &stats, previous.as_ref(), mem_limit, cpus);
        let active = container.state.is_active();
        Some((sample, (state, id, Some(stats), active)))
    });
    let lines = futures::stream::once(async move { first })
        .chain(rest)
        .map(|sample| {
            serde_json::to_vec(&sample).map(|mut line| {
                line.push(b'\n');
                Bytes::from(line)
            })
        });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(lines))
        .map_err(|e| BackendError::Server(format!("failed to build stats response: {e}")))
}

/// List processes running inside a container.
///
/// # Errors
///
/// Returns 404, or 409 if it is not running.
pub async fn container_top(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TopResponse>> {
    let entries = state.runtime.containers().top(&id)?;
    Ok(Json(TopResponse::from(entries)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_split_host_from_destination() {
        let binds = parse_binds(&["/srv:/data:ro".to_string(), "/tmp:/tmp".to_string()]).unwrap();
        assert_eq!(binds["/srv"], "/data:ro");
        assert_eq!(binds["/tmp"], "/tmp");
        assert!(parse_binds(&["nocolon".to_string()]).is_err());
    }

    #[test]
    fn restart_policy_is_validated() {
        let host = |name: &str, max: u32| HostConfig {
            restart_policy: crate::types::RestartPolicyBody {
                name: name.to_string(),
                maximum_retry_count: max,
            },
            ..HostConfig::default()
        };
        assert_eq!(restart_policy(None).unwrap(), RestartPolicy::default());
        let policy = restart_policy(Some(&host("on-failure", 3))).unwrap();
        assert_eq!(policy.name, RestartPolicyName::OnFailure);
        assert_eq!(policy.maximum_retry_count, 3);
        assert_eq!(
            restart_policy(Some(&host("", 0))).unwrap().name,
            RestartPolicyName::No
        );
        assert!(restart_policy(Some(&host("sometimes", 0))).is_err());
        assert!(restart_policy(Some(&host("always", 2))).is_err());
    }

    #[test]
    fn logs_need_a_stream() {
        assert!(LogsQuery::default().options().is_err());
        let query = LogsQuery {
            stdout: Some("1".into()),
            tail: Some("all".into()),
            since: Some("1700000000.5".into()),
            ..LogsQuery::default()
        };
        let options = query.options().unwrap();
        assert_eq!(options.render.tail, None);
        let since = options.render.since.unwrap();
        assert_eq!(since.timestamp(), 1_700_000_000);
        assert_eq!(since.timestamp_subsec_nanos(), 500_000_000);
    }

    #[test]
    fn zero_since_means_unset() {
        assert_eq!(unix_time("since", Some("0")).unwrap(), None);
        assert!(unix_time("since", Some("abc")).is_err());
    }
}
