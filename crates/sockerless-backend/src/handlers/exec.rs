use super::stream::{content_type, pump_chunks, switch_protocols, take_upgrade, wants_upgrade};
use super::{parse_json, parse_number, read_body, JsonBody};
use crate::api::AppState;
use crate::error::{BackendError, Result};
use crate::types::{ExecCreateRequest, ExecCreateResponse, ExecInspectResponse, ExecStartRequest};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use sockerless_core::exec::{ExecConfig, PreparedExec};
use sockerless_core::frame::{output_channel, FrameWriter, RawWriter, StreamKind};
use sockerless_core::process::{BoxReader, BoxWriter, ExecIo};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Create an exec instance.
///
/// # Errors
///
/// Returns 400 without a command, 404, or 409 if the container is not
/// running.
pub async fn exec_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<ExecCreateRequest>,
) -> Result<(StatusCode, Json<ExecCreateResponse>)> {
    let config = ExecConfig {
        cmd: body.cmd,
        env: body.env,
        working_dir: body.working_dir.filter(|w| !w.is_empty()),
        tty: body.tty,
        attach_stdin: body.attach_stdin,
        attach_stdout: body.attach_stdout,
        attach_stderr: body.attach_stderr,
        user: body.user.filter(|u| !u.is_empty()),
    };
    let instance = state.runtime.execs().create(&id, config)?;
    Ok((
        StatusCode::CREATED,
        Json(ExecCreateResponse { id: instance.id }),
    ))
}

/// Start an exec instance.
///
/// `Detach` runs it in the background. With `Upgrade: tcp` the connection
/// is hijacked; otherwise output is streamed as the response body.
///
/// # Errors
///
/// Returns 404, 409 if already started or the container is not running, or
/// 501 without a process factory.
pub async fn exec_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut req: Request<Body>,
) -> Result<Response> {
    let upgrade = wants_upgrade(req.headers()).then(|| take_upgrade(&mut req));
    let body: ExecStartRequest = parse_json(&read_body(req.into_body()).await?)?;

    let instance = state.runtime.execs().inspect(&id)?;
    let tty = instance.config.tty || body.tty;
    let attach_stdin = instance.config.attach_stdin;
    let prepared = state.runtime.execs().prepare(&id)?;

    if body.detach {
        tokio::spawn(run_logged(prepared, ExecIo::detached(), CancellationToken::new()));
        return Ok(StatusCode::OK.into_response());
    }

    let (sink, receiver) = output_channel();
    let (stdout, stderr): (BoxWriter, BoxWriter) = if tty {
        (
            Box::new(RawWriter::new(sink.clone())),
            Box::new(RawWriter::new(sink)),
        )
    } else {
        (
            Box::new(FrameWriter::new(sink.clone(), StreamKind::Stdout)),
            Box::new(FrameWriter::new(sink, StreamKind::Stderr)),
        )
    };
    let cancel = CancellationToken::new();
    let chunks = UnboundedReceiverStream::new(receiver);

    let Some(on_upgrade) = upgrade else {
        let io = ExecIo {
            stdin: None,
            stdout,
            stderr,
        };
        tokio::spawn(run_logged(prepared, io, cancel.clone()));
        // A client hang-up drops the body, which cancels the exec.
        let guard = cancel.drop_guard();
        let body = Body::from_stream(chunks.map(move |chunk| {
            let _ = &guard;
            Ok::<_, std::io::Error>(chunk)
        }));
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type(tty))
            .body(body)
            .map_err(|e| BackendError::Server(format!("failed to build exec response: {e}")));
    };

    switch_protocols(on_upgrade, tty, move |reader, mut writer| async move {
        let stdin = attach_stdin.then(|| Box::new(reader) as BoxReader);
        let io = ExecIo {
            stdin,
            stdout,
            stderr,
        };
        let run = tokio::spawn(run_logged(prepared, io, cancel.clone()));
        if !pump_chunks(chunks, &mut writer).await {
            cancel.cancel();
        }
        let _ = run.await;
    })
}

async fn run_logged(prepared: PreparedExec, io: ExecIo, cancel: CancellationToken) {
    let id = prepared.id().to_string();
    match prepared.run(io, cancel).await {
        Ok(code) => tracing::debug!(exec = %id, exit_code = code, "exec finished"),
        Err(e) => tracing::warn!(exec = %id, "exec failed: {}", e),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResizeQuery {
    h: Option<String>,
    w: Option<String>,
}

/// Resize an exec TTY. Accepted and ignored.
///
/// # Errors
///
/// Returns 400 for malformed sizes or 404.
pub async fn exec_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResizeQuery>,
) -> Result<StatusCode> {
    let height = parse_number::<u16>("h", query.h.as_deref())?.unwrap_or(0);
    let width = parse_number::<u16>("w", query.w.as_deref())?.unwrap_or(0);
    state.runtime.execs().resize(&id, height, width)?;
    Ok(StatusCode::OK)
}

/// Inspect an exec instance.
///
/// # Errors
///
/// Returns 404 if the exec or its container is gone.
pub async fn exec_inspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecInspectResponse>> {
    let instance = state.runtime.execs().inspect(&id)?;
    Ok(Json(ExecInspectResponse::from(&instance)))
}
