//! Streaming helpers shared by attach, logs and exec.
//!
//! Output goes out either as a chunked response body or, when the client
//! asked for `Upgrade: tcp`, over the hijacked connection after a 101.

use crate::error::{BackendError, Result};
use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use sockerless_core::frame::{
    encode_frame, StreamKind, MULTIPLEXED_STREAM_CONTENT_TYPE, RAW_STREAM_CONTENT_TYPE,
};
use sockerless_core::manager::OutputStream;
use std::future::Future;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};

pub(crate) type UpgradedIo = TokioIo<Upgraded>;

/// Whether the client asked to hijack the connection.
pub(crate) fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers.get(header::UPGRADE).is_some()
        && headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
}

/// Content type for an output stream.
pub(crate) const fn content_type(tty: bool) -> &'static str {
    if tty {
        RAW_STREAM_CONTENT_TYPE
    } else {
        MULTIPLEXED_STREAM_CONTENT_TYPE
    }
}

/// Replay followed by live chunks. Non-TTY chunks are framed as stdout.
/// The subscription stays registered until the stream is dropped.
pub(crate) fn output_chunks(output: OutputStream) -> impl Stream<Item = Bytes> + Send + 'static {
    let OutputStream {
        tty,
        replay,
        live,
        guard,
    } = output;

    let head = futures::stream::iter((!replay.is_empty()).then_some(replay));
    let tail = futures::stream::unfold((live, guard), |(mut live, guard)| async move {
        let chunk = live.as_mut()?.recv().await?;
        Some((chunk, (live, guard)))
    });

    head.chain(tail).map(move |chunk| {
        if tty {
            chunk
        } else {
            encode_frame(StreamKind::Stdout, &chunk)
        }
    })
}

/// A streaming `200` response carrying `output`.
pub(crate) fn output_response(output: OutputStream) -> Result<Response> {
    let tty = output.tty;
    let body = Body::from_stream(output_chunks(output).map(Ok::<_, std::io::Error>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type(tty))
        .body(body)
        .map_err(|e| BackendError::Server(format!("failed to build stream response: {e}")))
}

/// Takes the upgrade handle off a request. Must run before the body is read.
pub(crate) fn take_upgrade(req: &mut Request<Body>) -> OnUpgrade {
    hyper::upgrade::on(req)
}

/// Returns the `101` response and runs `pump` on the upgraded connection
/// once the client switches protocols.
pub(crate) fn switch_protocols<F, Fut>(
    on_upgrade: OnUpgrade,
    tty: bool,
    pump: F,
) -> Result<Response>
where
    F: FnOnce(ReadHalf<UpgradedIo>, WriteHalf<UpgradedIo>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "tcp")
        .header(header::CONTENT_TYPE, content_type(tty))
        .body(Body::empty())
        .map_err(|e| BackendError::Server(format!("failed to build upgrade response: {e}")))?;

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::debug!("connection upgrade failed: {}", e);
                return;
            }
        };
        let (reader, writer) = tokio::io::split(TokioIo::new(upgraded));
        pump(reader, writer).await;
    });

    Ok(response)
}

/// Writes every chunk of `chunks` to `writer`, then shuts it down.
/// Returns `false` if the client went away first.
pub(crate) async fn pump_chunks<S, W>(chunks: S, writer: &mut W) -> bool
where
    S: Stream<Item = Bytes>,
    W: tokio::io::AsyncWrite + Unpin,
{
    futures::pin_mut!(chunks);
    while let Some(chunk) = chunks.next().await {
        if let Err(e) = writer.write_all(&chunk).await {
            log_io_end(&e);
            return false;
        }
    }
    let _ = writer.shutdown().await;
    true
}

pub(crate) fn log_io_end(e: &std::io::Error) {
    let msg = e.to_string().to_lowercase();
    if !msg.contains("broken pipe") && !msg.contains("connection reset") {
        tracing::debug!("stream ended: {}", e);
    }
}
