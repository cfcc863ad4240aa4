//! Backend HTTP server.
//!
//! Serves the router over TCP or a Unix socket with HTTP/1.1 upgrades
//! enabled, until the shutdown token fires.

use crate::error::{BackendError, Result};
use axum::http::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_http::trace::TraceLayer;

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum ListenAddr {
    /// TCP `host:port`.
    Tcp(String),
    /// Unix socket path.
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Backend HTTP server.
pub struct BackendServer {
    addr: ListenAddr,
    app: Router,
}

impl BackendServer {
    /// Creates a server for `app`.
    #[must_use]
    pub fn new(addr: ListenAddr, app: Router) -> Self {
        Self { addr, app }
    }

    /// Binds and serves until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or accepting fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        match &self.addr {
            ListenAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| BackendError::Server(format!("failed to bind {addr}: {e}")))?;
                tracing::info!("backend listening on {}", self.addr);
                serve_tcp(listener, self.app, shutdown).await
            }
            ListenAddr::Unix(path) => {
                let listener = bind_unix(path)?;
                tracing::info!("backend listening on {}", self.addr);
                let result = serve_unix(listener, self.app, shutdown).await;
                let _ = std::fs::remove_file(path);
                result
            }
        }
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener> {
    // Remove a stale socket from a previous run.
    let _ = std::fs::remove_file(path);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    UnixListener::bind(path)
        .map_err(|e| BackendError::Server(format!("failed to bind {}: {e}", path.display())))
}

/// Serves `app` on an already bound TCP listener.
///
/// # Errors
///
/// Returns an error if accepting fails.
pub async fn serve_tcp(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let app = with_tracing(app);
    loop {
        let stream = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                accepted.map_err(|e| BackendError::Server(e.to_string()))?.0
            }
        };
        spawn_connection(stream, app.clone());
    }
}

/// Serves `app` on an already bound Unix listener.
///
/// # Errors
///
/// Returns an error if accepting fails.
pub async fn serve_unix(listener: UnixListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let app = with_tracing(app);
    loop {
        let stream = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                accepted.map_err(|e| BackendError::Server(e.to_string()))?.0
            }
        };
        spawn_connection(stream, app.clone());
    }
}

fn with_tracing(app: Router) -> Router {
    app.layer(
        TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
                request_id = tracing::field::Empty,
            )
        }),
    )
}

fn spawn_connection<S>(stream: S, tower_service: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| {
            tower_service.clone().call(request)
        });

        if let Err(err) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), hyper_service)
            .with_upgrades()
            .await
        {
            let err_str = err.to_string().to_lowercase();
            if !err_str.contains("shutting down")
                && !err_str.contains("connection reset")
                && !err_str.contains("broken pipe")
            {
                tracing::error!("Error serving connection: {}", err);
            }
        }
    });
}
