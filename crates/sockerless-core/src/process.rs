//! Process factory contract.
//!
//! A backend plugs in by implementing [`ProcessFactory`]. The factory turns a
//! [`LaunchSpec`] into a [`ContainerProcess`] handle that the lifecycle and
//! exec engines drive. Local factories map `signal` to SIGTERM; cloud
//! factories map it to a job cancellation.

use crate::error::{CoreError, Result};
use crate::logs::{LogRing, LogSubscription};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Exit code reported when a process handle disappears without one.
pub const UNKNOWN_EXIT_CODE: i64 = -1;

/// Exit code for a process terminated by SIGKILL.
pub const KILLED_EXIT_CODE: i64 = 137;

/// Boxed byte source handed to a workload.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed byte sink fed by a workload.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything a factory needs to launch one workload.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Owning container id.
    pub container_id: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint plus arguments.
    pub command: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Host path to container path.
    pub binds: BTreeMap<String, String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// TTY requested.
    pub tty: bool,
    /// Stdin kept open.
    pub open_stdin: bool,
}

/// A one-shot command to run inside an existing workload.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Merged `KEY=VALUE` environment.
    pub env: Vec<String>,
    /// Working directory.
    pub working_dir: Option<String>,
}

/// Client streams spliced to an exec or shell.
pub struct ExecIo {
    /// Client input, when attached.
    pub stdin: Option<BoxReader>,
    /// Standard output sink.
    pub stdout: BoxWriter,
    /// Standard error sink.
    pub stderr: BoxWriter,
}

impl ExecIo {
    /// Streams that discard all output and provide no input.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            stdin: None,
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        }
    }
}

/// Resource usage sample.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessStats {
    /// Resident memory in bytes.
    pub memory_usage: u64,
    /// Accumulated CPU time in nanoseconds.
    pub cpu_nanos: u64,
    /// Number of live processes.
    pub pids: u64,
}

/// One row of `top` output.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessTopEntry {
    /// Process id.
    pub pid: u32,
    /// Command line.
    pub command: String,
}

/// Sender side of a completion signal. The first recorded code wins.
#[derive(Debug)]
pub struct ExitNotifier {
    tx: watch::Sender<Option<i64>>,
}

impl ExitNotifier {
    /// Creates an unresolved notifier.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Records the exit code. Returns false if one was already recorded.
    pub fn notify(&self, code: i64) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        })
    }

    /// A receiver observing this notifier.
    #[must_use]
    pub fn signal(&self) -> ExitSignal {
        ExitSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ExitNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion signal observable by any number of waiters.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<i64>>,
}

impl ExitSignal {
    /// The exit code, if the process has finished.
    #[must_use]
    pub fn exit_code(&self) -> Option<i64> {
        *self.rx.borrow()
    }

    /// Whether the process has finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Waits for the exit code.
    ///
    /// If the notifier is dropped unresolved, resolves to
    /// [`UNKNOWN_EXIT_CODE`].
    pub async fn wait(&self) -> i64 {
        let mut rx = self.rx.clone();
        let code = rx.wait_for(Option::is_some).await.map(|code| *code);
        code.ok().flatten().unwrap_or(UNKNOWN_EXIT_CODE)
    }
}

/// Handle to one running workload.
#[async_trait]
pub trait ContainerProcess: Send + Sync {
    /// Host pid of the main process, if meaningful for this backend.
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Completion signal.
    fn done(&self) -> ExitSignal;

    /// Blocks until the workload terminates and returns its exit code.
    async fn wait(&self) -> i64 {
        self.done().wait().await
    }

    /// Best-effort termination request.
    fn signal(&self);

    /// Forced termination. Defaults to [`signal`](Self::signal).
    fn kill(&self) {
        self.signal();
    }

    /// Suspends the workload.
    async fn pause(&self) -> Result<()> {
        Err(CoreError::NotImplemented(
            "pause is not supported by this backend".to_string(),
        ))
    }

    /// Resumes a paused workload.
    async fn unpause(&self) -> Result<()> {
        Err(CoreError::NotImplemented(
            "unpause is not supported by this backend".to_string(),
        ))
    }

    /// Releases all resources held for the workload.
    async fn close(&self);

    /// The ring receiving the workload's merged output.
    fn log_ring(&self) -> &Arc<LogRing>;

    /// Snapshot of retained output.
    fn log_bytes(&self) -> Bytes {
        self.log_ring().snapshot()
    }

    /// Subscribes to live output.
    fn subscribe(&self, id: &str) -> LogSubscription {
        self.log_ring().subscribe(id)
    }

    /// Drops a subscriber.
    fn unsubscribe(&self, id: &str) {
        self.log_ring().unsubscribe(id);
    }

    /// Sink for the workload's stdin, if it is still available.
    fn stdin_writer(&self) -> Option<BoxWriter>;

    /// Runs a one-shot command inside the workload and returns its exit code.
    async fn run_exec(
        &self,
        cancel: CancellationToken,
        request: ExecRequest,
        io: ExecIo,
    ) -> Result<i64>;

    /// Runs an interactive shell inside the workload.
    async fn run_interactive_shell(
        &self,
        cancel: CancellationToken,
        env: Vec<String>,
        io: ExecIo,
    ) -> Result<i64>;

    /// Resource usage sample.
    fn stats(&self) -> ProcessStats;

    /// Processes running inside the workload.
    fn top(&self) -> Vec<ProcessTopEntry>;

    /// When the workload started.
    fn start_time(&self) -> DateTime<Utc>;

    /// Root filesystem path, for backends that have one.
    fn root_path(&self) -> Option<PathBuf>;
}

/// Creates container processes for a backend.
///
/// One factory is shared process-wide. It is created at startup and closed at
/// shutdown.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    /// Short driver name reported in `/info`.
    fn name(&self) -> &str;

    /// Launches a workload writing its output to `logs`.
    async fn spawn(&self, spec: LaunchSpec, logs: Arc<LogRing>)
        -> Result<Arc<dyn ContainerProcess>>;

    /// Whether `cmd` should run through the interactive-shell path when a TTY
    /// is requested.
    fn is_shell_command(&self, cmd: &[String]) -> bool {
        is_shell_invocation(cmd)
    }

    /// Releases process-wide resources.
    async fn close(&self) {}
}

const SHELLS: &[&str] = &["sh", "bash", "ash", "/bin/sh", "/bin/bash", "/bin/ash", "/usr/bin/bash"];

/// Recognizes bare shells and `shell -c ...` / `shell -i` invocations.
#[must_use]
pub fn is_shell_invocation(cmd: &[String]) -> bool {
    match cmd {
        [shell] => SHELLS.contains(&shell.as_str()),
        [shell, flag, ..] => {
            SHELLS.contains(&shell.as_str()) && matches!(flag.as_str(), "-c" | "-i" | "-l")
        }
        [] => false,
    }
}
