//! Host-process factory.
//!
//! Runs each workload as a host process in its own process group. Used when
//! the sandbox is disabled and for tests. Images are accepted but not
//! unpacked: the command runs against the host filesystem.

use crate::error::{CoreError, Result};
use crate::logs::LogRing;
use crate::process::{
    BoxReader, BoxWriter, ContainerProcess, ExecIo, ExecRequest, ExitNotifier, ExitSignal,
    LaunchSpec, ProcessFactory, ProcessStats, ProcessTopEntry, UNKNOWN_EXIT_CODE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// `PATH` every workload starts from.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exit code for a command that could not be found.
pub const COMMAND_NOT_FOUND_EXIT_CODE: i64 = 127;

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_BUF_SIZE: usize = 8 * 1024;

/// Factory running workloads as host processes.
#[derive(Debug, Default)]
pub struct SystemProcessFactory;

impl SystemProcessFactory {
    /// Creates the factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn build_command(argv: &[String], env: &[String], working_dir: Option<&str>) -> Result<Command> {
    let Some((program, args)) = argv.split_first() else {
        return Err(CoreError::validation("No command specified"));
    };
    let mut command = Command::new(program);
    command.args(args).env_clear().env("PATH", DEFAULT_PATH);
    for entry in env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                command.env(key, value);
            }
            _ => {}
        }
    }
    if let Some(dir) = working_dir.filter(|d| Path::new(d).is_dir()) {
        command.current_dir(dir);
    }
    command.process_group(0).kill_on_drop(true);
    Ok(command)
}

fn exit_code(status: ExitStatus) -> i64 {
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|sig| 128 + i64::from(sig)))
        .unwrap_or(UNKNOWN_EXIT_CODE)
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        if err != nix::errno::Errno::ESRCH {
            tracing::debug!(pid, ?signal, error = %err, "signal delivery failed");
        }
    }
}

fn drain_into_ring<R>(mut reader: R, ring: Arc<LogRing>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => ring.append(&buf[..n]),
            }
        }
    })
}

/// Copies `reader` into `writer`. Once the writer fails the rest of the
/// input is discarded so the child never blocks on a full pipe.
async fn relay<R, W>(reader: Option<R>, writer: &mut W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let Some(mut reader) = reader else {
        return;
    };
    if tokio::io::copy(&mut reader, writer).await.is_err() {
        let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    }
    let _ = writer.flush().await;
}

/// Writes both readers into one writer in arrival order.
async fn relay_merged<A, B, W>(a: Option<A>, b: Option<B>, writer: &mut W)
where
    A: AsyncRead + Unpin,
    B: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let left = futures::stream::iter(a).flat_map(ReaderStream::new);
    let right = futures::stream::iter(b).flat_map(ReaderStream::new);
    let mut merged = futures::stream::select(left, right);
    let mut writable = true;
    while let Some(chunk) = merged.next().await {
        if let (true, Ok(chunk)) = (writable, chunk) {
            writable = writer.write_all(&chunk).await.is_ok();
        }
    }
    let _ = writer.flush().await;
}

#[async_trait]
impl ProcessFactory for SystemProcessFactory {
    fn name(&self) -> &str {
        "system"
    }

    async fn spawn(&self, spec: LaunchSpec, logs: Arc<LogRing>) -> Result<Arc<dyn ContainerProcess>> {
        let mut command = build_command(&spec.command, &spec.env, spec.working_dir.as_deref())?;
        command
            .stdin(if spec.open_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::validation(format!(
                    "exec: \"{}\": executable file not found in $PATH",
                    spec.command[0]
                ))
            } else {
                CoreError::Io(err)
            }
        })?;
        let pid = child.id();
        tracing::debug!(container = %spec.container_id, pid, command = ?spec.command, "process spawned");

        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|s| drain_into_ring(s, Arc::clone(&logs))),
            child.stderr.take().map(|s| drain_into_ring(s, Arc::clone(&logs))),
        ]
        .into_iter()
        .flatten()
        .collect();
        let stdin = child.stdin.take();

        let notifier = ExitNotifier::new();
        let exit = notifier.signal();
        let container_id = spec.container_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(err) => {
                    tracing::warn!(container = %container_id, error = %err, "wait on process failed");
                    UNKNOWN_EXIT_CODE
                }
            };
            let drained = tokio::time::timeout(
                OUTPUT_DRAIN_TIMEOUT,
                futures::future::join_all(readers),
            )
            .await;
            if drained.is_err() {
                tracing::debug!(container = %container_id, "output still open after exit, dropping remainder");
            }
            notifier.notify(code);
        });

        Ok(Arc::new(SystemProcess {
            pid,
            exit,
            ring: logs,
            stdin: Mutex::new(stdin),
            started: Utc::now(),
            command_line: spec.command.join(" "),
            execs: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

/// A workload running as a host process group.
pub struct SystemProcess {
    pid: Option<u32>,
    exit: ExitSignal,
    ring: Arc<LogRing>,
    stdin: Mutex<Option<ChildStdin>>,
    started: DateTime<Utc>,
    command_line: String,
    execs: Arc<Mutex<HashMap<u32, String>>>,
}

impl SystemProcess {
    async fn run_child(
        &self,
        mut command: Command,
        display: &[String],
        io: ExecIo,
        merge_stderr: bool,
        cancel: CancellationToken,
    ) -> Result<i64> {
        let ExecIo {
            stdin,
            mut stdout,
            mut stderr,
        } = io;
        command
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let program = display.first().map_or("", String::as_str);
                let message = format!("exec: \"{program}\": executable file not found in $PATH\n");
                let sink = if merge_stderr { &mut stdout } else { &mut stderr };
                let _ = sink.write_all(message.as_bytes()).await;
                let _ = sink.flush().await;
                return Ok(COMMAND_NOT_FOUND_EXIT_CODE);
            }
            Err(err) => return Err(err.into()),
        };

        let pid = child.id();
        if let Some(pid) = pid {
            lock(&self.execs).insert(pid, display.join(" "));
        }
        let feeder = match (stdin, child.stdin.take()) {
            (Some(source), Some(sink)) => Some(tokio::spawn(feed_stdin(source, sink))),
            _ => None,
        };
        let child_out = child.stdout.take();
        let child_err = child.stderr.take();

        let outcome = {
            let output = async {
                if merge_stderr {
                    relay_merged(child_out, child_err, &mut stdout).await;
                } else {
                    tokio::join!(relay(child_out, &mut stdout), relay(child_err, &mut stderr));
                }
            };
            let run = async {
                let (status, ()) = tokio::join!(child.wait(), output);
                status
            };
            tokio::pin!(run);
            tokio::select! {
                status = &mut run => status,
                () = cancel.cancelled() => {
                    signal_group(pid, Signal::SIGKILL);
                    run.await
                }
            }
        };

        if let Some(feeder) = feeder {
            feeder.abort();
        }
        if let Some(pid) = pid {
            lock(&self.execs).remove(&pid);
        }
        let _ = stdout.shutdown().await;
        let _ = stderr.shutdown().await;
        Ok(exit_code(outcome?))
    }
}

async fn feed_stdin(mut source: BoxReader, mut sink: ChildStdin) {
    let _ = tokio::io::copy(&mut source, &mut sink).await;
    let _ = sink.shutdown().await;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ContainerProcess for SystemProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn done(&self) -> ExitSignal {
        self.exit.clone()
    }

    fn signal(&self) {
        if !self.exit.is_done() {
            signal_group(self.pid, Signal::SIGTERM);
        }
    }

    fn kill(&self) {
        signal_group(self.pid, Signal::SIGKILL);
    }

    async fn close(&self) {
        // Reap stragglers left in the group by the main process.
        signal_group(self.pid, Signal::SIGKILL);
        lock(&self.stdin).take();
    }

    fn log_ring(&self) -> &Arc<LogRing> {
        &self.ring
    }

    fn stdin_writer(&self) -> Option<BoxWriter> {
        lock(&self.stdin)
            .take()
            .map(|stdin| Box::new(stdin) as BoxWriter)
    }

    async fn run_exec(
        &self,
        cancel: CancellationToken,
        request: ExecRequest,
        io: ExecIo,
    ) -> Result<i64> {
        let command = build_command(&request.cmd, &request.env, request.working_dir.as_deref())?;
        self.run_child(command, &request.cmd, io, false, cancel).await
    }

    async fn run_interactive_shell(
        &self,
        cancel: CancellationToken,
        env: Vec<String>,
        io: ExecIo,
    ) -> Result<i64> {
        let argv = vec!["/bin/sh".to_string()];
        let command = build_command(&argv, &env, None)?;
        self.run_child(command, &argv, io, true, cancel).await
    }

    fn stats(&self) -> ProcessStats {
        let Some(pid) = self.pid.filter(|_| !self.exit.is_done()) else {
            return ProcessStats::default();
        };
        let system = sysinfo::System::new_all();
        let main = sysinfo::Pid::from_u32(pid);
        let Some(process) = system.process(main) else {
            return ProcessStats::default();
        };
        let children = system
            .processes()
            .values()
            .filter(|p| p.parent() == Some(main))
            .count();
        ProcessStats {
            memory_usage: process.memory(),
            cpu_nanos: process.run_time().saturating_mul(1_000_000_000),
            pids: 1 + children as u64,
        }
    }

    fn top(&self) -> Vec<ProcessTopEntry> {
        let mut entries: Vec<ProcessTopEntry> = self
            .pid
            .filter(|_| !self.exit.is_done())
            .map(|pid| ProcessTopEntry {
                pid,
                command: self.command_line.clone(),
            })
            .into_iter()
            .collect();
        let mut execs: Vec<ProcessTopEntry> = lock(&self.execs)
            .iter()
            .map(|(pid, command)| ProcessTopEntry {
                pid: *pid,
                command: command.clone(),
            })
            .collect();
        execs.sort_by_key(|e| e.pid);
        entries.extend(execs);
        entries
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.started
    }

    fn root_path(&self) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{output_channel, RawWriter};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    async fn spawn(cmd: &[&str], env: &[&str]) -> Arc<dyn ContainerProcess> {
        let spec = LaunchSpec {
            container_id: "t".into(),
            image: "alpine".into(),
            command: argv(cmd),
            env: argv(env),
            ..LaunchSpec::default()
        };
        SystemProcessFactory::new()
            .spawn(spec, Arc::new(LogRing::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn output_lands_in_ring_before_exit_resolves() {
        let process = spawn(&["sh", "-c", "echo hi; echo err >&2; exit 3"], &[]).await;
        assert_eq!(process.wait().await, 3);
        let logs = process.log_bytes();
        let text = String::from_utf8_lossy(&logs);
        assert!(text.contains("hi\n"));
        assert!(text.contains("err\n"));
    }

    #[tokio::test]
    async fn container_env_is_visible() {
        let process = spawn(&["sh", "-c", "echo $GREETING"], &["GREETING=hello"]).await;
        assert_eq!(process.wait().await, 0);
        assert_eq!(&process.log_bytes()[..], b"hello\n");
    }

    #[tokio::test]
    async fn signal_terminates_with_128_plus_signal() {
        let process = spawn(&["sleep", "30"], &[]).await;
        process.signal();
        assert_eq!(process.wait().await, 143);
    }

    #[tokio::test]
    async fn kill_overrides_ignored_term() {
        let process = spawn(&["sh", "-c", "trap '' TERM; sleep 30"], &[]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        process.signal();
        let waited = tokio::time::timeout(Duration::from_millis(300), process.wait()).await;
        assert!(waited.is_err());
        process.kill();
        assert_eq!(process.wait().await, 137);
    }

    #[tokio::test]
    async fn missing_program_fails_launch() {
        let spec = LaunchSpec {
            command: argv(&["definitely-not-a-real-binary"]),
            ..LaunchSpec::default()
        };
        let err = SystemProcessFactory::new()
            .spawn(spec, Arc::new(LogRing::default()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn exec_separates_streams_and_reports_code() {
        let process = spawn(&["sleep", "30"], &[]).await;
        let (out_tx, mut out_rx) = output_channel();
        let (err_tx, mut err_rx) = output_channel();
        let io = ExecIo {
            stdin: None,
            stdout: Box::new(RawWriter::new(out_tx)),
            stderr: Box::new(RawWriter::new(err_tx)),
        };
        let request = ExecRequest {
            cmd: argv(&["sh", "-c", "echo out; echo err >&2; exit 4"]),
            ..ExecRequest::default()
        };
        let code = process.run_exec(CancellationToken::new(), request, io).await.unwrap();
        assert_eq!(code, 4);

        let mut out = Vec::new();
        while let Some(chunk) = out_rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        let mut err = Vec::new();
        while let Some(chunk) = err_rx.recv().await {
            err.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
        process.kill();
    }

    #[tokio::test]
    async fn exec_of_unknown_program_exits_127() {
        let process = spawn(&["sleep", "30"], &[]).await;
        let request = ExecRequest {
            cmd: argv(&["no-such-program-here"]),
            ..ExecRequest::default()
        };
        let code = process
            .run_exec(CancellationToken::new(), request, ExecIo::detached())
            .await
            .unwrap();
        assert_eq!(code, COMMAND_NOT_FOUND_EXIT_CODE);
        process.kill();
    }

    #[tokio::test]
    async fn cancelled_exec_is_killed() {
        let process = spawn(&["sleep", "30"], &[]).await;
        let cancel = CancellationToken::new();
        let request = ExecRequest {
            cmd: argv(&["sleep", "30"]),
            ..ExecRequest::default()
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let code = process.run_exec(cancel, request, ExecIo::detached()).await.unwrap();
        assert_eq!(code, 137);
        process.kill();
    }

    #[tokio::test]
    async fn top_lists_main_process() {
        let process = spawn(&["sleep", "30"], &[]).await;
        let top = process.top();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].command, "sleep 30");
        process.kill();
        process.wait().await;
        assert!(process.top().is_empty());
    }
}
