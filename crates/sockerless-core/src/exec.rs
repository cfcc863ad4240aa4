//! Exec instance management.
//!
//! Exec instances are registered against a running container and executed
//! later by [`ExecManager::start`]. Records stay in the store until their
//! parent container is removed.

use crate::error::{CoreError, Result};
use crate::id::generate_id;
use crate::process::{ContainerProcess, ExecIo, ExecRequest, ProcessFactory, UNKNOWN_EXIT_CODE};
use crate::state::ContainerState;
use crate::store::{ExecCell, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Exec creation parameters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecConfig {
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Additional `KEY=VALUE` pairs, applied over the container env.
    pub env: Vec<String>,
    /// Working directory; falls back to the container's.
    pub working_dir: Option<String>,
    /// Allocate a TTY.
    pub tty: bool,
    /// Attach stdin.
    pub attach_stdin: bool,
    /// Attach stdout.
    pub attach_stdout: bool,
    /// Attach stderr.
    pub attach_stderr: bool,
    /// Run as user. Recorded only.
    pub user: Option<String>,
}

/// Exec instance record.
#[derive(Debug, Clone, Serialize)]
pub struct ExecInstance {
    /// 64-hex id.
    pub id: String,
    /// Parent container id.
    pub container_id: String,
    /// Creation parameters.
    pub config: ExecConfig,
    /// Whether `start` has been called.
    pub started: bool,
    /// Whether the command is currently running.
    pub running: bool,
    /// Exit code, once finished.
    pub exit_code: Option<i64>,
    /// Pid, when the backend reports one.
    pub pid: Option<u32>,
    /// Creation time.
    pub created: DateTime<Utc>,
}

impl ExecInstance {
    /// Creates an unstarted instance.
    #[must_use]
    pub fn new(container_id: String, config: ExecConfig) -> Self {
        Self {
            id: generate_id(),
            container_id,
            config,
            started: false,
            running: false,
            exit_code: None,
            pid: None,
            created: Utc::now(),
        }
    }
}

/// Merges exec env over container env. Later keys win; order follows first
/// appearance.
#[must_use]
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + overrides.len());
    for entry in base.iter().chain(overrides) {
        let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
        match merged
            .iter_mut()
            .find(|e| e.split_once('=').map_or(e.as_str(), |(k, _)| k) == key)
        {
            Some(slot) => slot.clone_from(entry),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// Exec manager.
pub struct ExecManager {
    store: Arc<Store>,
    factory: Option<Arc<dyn ProcessFactory>>,
}

impl ExecManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<Store>, factory: Option<Arc<dyn ProcessFactory>>) -> Self {
        Self { store, factory }
    }

    /// Registers an exec instance. The container must be running.
    ///
    /// # Errors
    ///
    /// Fails with not found, or a state conflict if the container is not
    /// running.
    pub fn create(&self, container: &str, config: ExecConfig) -> Result<ExecInstance> {
        if config.cmd.is_empty() {
            return Err(CoreError::validation("No exec command specified"));
        }
        let cell = self.store.get_container(container)?;
        match cell.current_state() {
            ContainerState::Running => {}
            ContainerState::Paused => {
                return Err(CoreError::state_conflict(format!(
                    "Container {container} is paused, unpause the container before exec"
                )))
            }
            _ => return Err(CoreError::not_running(container)),
        }
        let instance = ExecInstance::new(cell.id().to_string(), config);
        let snapshot = instance.clone();
        self.store.put_exec(instance)?;
        tracing::debug!(exec = %snapshot.id, container = %cell.id(), "exec created");
        Ok(snapshot)
    }

    /// Returns the last recorded state of an exec instance.
    ///
    /// # Errors
    ///
    /// Fails with not found if the exec or its parent is gone.
    pub fn inspect(&self, exec_id: &str) -> Result<ExecInstance> {
        Ok(self.store.get_exec(exec_id)?.snapshot())
    }

    /// Claims an exec instance for execution.
    ///
    /// Checks run against the container's state at this moment; the
    /// returned [`PreparedExec`] then runs regardless of later transitions.
    ///
    /// # Errors
    ///
    /// Fails if the exec was already started, if the container is not
    /// running, or if no factory is configured. A failed prepare leaves the
    /// exec startable.
    pub fn prepare(&self, exec_id: &str) -> Result<PreparedExec> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| CoreError::FactoryUnavailable("no process factory configured".into()))?;
        let exec_cell = self.store.get_exec(exec_id)?;
        let already_started = || {
            CoreError::state_conflict(format!("exec {exec_id} has already been started"))
        };
        let (container_id, config) = {
            let exec = exec_cell.lock();
            if exec.started {
                return Err(already_started());
            }
            (exec.container_id.clone(), exec.config.clone())
        };
        let cell = self
            .store
            .container_by_id(&container_id)
            .ok_or_else(|| CoreError::exec_not_found(exec_id))?;
        let (process, container_env, container_dir) = {
            let state = cell.lock();
            match (&state.process, state.record.state) {
                (Some(process), ContainerState::Running) => (
                    Arc::clone(process),
                    state.record.config.env.clone(),
                    state.record.config.working_dir.clone(),
                ),
                _ => return Err(CoreError::not_running(&container_id)),
            }
        };
        {
            let mut exec = exec_cell.lock();
            if exec.started {
                return Err(already_started());
            }
            exec.started = true;
            exec.running = true;
        }

        let env = merge_env(&container_env, &config.env);
        let mode = if config.tty && factory.is_shell_command(&config.cmd) {
            ExecMode::Shell(env)
        } else {
            ExecMode::Command(ExecRequest {
                cmd: config.cmd,
                env,
                working_dir: config.working_dir.or(container_dir),
            })
        };
        Ok(PreparedExec {
            id: exec_id.to_string(),
            cell: exec_cell,
            process,
            mode,
        })
    }

    /// Runs an exec instance to completion, splicing `io` to the command.
    ///
    /// # Errors
    ///
    /// See [`prepare`](Self::prepare) and [`PreparedExec::run`].
    pub async fn start(&self, exec_id: &str, io: ExecIo, cancel: CancellationToken) -> Result<i64> {
        self.prepare(exec_id)?.run(io, cancel).await
    }

    /// Accepts a TTY resize for an existing exec. The core has no PTY, so
    /// this only validates the id.
    ///
    /// # Errors
    ///
    /// Fails with not found.
    pub fn resize(&self, exec_id: &str, _height: u16, _width: u16) -> Result<()> {
        self.store.get_exec(exec_id).map(|_| ())
    }
}

enum ExecMode {
    Command(ExecRequest),
    Shell(Vec<String>),
}

/// An exec instance claimed by [`ExecManager::prepare`].
pub struct PreparedExec {
    id: String,
    cell: Arc<ExecCell>,
    process: Arc<dyn ContainerProcess>,
    mode: ExecMode,
}

impl std::fmt::Debug for PreparedExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedExec")
            .field("id", &self.id)
            .field("shell", &matches!(self.mode, ExecMode::Shell(_)))
            .finish_non_exhaustive()
    }
}

impl PreparedExec {
    /// Exec id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the command. `running` and `exit_code` are updated together when
    /// it finishes; a factory error records exit code -1.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error.
    pub async fn run(self, io: ExecIo, cancel: CancellationToken) -> Result<i64> {
        let outcome = match self.mode {
            ExecMode::Shell(env) => self.process.run_interactive_shell(cancel, env, io).await,
            ExecMode::Command(request) => self.process.run_exec(cancel, request, io).await,
        };

        let mut exec = self.cell.lock();
        exec.running = false;
        match outcome {
            Ok(code) => {
                exec.exit_code = Some(code);
                tracing::debug!(exec = %self.id, exit_code = code, "exec finished");
                Ok(code)
            }
            Err(err) => {
                exec.exit_code = Some(UNKNOWN_EXIT_CODE);
                tracing::warn!(exec = %self.id, error = %err, "exec failed");
                Err(err)
            }
        }
    }
}
