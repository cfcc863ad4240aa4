//! Container lifecycle engine.
//!
//! Drives containers through `created -> running -> exited -> (removed)`,
//! owns the process handle and log ring of each run, and fans log bytes out
//! to attach and logs readers.

use crate::error::{CoreError, Result};
use crate::event::Event;
use crate::filter::ContainerFilter;
use crate::id::{canonical_name, generate_id, generate_name, is_valid_name, short_id};
use crate::image::Image;
use crate::logs::{render_entries, LogRenderOptions, LogRing};
use crate::process::{
    BoxWriter, ContainerProcess, LaunchSpec, ProcessFactory, ProcessStats, ProcessTopEntry,
    KILLED_EXIT_CODE,
};
use crate::state::{restart_delay, Container, ContainerConfig, ContainerState, RestartPolicy};
use crate::store::{ContainerCell, StatusEvent, Store};
use bytes::Bytes;
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle timing and buffering parameters.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Bytes retained per container log ring.
    pub ring_capacity: usize,
    /// Grace period for `stop` when the client gives none.
    pub default_stop_timeout: Duration,
    /// How long to wait for exit after a forced kill.
    pub kill_grace: Duration,
    /// How long attach waits for a created container to start.
    pub attach_start_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ring_capacity: crate::logs::DEFAULT_RING_CAPACITY,
            default_stop_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(500),
            attach_start_timeout: Duration::from_secs(10),
        }
    }
}

/// Snapshot for rolling back a start transition.
#[derive(Debug)]
pub struct StartTicket {
    generation: u64,
}

/// Result of a start transition attempt.
#[derive(Debug)]
pub enum StartOutcome {
    /// The caller owns the start and must finish or fail it.
    Started(StartTicket),
    /// Container is already running.
    AlreadyRunning,
    /// Another caller is starting the container.
    AlreadyStarting,
}

/// What `start` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// A new process was launched.
    Started,
    /// The container was already running; nothing changed.
    AlreadyRunning,
}

/// Condition for `wait`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitCondition {
    /// Until the container is in a terminal state.
    #[default]
    NotRunning,
    /// Until the next exit, even if currently exited.
    NextExit,
    /// Until the container is removed.
    Removed,
}

impl WaitCondition {
    /// Parses the Docker query value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "not-running" => Some(Self::NotRunning),
            "next-exit" => Some(Self::NextExit),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// How `kill` terminates a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Polite termination (SIGTERM and friends).
    Terminate,
    /// Immediate termination (SIGKILL).
    Kill,
}

impl KillSignal {
    /// Parses a Docker signal name or number. Missing means SIGKILL.
    #[must_use]
    pub fn parse(signal: Option<&str>) -> Option<Self> {
        let Some(raw) = signal.filter(|s| !s.is_empty()) else {
            return Some(Self::Kill);
        };
        let name = raw.to_ascii_uppercase();
        let name = name.strip_prefix("SIG").unwrap_or(&name);
        match name {
            "KILL" | "9" => Some(Self::Kill),
            "TERM" | "15" | "INT" | "2" | "HUP" | "1" | "QUIT" | "3" | "USR1" | "10" | "USR2"
            | "12" => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// Removes a log subscriber when dropped.
#[derive(Debug)]
pub struct SubscriptionGuard {
    ring: Weak<LogRing>,
    id: String,
}

impl SubscriptionGuard {
    /// Subscriber id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(ring) = self.ring.upgrade() {
            ring.unsubscribe(&self.id);
        }
    }
}

/// A live output stream: retained bytes, then everything emitted after.
#[derive(Debug)]
pub struct OutputStream {
    /// Whether the container uses a TTY (raw output, no framing).
    pub tty: bool,
    /// Bytes to send first.
    pub replay: Bytes,
    /// Live bytes; `None` when no further output can arrive.
    pub live: Option<mpsc::UnboundedReceiver<Bytes>>,
    /// Keeps the subscription registered.
    pub guard: Option<SubscriptionGuard>,
}

/// An attach session.
pub struct AttachSession {
    /// Output to relay to the client.
    pub output: OutputStream,
    /// The workload's stdin, when requested and available.
    pub stdin: Option<BoxWriter>,
}

impl std::fmt::Debug for AttachSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachSession")
            .field("output", &self.output)
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}

/// Options for a logs request.
#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    /// Keep streaming new output.
    pub follow: bool,
    /// Rendering of retained output.
    pub render: LogRenderOptions,
}

/// Container manager.
pub struct ContainerManager {
    store: Arc<Store>,
    factory: Option<Arc<dyn ProcessFactory>>,
    config: LifecycleConfig,
    closing: CancellationToken,
}

impl ContainerManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        factory: Option<Arc<dyn ProcessFactory>>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            factory,
            config,
            closing: CancellationToken::new(),
        }
    }

    /// Lifecycle parameters.
    #[must_use]
    pub const fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn launcher(&self) -> Launcher {
        Launcher {
            store: Arc::clone(&self.store),
            factory: self.factory.clone(),
            ring_capacity: self.config.ring_capacity,
            closing: self.closing.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Create / inspect / list
    // ------------------------------------------------------------------

    /// Creates a container in the `created` state.
    ///
    /// Unknown image references are registered on the fly.
    ///
    /// # Errors
    ///
    /// Fails with a validation error for a missing image, empty command or
    /// bad name, and with a name conflict for a duplicate name.
    pub fn create(&self, config: ContainerConfig, name: Option<&str>) -> Result<Container> {
        if config.image.trim().is_empty() {
            return Err(CoreError::validation("Config cannot be empty in order to create a container: Image is required"));
        }
        if config.command().is_empty() {
            return Err(CoreError::validation("No command specified"));
        }
        let name = match name.filter(|n| !n.is_empty()) {
            Some(n) if !is_valid_name(n) => {
                return Err(CoreError::validation(format!(
                    "Invalid container name ({n}), only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed"
                )))
            }
            Some(n) => canonical_name(n),
            None => generate_name(),
        };
        let image = match self.store.get_image(&config.image) {
            Ok(image) => image,
            Err(err) if err.is_not_found() => self.store.put_image(Image::from_reference(&config.image)),
            Err(err) => return Err(err),
        };

        let container = Container::new(generate_id(), name, image.id, config);
        let cell = self.store.put_container(container)?;
        let snapshot = cell.snapshot();
        tracing::info!(container = %snapshot.id, name = %snapshot.name, image = %snapshot.config.image, "container created");
        self.store.events().publish(
            Event::container("create", &snapshot.id, &snapshot.name)
                .with_attribute("image", snapshot.config.image.clone()),
        );
        Ok(snapshot)
    }

    /// Returns a container record.
    ///
    /// # Errors
    ///
    /// Fails with not found.
    pub fn inspect(&self, reference: &str) -> Result<Container> {
        Ok(self.store.get_container(reference)?.snapshot())
    }

    /// Lists containers. Without `all`, only running containers are returned
    /// unless the filter names states explicitly.
    #[must_use]
    pub fn list(&self, filter: &ContainerFilter, all: bool, limit: Option<usize>) -> Vec<Container> {
        let mut containers = self.store.list_containers(filter);
        if !all && !filter.has_state_filter() {
            containers.retain(|c| c.state == ContainerState::Running);
        }
        if let Some(limit) = limit.filter(|l| *l > 0) {
            containers.truncate(limit);
        }
        containers
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Starts a container. Starting a running container is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with a state conflict for paused or removing containers, with
    /// factory unavailable when no factory is configured, or with the
    /// factory's launch error. A failed launch leaves the state unchanged.
    pub async fn start(&self, reference: &str) -> Result<StartResult> {
        let cell = self.store.get_container(reference)?;
        let ticket = match Self::begin_start(&cell)? {
            StartOutcome::Started(ticket) => ticket,
            StartOutcome::AlreadyRunning | StartOutcome::AlreadyStarting => {
                return Ok(StartResult::AlreadyRunning)
            }
        };

        self.launcher().launch(&cell, ticket).await?;
        Ok(StartResult::Started)
    }

    /// Claims the start of a container.
    ///
    /// # Errors
    ///
    /// Fails with a state conflict for paused, restarting or removing
    /// containers.
    pub fn begin_start(cell: &ContainerCell) -> Result<StartOutcome> {
        let mut state = cell.lock();
        match state.record.state {
            ContainerState::Running => Ok(StartOutcome::AlreadyRunning),
            ContainerState::Created | ContainerState::Exited | ContainerState::Dead => {
                if state.starting {
                    return Ok(StartOutcome::AlreadyStarting);
                }
                state.starting = true;
                Ok(StartOutcome::Started(StartTicket {
                    generation: state.generation,
                }))
            }
            ContainerState::Paused => Err(CoreError::state_conflict(format!(
                "cannot start a paused container {}, try unpause instead",
                short_id(cell.id())
            ))),
            other => Err(CoreError::state_conflict(format!(
                "cannot start container {} in state {other}",
                short_id(cell.id())
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Stop / kill / restart / pause
    // ------------------------------------------------------------------

    fn running_process(
        cell: &ContainerCell,
        reference: &str,
    ) -> Result<(Option<Arc<dyn ContainerProcess>>, u64)> {
        let state = cell.lock();
        if state.record.state.is_active() {
            Ok((state.process.clone(), state.generation))
        } else {
            Err(CoreError::not_running(reference))
        }
    }

    /// Stops a container: requests termination, waits up to `timeout`, then
    /// kills it. Returns once the exit is recorded.
    ///
    /// # Errors
    ///
    /// Fails with not found, or a state conflict if it is not running.
    pub async fn stop(&self, reference: &str, timeout: Option<Duration>) -> Result<i64> {
        let cell = self.store.get_container(reference)?;
        let (process, generation) = Self::running_process(&cell, reference)?;
        let timeout = timeout.unwrap_or(self.config.default_stop_timeout);
        let code = self.terminate(&cell, process, generation, timeout).await;
        self.store.events().publish(container_event("stop", &cell));
        Ok(code)
    }

    async fn terminate(
        &self,
        cell: &Arc<ContainerCell>,
        process: Option<Arc<dyn ContainerProcess>>,
        generation: u64,
        timeout: Duration,
    ) -> i64 {
        request_stop(cell, generation);
        let Some(process) = process else {
            record_exit(&self.store, cell, generation, KILLED_EXIT_CODE).await;
            return KILLED_EXIT_CODE;
        };
        let done = process.done();
        process.signal();
        let code = match tokio::time::timeout(timeout, done.wait()).await {
            Ok(code) => code,
            Err(_) => {
                tracing::info!(container = %cell.id(), ?timeout, "stop grace expired, killing");
                process.kill();
                match tokio::time::timeout(self.config.kill_grace, done.wait()).await {
                    Ok(code) => code,
                    Err(_) => {
                        tracing::warn!(container = %cell.id(), "process did not exit after kill");
                        KILLED_EXIT_CODE
                    }
                }
            }
        };
        record_exit(&self.store, cell, generation, code).await;
        cell.snapshot().exit_code.unwrap_or(code)
    }

    /// Sends a signal to a running container.
    ///
    /// `Kill` records exit code 137 immediately; `Terminate` only requests
    /// termination.
    ///
    /// # Errors
    ///
    /// Fails with not found, or a state conflict if it is not running.
    pub async fn kill(&self, reference: &str, signal: KillSignal) -> Result<()> {
        let cell = self.store.get_container(reference)?;
        let (process, generation) = Self::running_process(&cell, reference)?;
        request_stop(&cell, generation);
        match (signal, process) {
            (KillSignal::Terminate, Some(process)) => process.signal(),
            (KillSignal::Kill, Some(process)) => {
                process.kill();
                record_exit(&self.store, &cell, generation, KILLED_EXIT_CODE).await;
            }
            (_, None) => {
                record_exit(&self.store, &cell, generation, KILLED_EXIT_CODE).await;
            }
        }
        tracing::info!(container = %cell.id(), ?signal, "container signalled");
        let signal_name = match signal {
            KillSignal::Terminate => "SIGTERM",
            KillSignal::Kill => "SIGKILL",
        };
        self.store
            .events()
            .publish(container_event("kill", &cell).with_attribute("signal", signal_name));
        Ok(())
    }

    /// Stops the container if it is running, then starts it again.
    ///
    /// # Errors
    ///
    /// Propagates stop and start failures.
    pub async fn restart(&self, reference: &str, timeout: Option<Duration>) -> Result<()> {
        let cell = self.store.get_container(reference)?;
        if let Ok((process, generation)) = Self::running_process(&cell, reference) {
            let timeout = timeout.unwrap_or(self.config.default_stop_timeout);
            self.terminate(&cell, process, generation, timeout).await;
        }
        self.start(cell.id()).await?;
        self.store.events().publish(container_event("restart", &cell));
        Ok(())
    }

    /// Pauses a running container, if the backend supports it.
    ///
    /// # Errors
    ///
    /// Fails with not implemented for backends without pause support.
    pub async fn pause(&self, reference: &str) -> Result<()> {
        let cell = self.store.get_container(reference)?;
        let process = {
            let state = cell.lock();
            match (&state.process, state.record.state) {
                (Some(p), ContainerState::Running) => Arc::clone(p),
                (_, ContainerState::Paused) => {
                    return Err(CoreError::state_conflict(format!(
                        "Container {} is already paused",
                        short_id(cell.id())
                    )))
                }
                _ => return Err(CoreError::not_running(reference)),
            }
        };
        process.pause().await?;
        {
            let mut state = cell.lock();
            if state.record.state == ContainerState::Running {
                state.record.state = ContainerState::Paused;
                cell.publish(&state);
            }
        }
        self.store.events().publish(container_event("pause", &cell));
        Ok(())
    }

    /// Resumes a paused container.
    ///
    /// # Errors
    ///
    /// Fails with a state conflict if it is not paused.
    pub async fn unpause(&self, reference: &str) -> Result<()> {
        let cell = self.store.get_container(reference)?;
        let process = {
            let state = cell.lock();
            match (&state.process, state.record.state) {
                (Some(p), ContainerState::Paused) => Arc::clone(p),
                _ => {
                    return Err(CoreError::state_conflict(format!(
                        "Container {} is not paused",
                        short_id(cell.id())
                    )))
                }
            }
        };
        process.unpause().await?;
        {
            let mut state = cell.lock();
            if state.record.state == ContainerState::Paused {
                state.record.state = ContainerState::Running;
                cell.publish(&state);
            }
        }
        self.store.events().publish(container_event("unpause", &cell));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wait / remove
    // ------------------------------------------------------------------

    /// Blocks until `condition` holds and returns the exit code.
    ///
    /// # Errors
    ///
    /// Fails with not found.
    pub async fn wait(&self, reference: &str, condition: WaitCondition) -> Result<i64> {
        let cell = self.store.get_container(reference)?;
        let mut status = cell.subscribe_status();
        let current = *status.borrow_and_update();
        let next_generation = if current.state.is_terminal() {
            current.generation + 1
        } else {
            current.generation
        };
        let reached = |event: &StatusEvent| match condition {
            WaitCondition::NotRunning => event.removed || event.state.is_terminal(),
            WaitCondition::NextExit => {
                event.removed
                    || (event.state.is_terminal() && event.generation >= next_generation)
            }
            WaitCondition::Removed => event.removed,
        };
        let waited = status.wait_for(reached).await.map(|event| *event);
        let event = match waited {
            Ok(event) => event,
            Err(_) => *status.borrow(),
        };
        Ok(event.exit_code.unwrap_or(0))
    }

    /// Removes a container. With `force`, a running container is killed
    /// first.
    ///
    /// # Errors
    ///
    /// Fails with not found, or a state conflict for a running container
    /// without `force`.
    pub async fn remove(&self, reference: &str, force: bool) -> Result<()> {
        let cell = self.store.get_container(reference)?;
        if force {
            if let Ok((process, generation)) = Self::running_process(&cell, reference) {
                self.terminate(&cell, process, generation, Duration::ZERO).await;
            }
        }
        let cell = self.store.remove_container(cell.id(), force)?;
        let (process, logs) = {
            let mut state = cell.lock();
            state.record.state = ContainerState::Removing;
            cell.publish(&state);
            (state.process.take(), state.logs.take())
        };
        if let Some(logs) = logs {
            logs.close();
        }
        if let Some(process) = process {
            process.kill();
            process.close().await;
        }
        cell.publish_removed();
        tracing::info!(container = %cell.id(), "container removed");
        self.store.events().publish(container_event("destroy", &cell));
        Ok(())
    }

    /// Removes every exited or dead container matching `filter` and returns
    /// their ids. Containers that leave the terminal state meanwhile are
    /// skipped.
    pub async fn prune(&self, filter: &ContainerFilter) -> Vec<String> {
        let candidates: Vec<String> = self
            .store
            .list_containers(filter)
            .into_iter()
            .filter(|c| c.state.is_terminal())
            .map(|c| c.id)
            .collect();
        let mut deleted = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self.remove(&id, false).await {
                Ok(()) => deleted.push(id),
                Err(err) => tracing::debug!(container = %id, error = %err, "prune skipped container"),
            }
        }
        deleted
    }

    /// Renames a container. The new name must be free.
    ///
    /// # Errors
    ///
    /// Fails with a validation error for a bad or unchanged name, not found,
    /// or a name conflict.
    pub fn rename(&self, reference: &str, name: &str) -> Result<Container> {
        if !is_valid_name(name) {
            return Err(CoreError::validation(format!(
                "Invalid container name ({name}), only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed"
            )));
        }
        let (cell, old_name) = self.store.rename_container(reference, &canonical_name(name))?;
        let renamed = cell.snapshot();
        tracing::info!(container = %renamed.id, from = %old_name, to = %renamed.name, "container renamed");
        self.store.events().publish(
            Event::container("rename", &renamed.id, &renamed.name).with_attribute("oldName", old_name),
        );
        Ok(renamed)
    }

    // ------------------------------------------------------------------
    // Attach / logs
    // ------------------------------------------------------------------

    async fn wait_until_started(&self, cell: &ContainerCell) {
        let mut status = cell.subscribe_status();
        let timed_out = tokio::time::timeout(
            self.config.attach_start_timeout,
            status.wait_for(|e| e.removed || e.state != ContainerState::Created),
        )
        .await
        .is_err();
        if timed_out {
            tracing::debug!(container = %cell.id(), "attach timed out waiting for start");
        }
    }

    /// Attaches to a container's output and, optionally, its stdin.
    ///
    /// A created container is given a bounded time to start. The retained
    /// output is replayed first.
    ///
    /// # Errors
    ///
    /// Fails with not found, or a state conflict if the container never
    /// started.
    pub async fn attach(&self, reference: &str, with_stdin: bool) -> Result<AttachSession> {
        let cell = self.store.get_container(reference)?;
        if cell.current_state() == ContainerState::Created {
            self.wait_until_started(&cell).await;
        }
        let (tty, ring, process) = {
            let state = cell.lock();
            (state.record.config.tty, state.logs.clone(), state.process.clone())
        };
        let Some(ring) = ring else {
            return Err(CoreError::not_running(reference));
        };
        let stdin = if with_stdin {
            process.as_ref().and_then(|p| p.stdin_writer())
        } else {
            None
        };
        Ok(AttachSession {
            output: subscribe_output(&ring, tty),
            stdin,
        })
    }

    /// Returns retained output, optionally followed by live output.
    ///
    /// # Errors
    ///
    /// Fails with not found.
    pub fn logs(&self, reference: &str, options: &LogsOptions) -> Result<OutputStream> {
        let cell = self.store.get_container(reference)?;
        let (tty, ring, created) = {
            let state = cell.lock();
            (
                state.record.config.tty,
                state.logs.clone(),
                state.record.state == ContainerState::Created,
            )
        };
        let follow = options.follow && options.render.until.is_none();
        let Some(ring) = ring else {
            let live = (follow && created).then(|| follow_first_run(cell, options.render.clone()));
            return Ok(OutputStream {
                tty,
                replay: Bytes::new(),
                live,
                guard: None,
            });
        };
        if !follow {
            return Ok(OutputStream {
                tty,
                replay: render_entries(&ring.entries(), &options.render),
                live: None,
                guard: None,
            });
        }
        let id = generate_id()[..16].to_string();
        let (entries, receiver) = ring.subscribe_entries(&id);
        Ok(OutputStream {
            tty,
            replay: render_entries(&entries, &options.render),
            live: Some(receiver),
            guard: Some(SubscriptionGuard {
                ring: Arc::downgrade(&ring),
                id,
            }),
        })
    }

    // ------------------------------------------------------------------
    // Top / stats
    // ------------------------------------------------------------------

    /// Lists processes inside a running container.
    ///
    /// # Errors
    ///
    /// Fails with a state conflict if it is not running.
    pub fn top(&self, reference: &str) -> Result<Vec<ProcessTopEntry>> {
        let cell = self.store.get_container(reference)?;
        match Self::running_process(&cell, reference)? {
            (Some(process), _) => Ok(process.top()),
            (None, _) => Ok(Vec::new()),
        }
    }

    /// Samples resource usage. Stopped containers report zeros.
    ///
    /// # Errors
    ///
    /// Fails with not found.
    pub fn stats(&self, reference: &str) -> Result<(Container, ProcessStats)> {
        let cell = self.store.get_container(reference)?;
        let (record, process) = {
            let state = cell.lock();
            (state.record.clone(), state.process.clone())
        };
        let stats = match process {
            Some(p) if record.state.is_active() => p.stats(),
            _ => ProcessStats::default(),
        };
        Ok((record, stats))
    }

    // ------------------------------------------------------------------
    // Recovery / shutdown
    // ------------------------------------------------------------------

    /// Inserts a reconstructed container, binding a live process handle when
    /// one is supplied for a running record.
    ///
    /// # Errors
    ///
    /// Fails with a name conflict.
    pub fn adopt(
        &self,
        container: Container,
        process: Option<Arc<dyn ContainerProcess>>,
    ) -> Result<Container> {
        let cell = self.store.put_container(container)?;
        if let Some(process) = process {
            let generation = {
                let mut state = cell.lock();
                state.generation += 1;
                state.logs = Some(Arc::clone(process.log_ring()));
                state.process = Some(Arc::clone(&process));
                state.record.pid = process.pid();
                cell.publish(&state);
                state.generation
            };
            spawn_exit_monitor(self.launcher(), Arc::clone(&cell), process, generation);
        }
        Ok(cell.snapshot())
    }

    /// Cancels pending policy restarts, then stops every active container
    /// with the default grace period.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let stops = self.store.container_cells().into_iter().filter_map(|cell| {
            let (process, generation) = Self::running_process(&cell, cell.id()).ok()?;
            Some(async move {
                self.terminate(&cell, process, generation, self.config.default_stop_timeout)
                    .await;
            })
        });
        futures::future::join_all(stops).await;
        if let Some(factory) = &self.factory {
            factory.close().await;
        }
    }
}

fn subscribe_output(ring: &Arc<LogRing>, tty: bool) -> OutputStream {
    let id = generate_id()[..16].to_string();
    let subscription = ring.subscribe(&id);
    OutputStream {
        tty,
        replay: subscription.replay,
        live: Some(subscription.receiver),
        guard: Some(SubscriptionGuard {
            ring: Arc::downgrade(ring),
            id,
        }),
    }
}

/// Launches runs for the start path and for policy restarts.
#[derive(Clone)]
struct Launcher {
    store: Arc<Store>,
    factory: Option<Arc<dyn ProcessFactory>>,
    ring_capacity: usize,
    closing: CancellationToken,
}

impl Launcher {
    /// Spawns a process for a claimed start. A failed launch releases the
    /// claim and leaves the state unchanged.
    async fn launch(&self, cell: &Arc<ContainerCell>, ticket: StartTicket) -> Result<()> {
        let Some(factory) = self.factory.clone() else {
            fail_start(cell, &ticket);
            return Err(CoreError::FactoryUnavailable(
                "no process factory configured".into(),
            ));
        };
        let spec = {
            let state = cell.lock();
            let record = &state.record;
            LaunchSpec {
                container_id: record.id.clone(),
                image: record.config.image.clone(),
                command: record.config.command(),
                env: record.config.env.clone(),
                binds: record.config.binds.clone(),
                working_dir: record.config.working_dir.clone(),
                labels: record.config.labels.clone(),
                tty: record.config.tty,
                open_stdin: record.config.open_stdin,
            }
        };
        let ring = Arc::new(LogRing::new(self.ring_capacity));

        match factory.spawn(spec, Arc::clone(&ring)).await {
            Ok(process) => {
                if self.store.container_by_id(cell.id()).is_none() {
                    process.kill();
                    process.close().await;
                    return Err(CoreError::container_not_found(cell.id()));
                }
                tracing::info!(container = %cell.id(), driver = factory.name(), "container started");
                self.finish_start(cell, &ticket, process, ring);
                Ok(())
            }
            Err(err) => {
                fail_start(cell, &ticket);
                tracing::warn!(container = %cell.id(), error = %err, "container start failed");
                Err(err)
            }
        }
    }

    fn finish_start(
        &self,
        cell: &Arc<ContainerCell>,
        ticket: &StartTicket,
        process: Arc<dyn ContainerProcess>,
        ring: Arc<LogRing>,
    ) {
        let generation = ticket.generation + 1;
        {
            let mut state = cell.lock();
            if state.record.state.is_terminal() {
                state.record.restart_count += 1;
            }
            state.record.state = ContainerState::Running;
            state.record.started_at = Some(process.start_time());
            state.record.finished_at = None;
            state.record.exit_code = None;
            state.record.pid = process.pid();
            state.process = Some(Arc::clone(&process));
            state.logs = Some(ring);
            state.generation = generation;
            state.starting = false;
            state.stop_requested = false;
            cell.publish(&state);
        }
        self.store.events().publish(container_event("start", cell));
        spawn_exit_monitor(self.clone(), Arc::clone(cell), process, generation);
    }

    /// Starts the run after `exit` once the backoff elapses, unless the
    /// container was started, removed or shut down in between.
    async fn restart_after_exit(&self, cell: Arc<ContainerCell>, exit: ExitRecord) {
        let delay = restart_delay(exit.restart_count);
        tracing::info!(container = %cell.id(), exit_code = exit.code, ?delay, "restart policy applies");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = self.closing.cancelled() => return,
        }
        let ticket = {
            let mut state = cell.lock();
            if state.generation != exit.generation
                || state.starting
                || state.record.state != ContainerState::Exited
            {
                return;
            }
            state.starting = true;
            StartTicket {
                generation: state.generation,
            }
        };
        if let Err(err) = self.launch(&cell, ticket).await {
            tracing::warn!(container = %cell.id(), error = %err, "policy restart failed");
        }
    }
}

fn fail_start(cell: &ContainerCell, ticket: &StartTicket) {
    let mut state = cell.lock();
    if state.generation == ticket.generation {
        state.starting = false;
    }
}

/// Marks run `generation` as stopped on request so its exit does not trigger
/// the restart policy.
fn request_stop(cell: &ContainerCell, generation: u64) {
    let mut state = cell.lock();
    if state.generation == generation {
        state.stop_requested = true;
    }
}

fn container_event(action: &str, cell: &ContainerCell) -> Event {
    let name = cell.lock().record.name.clone();
    Event::container(action, cell.id(), &name)
}

fn spawn_exit_monitor(
    launcher: Launcher,
    cell: Arc<ContainerCell>,
    process: Arc<dyn ContainerProcess>,
    generation: u64,
) {
    tokio::spawn(async move {
        let code = process.wait().await;
        let Some(exit) = record_exit(&launcher.store, &cell, generation, code).await else {
            return;
        };
        if exit.restart_due() {
            launcher.restart_after_exit(cell, exit).await;
        }
    });
}

/// An exit recorded by [`record_exit`].
#[derive(Debug, Clone, Copy)]
struct ExitRecord {
    code: i64,
    generation: u64,
    stop_requested: bool,
    policy: RestartPolicy,
    restart_count: u32,
}

impl ExitRecord {
    fn restart_due(&self) -> bool {
        !self.stop_requested && self.policy.should_restart(self.code, self.restart_count)
    }
}

/// Records the end of run `generation`. The first caller wins and gets the
/// record; later calls for the same run are ignored.
///
/// The exit code is stored and published before the log ring closes.
async fn record_exit(
    store: &Store,
    cell: &ContainerCell,
    generation: u64,
    code: i64,
) -> Option<ExitRecord> {
    let (process, logs, exit, name) = {
        let mut state = cell.lock();
        if state.generation != generation || !state.record.state.is_active() {
            return None;
        }
        state.record.state = ContainerState::Exited;
        state.record.exit_code = Some(code);
        state.record.finished_at = Some(Utc::now());
        state.record.pid = None;
        cell.publish(&state);
        let exit = ExitRecord {
            code,
            generation,
            stop_requested: state.stop_requested,
            policy: state.record.config.restart_policy,
            restart_count: state.record.restart_count,
        };
        (
            state.process.take(),
            state.logs.clone(),
            exit,
            state.record.name.clone(),
        )
    };
    tracing::info!(container = %cell.id(), exit_code = code, "container exited");
    store
        .events()
        .publish(Event::container("die", cell.id(), &name).with_attribute("exitCode", code.to_string()));
    if let Some(logs) = logs {
        logs.close();
    }
    if let Some(process) = process {
        process.close().await;
    }
    Some(exit)
}

/// Streams the output of a created container's first run. Ends without
/// output if the container is removed before it starts.
fn follow_first_run(
    cell: Arc<ContainerCell>,
    render: LogRenderOptions,
) -> mpsc::UnboundedReceiver<Bytes> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut status = cell.subscribe_status();
    tokio::spawn(async move {
        let started = tokio::select! {
            changed = status.wait_for(|e| e.removed || e.state != ContainerState::Created) => {
                changed.is_ok_and(|e| !e.removed)
            }
            () = tx.closed() => false,
        };
        let Some(ring) = cell.logs().filter(|_| started) else {
            return;
        };
        let id = generate_id()[..16].to_string();
        let (entries, mut receiver) = ring.subscribe_entries(&id);
        let _guard = SubscriptionGuard {
            ring: Arc::downgrade(&ring),
            id,
        };
        let replay = render_entries(&entries, &render);
        if !replay.is_empty() && tx.send(replay).is_err() {
            return;
        }
        loop {
            tokio::select! {
                chunk = receiver.recv() => match chunk {
                    Some(chunk) => {
                        if tx.send(chunk).is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                () = tx.closed() => return,
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExecIo, ExecRequest, ExitNotifier, ExitSignal};
    use crate::state::RestartPolicyName;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FakeProcess {
        notifier: ExitNotifier,
        ring: Arc<LogRing>,
        honors_term: bool,
        started: chrono::DateTime<Utc>,
    }

    #[async_trait]
    impl ContainerProcess for FakeProcess {
        fn done(&self) -> ExitSignal {
            self.notifier.signal()
        }

        fn signal(&self) {
            if self.honors_term {
                self.notifier.notify(143);
            }
        }

        fn kill(&self) {
            self.notifier.notify(KILLED_EXIT_CODE);
        }

        async fn close(&self) {}

        fn log_ring(&self) -> &Arc<LogRing> {
            &self.ring
        }

        fn stdin_writer(&self) -> Option<BoxWriter> {
            None
        }

        async fn run_exec(&self, _: CancellationToken, _: ExecRequest, _: ExecIo) -> Result<i64> {
            Ok(0)
        }

        async fn run_interactive_shell(&self, _: CancellationToken, _: Vec<String>, _: ExecIo) -> Result<i64> {
            Ok(0)
        }

        fn stats(&self) -> ProcessStats {
            ProcessStats::default()
        }

        fn top(&self) -> Vec<ProcessTopEntry> {
            Vec::new()
        }

        fn start_time(&self) -> chrono::DateTime<Utc> {
            self.started
        }

        fn root_path(&self) -> Option<PathBuf> {
            None
        }
    }

    /// Emits the command joined by spaces, then exits: `hang` never exits,
    /// `fail` exits 1 and everything else exits 0.
    struct FakeFactory {
        honors_term: bool,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ProcessFactory for FakeFactory {
        fn name(&self) -> &str {
            "fake"
        }

        async fn spawn(&self, spec: LaunchSpec, logs: Arc<LogRing>) -> Result<Arc<dyn ContainerProcess>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CoreError::internal("launch refused"));
            }
            let process = Arc::new(FakeProcess {
                notifier: ExitNotifier::new(),
                ring: Arc::clone(&logs),
                honors_term: self.honors_term,
                started: Utc::now(),
            });
            if spec.command != ["hang"] {
                logs.append(format!("{}\n", spec.command.join(" ")).as_bytes());
                process.notifier.notify(i64::from(spec.command == ["fail"]));
            }
            Ok(process)
        }
    }

    fn manager(honors_term: bool) -> ContainerManager {
        let factory = Arc::new(FakeFactory {
            honors_term,
            fail: AtomicBool::new(false),
        });
        ContainerManager::new(
            Arc::new(Store::new()),
            Some(factory as Arc<dyn ProcessFactory>),
            LifecycleConfig {
                default_stop_timeout: Duration::from_millis(50),
                kill_grace: Duration::from_millis(50),
                attach_start_timeout: Duration::from_millis(200),
                ..LifecycleConfig::default()
            },
        )
    }

    fn config(cmd: &[&str]) -> ContainerConfig {
        ContainerConfig {
            image: "alpine".into(),
            cmd: cmd.iter().map(ToString::to_string).collect(),
            ..ContainerConfig::default()
        }
    }

    #[tokio::test]
    async fn create_start_wait_records_exit() {
        let m = manager(true);
        let c = m.create(config(&["echo", "hi"]), Some("job")).unwrap();
        assert_eq!(c.state, ContainerState::Created);
        assert_eq!(m.start("job").await.unwrap(), StartResult::Started);
        assert_eq!(m.wait("job", WaitCondition::NotRunning).await.unwrap(), 0);

        let c = m.inspect("job").unwrap();
        assert_eq!(c.state, ContainerState::Exited);
        assert_eq!(c.exit_code, Some(0));
        let logs = m.logs("job", &LogsOptions::default()).unwrap();
        assert_eq!(&logs.replay[..], b"echo hi\n");
    }

    #[tokio::test]
    async fn create_validates_input() {
        let m = manager(true);
        assert!(matches!(m.create(config(&[]), None), Err(CoreError::Validation(_))));
        assert!(matches!(m.create(config(&["x"]), Some("-bad")), Err(CoreError::Validation(_))));
        m.create(config(&["hang"]), Some("dup")).unwrap();
        assert!(matches!(
            m.create(config(&["hang"]), Some("dup")),
            Err(CoreError::NameConflict { .. })
        ));
    }

    #[tokio::test]
    async fn stopped_container_keeps_its_name() {
        let m = manager(true);
        m.create(config(&["hang"]), Some("x")).unwrap();
        m.start("x").await.unwrap();
        m.stop("x", None).await.unwrap();
        assert!(matches!(
            m.create(config(&["hang"]), Some("x")),
            Err(CoreError::NameConflict { .. })
        ));

        assert_eq!(m.start("x").await.unwrap(), StartResult::Started);
        m.remove("x", true).await.unwrap();
        m.create(config(&["hang"]), Some("x")).unwrap();
    }

    #[tokio::test]
    async fn starting_running_container_is_a_no_op() {
        let m = manager(true);
        m.create(config(&["hang"]), Some("svc")).unwrap();
        assert_eq!(m.start("svc").await.unwrap(), StartResult::Started);
        assert_eq!(m.start("svc").await.unwrap(), StartResult::AlreadyRunning);
        assert_eq!(m.inspect("svc").unwrap().restart_count, 0);
    }

    #[tokio::test]
    async fn failed_launch_leaves_container_created() {
        let factory = Arc::new(FakeFactory {
            honors_term: true,
            fail: AtomicBool::new(true),
        });
        let m = ContainerManager::new(Arc::new(Store::new()), Some(factory.clone() as Arc<dyn ProcessFactory>), LifecycleConfig::default());
        m.create(config(&["hang"]), Some("f")).unwrap();
        assert!(m.start("f").await.is_err());
        assert_eq!(m.inspect("f").unwrap().state, ContainerState::Created);

        factory.fail.store(false, Ordering::SeqCst);
        assert_eq!(m.start("f").await.unwrap(), StartResult::Started);
    }

    #[tokio::test]
    async fn start_without_factory_is_unavailable() {
        let m = ContainerManager::new(Arc::new(Store::new()), None, LifecycleConfig::default());
        m.create(config(&["x"]), Some("n")).unwrap();
        assert!(matches!(m.start("n").await, Err(CoreError::FactoryUnavailable(_))));
        assert_eq!(m.inspect("n").unwrap().state, ContainerState::Created);
    }

    #[tokio::test]
    async fn stop_honored_term_keeps_its_code() {
        let m = manager(true);
        m.create(config(&["hang"]), Some("s")).unwrap();
        m.start("s").await.unwrap();
        assert_eq!(m.stop("s", None).await.unwrap(), 143);
        assert_eq!(m.inspect("s").unwrap().exit_code, Some(143));
    }

    #[tokio::test]
    async fn stop_ignoring_term_escalates_to_kill() {
        let m = manager(false);
        m.create(config(&["hang"]), Some("s")).unwrap();
        m.start("s").await.unwrap();
        assert_eq!(m.stop("s", Some(Duration::from_millis(20))).await.unwrap(), 137);
        assert!(m.stop("s", None).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn kill_records_137_and_wait_sees_it() {
        let m = manager(false);
        m.create(config(&["hang"]), Some("k")).unwrap();
        m.start("k").await.unwrap();
        m.kill("k", KillSignal::Kill).await.unwrap();
        assert_eq!(m.wait("k", WaitCondition::NotRunning).await.unwrap(), 137);
    }

    #[tokio::test]
    async fn restart_bumps_restart_count() {
        let m = manager(true);
        m.create(config(&["hang"]), Some("r")).unwrap();
        m.start("r").await.unwrap();
        m.restart("r", None).await.unwrap();
        let c = m.inspect("r").unwrap();
        assert_eq!(c.state, ContainerState::Running);
        assert_eq!(c.restart_count, 1);
    }

    #[tokio::test]
    async fn remove_wakes_removed_waiters() {
        let m = Arc::new(manager(true));
        m.create(config(&["hang"]), Some("gone")).unwrap();
        m.start("gone").await.unwrap();
        assert!(m.remove("gone", false).await.unwrap_err().is_conflict());

        let waiter = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.wait("gone", WaitCondition::Removed).await })
        };
        tokio::task::yield_now().await;
        m.remove("gone", true).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 143);
        assert!(m.inspect("gone").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn attach_replays_and_ends_at_exit() {
        let m = manager(true);
        m.create(config(&["echo", "hello"]), Some("a")).unwrap();
        m.start("a").await.unwrap();
        m.wait("a", WaitCondition::NotRunning).await.unwrap();

        let mut session = m.attach("a", false).await.unwrap();
        assert_eq!(&session.output.replay[..], b"echo hello\n");
        let live = session.output.live.as_mut().unwrap();
        assert!(live.recv().await.is_none());
    }

    #[tokio::test]
    async fn follow_on_created_container_waits_for_start() {
        let m = manager(true);
        m.create(config(&["echo", "late"]), Some("f")).unwrap();
        let options = LogsOptions {
            follow: true,
            ..LogsOptions::default()
        };
        let mut output = m.logs("f", &options).unwrap();
        assert!(output.replay.is_empty());
        let mut live = output.live.take().unwrap();

        m.start("f").await.unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = live.recv().await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"echo late\n");
    }

    #[tokio::test]
    async fn follow_on_created_container_ends_on_removal() {
        let m = manager(true);
        m.create(config(&["hang"]), Some("r")).unwrap();
        let options = LogsOptions {
            follow: true,
            ..LogsOptions::default()
        };
        let mut live = m.logs("r", &options).unwrap().live.unwrap();
        m.remove("r", false).await.unwrap();
        assert!(live.recv().await.is_none());
    }

    #[tokio::test]
    async fn attach_to_never_started_container_times_out() {
        let m = manager(true);
        m.create(config(&["hang"]), Some("idle")).unwrap();
        assert!(m.attach("idle", false).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn logs_of_unstarted_container_are_empty() {
        let m = manager(true);
        m.create(config(&["x"]), Some("l")).unwrap();
        let out = m.logs("l", &LogsOptions::default()).unwrap();
        assert!(out.replay.is_empty());
        assert!(out.live.is_none());
    }

    fn with_policy(cmd: &[&str], name: RestartPolicyName, max: u32) -> ContainerConfig {
        ContainerConfig {
            restart_policy: RestartPolicy {
                name,
                maximum_retry_count: max,
            },
            ..config(cmd)
        }
    }

    async fn settle(m: &ContainerManager, name: &str, done: impl Fn(&Container) -> bool) -> Container {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let c = m.inspect(name).unwrap();
                if done(&c) {
                    return c;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn on_failure_restarts_up_to_the_limit() {
        let m = manager(true);
        m.create(with_policy(&["fail"], RestartPolicyName::OnFailure, 2), Some("flaky"))
            .unwrap();
        m.start("flaky").await.unwrap();

        let c = settle(&m, "flaky", |c| c.restart_count == 2 && c.state == ContainerState::Exited).await;
        assert_eq!(c.exit_code, Some(1));
        tokio::time::sleep(Duration::from_millis(600)).await;
        let c = m.inspect("flaky").unwrap();
        assert_eq!(c.restart_count, 2);
        assert_eq!(c.state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn on_failure_ignores_clean_exit() {
        let m = manager(true);
        m.create(with_policy(&["echo"], RestartPolicyName::OnFailure, 0), Some("ok"))
            .unwrap();
        m.start("ok").await.unwrap();
        m.wait("ok", WaitCondition::NotRunning).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(m.inspect("ok").unwrap().restart_count, 0);
    }

    #[tokio::test]
    async fn always_restarts_until_removed() {
        let m = manager(true);
        m.create(with_policy(&["echo"], RestartPolicyName::Always, 0), Some("loop"))
            .unwrap();
        m.start("loop").await.unwrap();
        settle(&m, "loop", |c| c.restart_count >= 1).await;
        m.remove("loop", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(m.inspect("loop").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn explicit_stop_suppresses_restart() {
        let m = manager(true);
        for (name, policy) in [
            ("always", RestartPolicyName::Always),
            ("unless", RestartPolicyName::UnlessStopped),
        ] {
            m.create(with_policy(&["hang"], policy, 0), Some(name)).unwrap();
            m.start(name).await.unwrap();
            assert_eq!(m.stop(name, None).await.unwrap(), 143);
        }
        m.create(with_policy(&["hang"], RestartPolicyName::Always, 0), Some("killed"))
            .unwrap();
        m.start("killed").await.unwrap();
        m.kill("killed", KillSignal::Kill).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        for name in ["always", "unless", "killed"] {
            let c = m.inspect(name).unwrap();
            assert_eq!(c.state, ContainerState::Exited, "{name}");
            assert_eq!(c.restart_count, 0, "{name}");
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_restarts() {
        let m = manager(true);
        m.create(with_policy(&["fail"], RestartPolicyName::Always, 0), Some("pending"))
            .unwrap();
        m.start("pending").await.unwrap();
        m.wait("pending", WaitCondition::NotRunning).await.unwrap();
        m.shutdown().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(m.inspect("pending").unwrap().restart_count, 0);
    }

    #[tokio::test]
    async fn rename_frees_the_old_name() {
        let m = manager(true);
        m.create(config(&["hang"]), Some("a")).unwrap();
        m.create(config(&["hang"]), Some("b")).unwrap();
        assert!(matches!(m.rename("a", "b"), Err(CoreError::NameConflict { .. })));
        assert!(matches!(m.rename("a", "-bad"), Err(CoreError::Validation(_))));

        let renamed = m.rename("a", "c").unwrap();
        assert_eq!(renamed.name, "/c");
        assert!(m.inspect("a").unwrap_err().is_not_found());
        m.create(config(&["hang"]), Some("a")).unwrap();
    }

    #[tokio::test]
    async fn prune_removes_only_finished_containers() {
        let m = manager(true);
        let done = m.create(config(&["echo"]), Some("done")).unwrap();
        m.start("done").await.unwrap();
        m.wait("done", WaitCondition::NotRunning).await.unwrap();
        m.create(config(&["hang"]), Some("live")).unwrap();
        m.start("live").await.unwrap();
        m.create(config(&["hang"]), Some("fresh")).unwrap();

        let deleted = m.prune(&ContainerFilter::default()).await;
        assert_eq!(deleted, vec![done.id]);
        assert!(m.inspect("done").unwrap_err().is_not_found());
        assert_eq!(m.inspect("live").unwrap().state, ContainerState::Running);
        assert_eq!(m.inspect("fresh").unwrap().state, ContainerState::Created);
    }

    #[tokio::test]
    async fn lifecycle_publishes_events_in_order() {
        let m = manager(true);
        let mut events = m.store.events().subscribe();
        let c = m.create(config(&["echo"]), Some("ev")).unwrap();
        m.start("ev").await.unwrap();
        m.wait("ev", WaitCondition::NotRunning).await.unwrap();
        m.remove("ev", false).await.unwrap();

        let mut actions = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.actor_id, c.id);
            assert_eq!(event.attributes["name"], "ev");
            if event.action == "die" {
                assert_eq!(event.attributes["exitCode"], "0");
            }
            actions.push(event.action);
        }
        assert_eq!(actions, ["create", "start", "die", "destroy"]);
    }

    #[test]
    fn signal_parsing() {
        assert_eq!(KillSignal::parse(None), Some(KillSignal::Kill));
        assert_eq!(KillSignal::parse(Some("SIGKILL")), Some(KillSignal::Kill));
        assert_eq!(KillSignal::parse(Some("term")), Some(KillSignal::Terminate));
        assert_eq!(KillSignal::parse(Some("15")), Some(KillSignal::Terminate));
        assert_eq!(KillSignal::parse(Some("BOGUS")), None);
        assert_eq!(WaitCondition::parse("next-exit"), Some(WaitCondition::NextExit));
        assert_eq!(WaitCondition::parse("nope"), None);
    }
}
