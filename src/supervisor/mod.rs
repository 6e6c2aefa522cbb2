//! Process Supervisor
//!
//! Spawns each agent as a child process, exchanges newline-delimited JSON
//! messages over its standard streams, tracks lifecycle state, and restarts
//! crashed children with bounded exponential backoff.
//!
//! Lifecycle state machine:
//!
//! ```text
//! [none] --create--> starting --(ready)--> running
//! running --stop--> stopping --(exit)--> stopped
//! running --(exit 0)--> stopped
//! running --(exit != 0)--> crashed --(schedule restart)--> starting
//! running --(spawn error)--> error
//! stopping --(timeout)--> (SIGKILL) --> stopped
//! ```
//!
//! Each child gets exactly one stdin writer, one stdout reader, one stderr
//! reader and one exit waiter; every transition of the state machine has a
//! single owner among them.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::{AgentConfig, AgentId, AgentStatus, ResourceSnapshot};
use crate::dispatch::PendingTasks;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::protocol::{self, AgentCommand, InboundLine, MessageKind, WireMessage};

/// Base delay before the first automatic restart
const BACKOFF_BASE_MS: u64 = 1_000;

/// Ceiling on the automatic-restart delay
const BACKOFF_CAP_MS: u64 = 30_000;

/// Automatic restarts stop once the restart count reaches this bound
const MAX_AUTO_RESTARTS: u32 = 3;

/// Task duration samples retained per process for health scoring
const DURATION_SAMPLES: usize = 10;

/// Delay before the next automatic restart of a crashed agent
pub fn restart_backoff(restart_count: u32) -> Duration {
    let exponent = restart_count.min(31);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(1 << exponent).min(BACKOFF_CAP_MS))
}

/// Supervisor tuning knobs
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Window between a voluntary-shutdown request and SIGTERM
    pub shutdown_grace: Duration,

    /// Window between SIGTERM and SIGKILL
    pub kill_grace: Duration,

    /// Restart crashed children automatically
    pub auto_restart: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            auto_restart: true,
        }
    }
}

/// Volatile runtime state of one spawned child
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    /// OS process id
    pub pid: u32,

    /// Spawn time of the current process
    pub started_at: DateTime<Utc>,

    /// Last time any valid message arrived from the child
    pub last_activity: DateTime<Utc>,

    /// Tasks completed successfully over the agent's lifetime
    pub tasks_completed: u64,

    /// Tasks failed over the agent's lifetime
    pub tasks_failed: u64,

    /// Number of process births after the first
    pub restart_count: u32,

    /// Latest resource snapshot reported by the child
    pub resources: ResourceSnapshot,

    /// Durations of recently completed tasks, newest last
    pub recent_durations_ms: VecDeque<u64>,
}

impl ProcessRecord {
    fn new(pid: u32, restart_count: u32) -> Self {
        let now = Utc::now();
        Self {
            pid,
            started_at: now,
            last_activity: now,
            tasks_completed: 0,
            tasks_failed: 0,
            restart_count,
            resources: ResourceSnapshot::default(),
            recent_durations_ms: VecDeque::with_capacity(DURATION_SAMPLES),
        }
    }

    fn push_duration(&mut self, duration_ms: u64) {
        if self.recent_durations_ms.len() == DURATION_SAMPLES {
            self.recent_durations_ms.pop_front();
        }
        self.recent_durations_ms.push_back(duration_ms);
    }

    /// Mean of the retained duration samples, if any
    pub fn average_recent_duration_ms(&self) -> Option<f64> {
        if self.recent_durations_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.recent_durations_ms.iter().sum();
        Some(sum as f64 / self.recent_durations_ms.len() as f64)
    }
}

/// Point-in-time view of one supervised agent
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    /// The agent
    pub agent_id: AgentId,

    /// Current lifecycle status
    pub status: AgentStatus,

    /// Process record at snapshot time
    pub record: ProcessRecord,
}

struct ProcessEntry {
    config: AgentConfig,
    status: AgentStatus,
    record: ProcessRecord,
    /// Present while the child may still accept writes
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    /// Flips to true once the exit waiter has fully handled the exit
    exit_rx: watch::Receiver<bool>,
    /// Cancels the scheduled restart of this agent
    cancel: CancellationToken,
}

struct SupervisorInner {
    processes: RwLock<HashMap<AgentId, ProcessEntry>>,
    pending: Arc<PendingTasks>,
    bus: Arc<EventBus>,
    config: SupervisorConfig,
}

/// Owns every child process and its standard streams
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    /// Supervisor publishing to `bus` and completing tasks in `pending`
    pub fn new(config: SupervisorConfig, pending: Arc<PendingTasks>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                processes: RwLock::new(HashMap::new()),
                pending,
                bus,
                config,
            }),
        }
    }

    // ==========================================================================
    // Lifecycle operations
    // ==========================================================================

    /// Spawn a new agent process from `config`
    ///
    /// Fails with a conflict when an agent with the same id already exists,
    /// in any state short of removal.
    pub async fn create(&self, config: AgentConfig) -> Result<AgentId> {
        let agent_id = config
            .id
            .clone()
            .map(AgentId::from)
            .unwrap_or_default();
        self.spawn_agent(&agent_id, config, 0, false).await?;
        Ok(agent_id)
    }

    /// Stop an agent
    ///
    /// Cancels its pending tasks, then escalates: voluntary shutdown request
    /// (skipped when `force`), SIGTERM after the grace window, SIGKILL after
    /// a second window. Idempotent once the process has exited.
    pub async fn stop(&self, agent_id: &AgentId, force: bool) -> Result<()> {
        let (previous, stdin, mut exit_rx, pid) = {
            let mut processes = self.inner.processes.write().await;
            let entry = processes
                .get_mut(agent_id)
                .ok_or_else(|| OrchestratorError::agent_not_found(agent_id.to_string()))?;

            let exited = *entry.exit_rx.borrow();
            if exited && entry.status.is_terminal() {
                return Ok(());
            }
            if entry.status == AgentStatus::Stopping {
                // A stop is already in flight; just wait for it.
                let mut rx = entry.exit_rx.clone();
                drop(processes);
                let window = self.inner.config.shutdown_grace + self.inner.config.kill_grace * 2;
                wait_for_exit(&mut rx, window).await;
                return Ok(());
            }

            let previous = entry.status;
            entry.status = AgentStatus::Stopping;
            (
                previous,
                entry.stdin.clone(),
                entry.exit_rx.clone(),
                entry.record.pid,
            )
        };

        info!(agent = %agent_id, force, "stopping agent");
        self.inner.bus.emit(SystemEvent::AgentStatusChanged {
            agent_id: agent_id.clone(),
            from: previous,
            to: AgentStatus::Stopping,
        });

        let cancelled = self
            .inner
            .pending
            .fail_all_for_agent(agent_id, || {
                OrchestratorError::Cancelled("agent stopping".into())
            });
        for task_id in &cancelled {
            self.inner.bus.emit(SystemEvent::TaskFailed {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
                error: "cancelled: agent stopping".into(),
            });
        }

        if !force {
            if let Some(stdin) = &stdin {
                match WireMessage::command(AgentCommand::Shutdown) {
                    Ok(message) => {
                        if let Err(err) = write_message(stdin, &message).await {
                            debug!(agent = %agent_id, "shutdown request failed: {err}");
                        }
                    }
                    Err(err) => debug!(agent = %agent_id, "shutdown encode failed: {err}"),
                }
            }
            if wait_for_exit(&mut exit_rx, self.inner.config.shutdown_grace).await {
                return Ok(());
            }
            debug!(agent = %agent_id, "no voluntary exit within grace window");
        }

        terminate_pid(pid);
        if wait_for_exit(&mut exit_rx, self.inner.config.kill_grace).await {
            return Ok(());
        }

        warn!(agent = %agent_id, pid, "process survived SIGTERM; killing");
        kill_pid(pid);
        if wait_for_exit(&mut exit_rx, self.inner.config.kill_grace).await {
            return Ok(());
        }

        Err(OrchestratorError::Timeout(
            self.inner.config.kill_grace,
            format!("agent {agent_id} did not exit after SIGKILL"),
        ))
    }

    /// Stop (forcefully) and respawn an agent with its original config
    ///
    /// The restart count carries over, incremented by one; transient
    /// counters reset with the new process.
    pub async fn restart(&self, agent_id: &AgentId) -> Result<()> {
        if !self.contains(agent_id).await {
            return Err(OrchestratorError::agent_not_found(agent_id.to_string()));
        }
        self.stop(agent_id, true).await?;
        self.respawn(agent_id).await
    }

    /// Drop all supervisor state for an agent
    ///
    /// The caller is responsible for stopping the process first; removal
    /// also cancels any scheduled restart.
    pub async fn remove(&self, agent_id: &AgentId) -> Result<()> {
        let mut processes = self.inner.processes.write().await;
        match processes.remove(agent_id) {
            Some(entry) => {
                entry.cancel.cancel();
                if !entry.status.is_terminal() {
                    warn!(agent = %agent_id, status = %entry.status, "removed while not stopped");
                }
                Ok(())
            }
            None => Err(OrchestratorError::agent_not_found(agent_id.to_string())),
        }
    }

    /// Write one framed message to the agent's stdin
    pub async fn send_message(&self, agent_id: &AgentId, message: &WireMessage) -> Result<()> {
        let stdin = {
            let processes = self.inner.processes.read().await;
            let entry = processes
                .get(agent_id)
                .ok_or_else(|| OrchestratorError::agent_not_found(agent_id.to_string()))?;
            if entry.status != AgentStatus::Running {
                return Err(OrchestratorError::Conflict(format!(
                    "agent {agent_id} is {}, cannot receive messages",
                    entry.status
                )));
            }
            entry
                .stdin
                .clone()
                .ok_or_else(|| OrchestratorError::Process("stdin closed".into()))?
        };

        write_message(&stdin, message)
            .await
            .map_err(|e| OrchestratorError::Process(format!("stdin write failed: {e}")))
    }

    // ==========================================================================
    // Accessors
    // ==========================================================================

    /// Current lifecycle status of an agent
    pub async fn status(&self, agent_id: &AgentId) -> Option<AgentStatus> {
        self.inner
            .processes
            .read()
            .await
            .get(agent_id)
            .map(|e| e.status)
    }

    /// Current process record of an agent
    pub async fn record(&self, agent_id: &AgentId) -> Option<ProcessRecord> {
        self.inner
            .processes
            .read()
            .await
            .get(agent_id)
            .map(|e| e.record.clone())
    }

    /// Spawn configuration of an agent
    pub async fn config(&self, agent_id: &AgentId) -> Option<AgentConfig> {
        self.inner
            .processes
            .read()
            .await
            .get(agent_id)
            .map(|e| e.config.clone())
    }

    /// Concurrency bound and default task timeout of an agent
    pub async fn task_limits(&self, agent_id: &AgentId) -> Result<(usize, u64)> {
        let processes = self.inner.processes.read().await;
        let entry = processes
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::agent_not_found(agent_id.to_string()))?;
        Ok((entry.config.max_concurrent_tasks, entry.config.task_timeout_ms))
    }

    /// Whether the supervisor tracks this agent at all
    pub async fn contains(&self, agent_id: &AgentId) -> bool {
        self.inner.processes.read().await.contains_key(agent_id)
    }

    /// Number of tracked agents, in any state
    pub async fn len(&self) -> usize {
        self.inner.processes.read().await.len()
    }

    /// Whether no agent is tracked
    pub async fn is_empty(&self) -> bool {
        self.inner.processes.read().await.is_empty()
    }

    /// Ids of every tracked agent
    pub async fn agent_ids(&self) -> Vec<AgentId> {
        self.inner.processes.read().await.keys().cloned().collect()
    }

    /// Point-in-time view of every tracked agent
    pub async fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.inner
            .processes
            .read()
            .await
            .iter()
            .map(|(agent_id, entry)| AgentSnapshot {
                agent_id: agent_id.clone(),
                status: entry.status,
                record: entry.record.clone(),
            })
            .collect()
    }

    /// Flag an unresponsive agent as errored without touching its process
    ///
    /// Used by the health monitor when the heartbeat scan trips; the process
    /// itself is dealt with by the restart that usually follows.
    pub async fn flag_error(&self, agent_id: &AgentId, message: impl Into<String>) {
        let message = message.into();
        let previous = {
            let mut processes = self.inner.processes.write().await;
            match processes.get_mut(agent_id) {
                Some(entry) if entry.status != AgentStatus::Error => {
                    let previous = entry.status;
                    entry.status = AgentStatus::Error;
                    Some(previous)
                }
                _ => None,
            }
        };
        if let Some(previous) = previous {
            self.inner.bus.emit(SystemEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from: previous,
                to: AgentStatus::Error,
            });
            self.inner.bus.emit(SystemEvent::AgentError {
                agent_id: agent_id.clone(),
                message,
            });
        }
    }

    // ==========================================================================
    // Spawn and exit handling
    // ==========================================================================

    fn spawn_agent<'a>(
        &'a self,
        agent_id: &'a AgentId,
        config: AgentConfig,
        restart_count: u32,
        replace_existing: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        if !replace_existing && self.contains(agent_id).await {
            return Err(OrchestratorError::Conflict(format!(
                "agent {agent_id} already exists"
            )));
        }

        if let Some(dir) = &config.working_directory {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| OrchestratorError::Process(format!(
                    "cannot create working directory {}: {e}",
                    dir.display()
                )))?;
        }

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_directory {
            command.current_dir(dir);
        }
        for (key, value) in &config.environment {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(agent = %agent_id, command = %config.command, "spawn failed: {err}");
                let (_tx, exit_rx) = watch::channel(true);
                let mut processes = self.inner.processes.write().await;
                if let Some(old) = processes.insert(
                    agent_id.clone(),
                    ProcessEntry {
                        config: config.clone(),
                        status: AgentStatus::Error,
                        record: ProcessRecord::new(0, restart_count),
                        stdin: None,
                        exit_rx,
                        cancel: CancellationToken::new(),
                    },
                ) {
                    old.cancel.cancel();
                }
                drop(processes);
                self.inner.bus.emit(SystemEvent::AgentError {
                    agent_id: agent_id.clone(),
                    message: format!("spawn failed: {err}"),
                });
                return Err(OrchestratorError::Process(format!(
                    "failed to spawn '{}': {err}",
                    config.command
                )));
            }
        };

        let pid = child.id().unwrap_or_default();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::Process("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::Process("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OrchestratorError::Process("child stderr unavailable".into()))?;

        let (exit_tx, exit_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let previous_status = {
            let mut processes = self.inner.processes.write().await;
            let old = processes.insert(
                agent_id.clone(),
                ProcessEntry {
                    config,
                    status: AgentStatus::Starting,
                    record: ProcessRecord::new(pid, restart_count),
                    stdin: Some(Arc::new(Mutex::new(stdin))),
                    exit_rx,
                    cancel,
                },
            );
            if let Some(old) = &old {
                old.cancel.cancel();
            }
            old.map(|e| e.status)
        };

        info!(agent = %agent_id, pid, restart_count, "agent process spawned");
        if let Some(previous) = previous_status {
            self.inner.bus.emit(SystemEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from: previous,
                to: AgentStatus::Starting,
            });
        }

        // One reader per stream, one waiter per child.
        let supervisor = self.clone();
        let reader_id = agent_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => supervisor.handle_stdout_line(&reader_id, &line).await,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(agent = %reader_id, "stdout read failed: {err}");
                        break;
                    }
                }
            }
        });

        let stderr_id = agent_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(agent = %stderr_id, stderr = %line, "child stderr");
            }
        });

        let supervisor = self.clone();
        let waiter_id = agent_id.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    error!(agent = %waiter_id, "wait failed: {err}");
                    None
                }
            };
            supervisor.handle_exit(&waiter_id, code).await;
            let _ = exit_tx.send(true);
        });

        // Ready. Guarded on Starting: a child that dies instantly may have
        // been walked to crashed by its waiter already.
        let ready = {
            let mut processes = self.inner.processes.write().await;
            match processes.get_mut(agent_id) {
                Some(entry) if entry.status == AgentStatus::Starting => {
                    entry.status = AgentStatus::Running;
                    true
                }
                _ => false,
            }
        };
        if ready {
            self.inner.bus.emit(SystemEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from: AgentStatus::Starting,
                to: AgentStatus::Running,
            });
            self.inner.bus.emit(SystemEvent::AgentStarted {
                agent_id: agent_id.clone(),
            });
        }
        Ok(())
        })
    }

    /// Respawn an exited agent with its original config
    async fn respawn(&self, agent_id: &AgentId) -> Result<()> {
        let (config, restart_count) = {
            let processes = self.inner.processes.read().await;
            let entry = processes
                .get(agent_id)
                .ok_or_else(|| OrchestratorError::agent_not_found(agent_id.to_string()))?;
            if !*entry.exit_rx.borrow() && entry.stdin.is_some() {
                return Err(OrchestratorError::Conflict(format!(
                    "agent {agent_id} process is still running"
                )));
            }
            (entry.config.clone(), entry.record.restart_count)
        };

        self.spawn_agent(agent_id, config, restart_count + 1, true)
            .await?;
        self.inner.bus.emit(SystemEvent::AgentRestarted {
            agent_id: agent_id.clone(),
            restart_count: restart_count + 1,
        });
        Ok(())
    }

    async fn handle_exit(&self, agent_id: &AgentId, code: Option<i32>) {
        let outcome = {
            let mut processes = self.inner.processes.write().await;
            let Some(entry) = processes.get_mut(agent_id) else {
                return;
            };
            entry.stdin = None;
            let previous = entry.status;
            let next = if previous == AgentStatus::Stopping || code == Some(0) {
                AgentStatus::Stopped
            } else {
                AgentStatus::Crashed
            };
            entry.status = next;
            Some((previous, next, entry.record.restart_count, entry.cancel.clone()))
        };
        let Some((previous, next, restart_count, cancel)) = outcome else {
            return;
        };

        info!(agent = %agent_id, ?code, from = %previous, to = %next, "agent process exited");
        if previous != next {
            self.inner.bus.emit(SystemEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from: previous,
                to: next,
            });
        }
        self.inner.bus.emit(SystemEvent::AgentExited {
            agent_id: agent_id.clone(),
            code,
        });
        if previous == AgentStatus::Stopping {
            self.inner.bus.emit(SystemEvent::AgentStopped {
                agent_id: agent_id.clone(),
            });
        }

        // Any task still pending at exit rejects with the exit code;
        // restart scheduling proceeds independently.
        let orphaned = self.inner.pending.fail_all_for_agent(agent_id, || {
            OrchestratorError::ProcessExit { code }
        });
        for task_id in orphaned {
            self.inner.bus.emit(SystemEvent::TaskFailed {
                task_id,
                agent_id: agent_id.clone(),
                error: OrchestratorError::ProcessExit { code }.to_string(),
            });
        }

        if next != AgentStatus::Crashed {
            return;
        }

        if self.inner.config.auto_restart && restart_count < MAX_AUTO_RESTARTS {
            let delay = restart_backoff(restart_count);
            warn!(
                agent = %agent_id,
                ?code,
                restart_count,
                delay_ms = delay.as_millis() as u64,
                "agent crashed; restart scheduled"
            );
            let supervisor = self.clone();
            let restart_id = agent_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(agent = %restart_id, "scheduled restart cancelled");
                    }
                    _ = tokio::time::sleep(delay) => {
                        match supervisor.respawn(&restart_id).await {
                            Ok(()) => {}
                            Err(err) if err.kind() == ErrorKind::NotFound => {}
                            Err(err) => {
                                error!(agent = %restart_id, "scheduled restart failed: {err}");
                            }
                        }
                    }
                }
            });
        } else if self.inner.config.auto_restart {
            self.transition(agent_id, AgentStatus::Error).await;
            self.inner.bus.emit(SystemEvent::AgentError {
                agent_id: agent_id.clone(),
                message: format!(
                    "restart limit reached after {restart_count} restarts; agent left in error"
                ),
            });
        }
    }

    // ==========================================================================
    // Inbound message handling
    // ==========================================================================

    async fn handle_stdout_line(&self, agent_id: &AgentId, line: &str) {
        match protocol::parse_line(line) {
            InboundLine::Message(message) => self.handle_inbound(agent_id, *message).await,
            InboundLine::Log(raw) => {
                // Non-JSON output is recorded, never dropped silently.
                debug!(agent = %agent_id, output = %raw, "child log output");
            }
        }
    }

    async fn handle_inbound(&self, agent_id: &AgentId, message: WireMessage) {
        {
            let mut processes = self.inner.processes.write().await;
            if let Some(entry) = processes.get_mut(agent_id) {
                entry.record.last_activity = Utc::now();
            }
        }

        match message.kind {
            MessageKind::Result => {
                let result = match message.task_result() {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(agent = %agent_id, "malformed result payload dropped: {err}");
                        return;
                    }
                };
                let task_id = result.task_id.clone();
                let success = result.success;
                let duration = result.duration;
                let error_text = result.error.clone();

                match self.inner.pending.complete(&task_id, result) {
                    Some(owner) => {
                        {
                            let mut processes = self.inner.processes.write().await;
                            if let Some(entry) = processes.get_mut(&owner) {
                                if success {
                                    entry.record.tasks_completed += 1;
                                } else {
                                    entry.record.tasks_failed += 1;
                                }
                                entry.record.push_duration(duration);
                            }
                        }
                        if success {
                            self.inner.bus.emit(SystemEvent::TaskCompleted {
                                task_id,
                                agent_id: owner,
                                duration_ms: duration,
                            });
                        } else {
                            self.inner.bus.emit(SystemEvent::TaskFailed {
                                task_id,
                                agent_id: owner,
                                error: error_text.unwrap_or_else(|| "task failed".into()),
                            });
                        }
                    }
                    None => {
                        warn!(agent = %agent_id, task = %task_id, "result matched no pending task; dropped");
                    }
                }
            }
            MessageKind::Status => match message.status_report() {
                Ok(report) => {
                    let mut processes = self.inner.processes.write().await;
                    if let Some(entry) = processes.get_mut(agent_id) {
                        entry.record.resources = ResourceSnapshot {
                            cpu: report.cpu,
                            memory: report.memory,
                            disk: report.disk,
                        };
                    }
                }
                Err(err) => warn!(agent = %agent_id, "malformed status payload dropped: {err}"),
            },
            MessageKind::Heartbeat => {
                debug!(agent = %agent_id, "heartbeat");
            }
            MessageKind::Error => {
                let text = message
                    .data
                    .get("error")
                    .or_else(|| message.data.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported an error")
                    .to_string();
                warn!(agent = %agent_id, "child error: {text}");
                self.inner.bus.emit(SystemEvent::AgentError {
                    agent_id: agent_id.clone(),
                    message: text,
                });
            }
            MessageKind::Task | MessageKind::Command => {
                warn!(agent = %agent_id, kind = ?message.kind, "unexpected message kind from child");
            }
        }
    }

    async fn transition(&self, agent_id: &AgentId, to: AgentStatus) {
        let previous = {
            let mut processes = self.inner.processes.write().await;
            match processes.get_mut(agent_id) {
                Some(entry) if entry.status != to => {
                    let previous = entry.status;
                    entry.status = to;
                    Some(previous)
                }
                _ => None,
            }
        };
        if let Some(from) = previous {
            self.inner.bus.emit(SystemEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from,
                to,
            });
        }
    }
}

async fn write_message(
    stdin: &Arc<Mutex<ChildStdin>>,
    message: &WireMessage,
) -> std::io::Result<()> {
    let line = message
        .to_line()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut guard = stdin.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.flush().await
}

/// Wait up to `window` for the exit flag to flip
async fn wait_for_exit(exit_rx: &mut watch::Receiver<bool>, window: Duration) -> bool {
    matches!(
        tokio::time::timeout(window, exit_rx.wait_for(|exited| *exited)).await,
        Ok(Ok(_))
    )
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if pid == 0 {
        return;
    }
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, "SIGTERM failed: {err}");
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if pid == 0 {
        return;
    }
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, "SIGKILL failed: {err}");
    }
}

#[cfg(not(unix))]
fn terminate_pid(_pid: u32) {}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_backoff_doubles_and_caps() {
        assert_eq!(restart_backoff(0), Duration::from_millis(1_000));
        assert_eq!(restart_backoff(1), Duration::from_millis(2_000));
        assert_eq!(restart_backoff(2), Duration::from_millis(4_000));
        assert_eq!(restart_backoff(5), Duration::from_millis(30_000));
        assert_eq!(restart_backoff(31), Duration::from_millis(30_000));
        assert_eq!(restart_backoff(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_process_record_bounds_duration_samples() {
        let mut record = ProcessRecord::new(1, 0);
        assert_eq!(record.average_recent_duration_ms(), None);

        for n in 0..25u64 {
            record.push_duration(n);
        }
        assert_eq!(record.recent_durations_ms.len(), DURATION_SAMPLES);
        // Only the newest ten samples (15..=24) remain
        assert_eq!(record.average_recent_duration_ms(), Some(19.5));
    }
}
