//! Task dispatch and response correlation
//!
//! The dispatcher submits a task to a running agent and parks a pending
//! entry until the matching `result` message arrives or the per-task timer
//! fires. Responses are matched purely by task id; nothing here assumes any
//! ordering between tasks submitted to the same agent. The pending table is
//! shared with the supervisor, whose stdout readers complete entries as
//! results arrive and fail them when a child dies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::agents::AgentId;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::protocol::{TaskRequest, TaskResult, WireMessage};
use crate::supervisor::ProcessSupervisor;

/// In-flight task handle
struct PendingEntry {
    agent_id: AgentId,
    tx: oneshot::Sender<Result<TaskResult>>,
}

/// Table of in-flight tasks, keyed by task id
///
/// Task ids are unique within one table; an in-flight id appears in exactly
/// one agent's pending set. Every mutation is a short critical section.
#[derive(Default)]
pub struct PendingTasks {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingTasks {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight task, enforcing the agent's concurrency bound
    fn register(
        &self,
        task_id: &str,
        agent_id: &AgentId,
        max_concurrent: usize,
    ) -> Result<oneshot::Receiver<Result<TaskResult>>> {
        let mut entries = self.lock();
        if entries.contains_key(task_id) {
            return Err(OrchestratorError::Conflict(format!(
                "task {task_id} is already pending"
            )));
        }
        let in_flight = entries
            .values()
            .filter(|e| &e.agent_id == agent_id)
            .count();
        if in_flight >= max_concurrent {
            return Err(OrchestratorError::Capacity(format!(
                "agent {agent_id} already has {in_flight} pending tasks (limit {max_concurrent})"
            )));
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(
            task_id.to_string(),
            PendingEntry {
                agent_id: agent_id.clone(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Complete an entry with a child-reported result
    ///
    /// Returns the owning agent when the id matched a pending entry. An
    /// unmatched result is the caller's to log and drop.
    pub(crate) fn complete(&self, task_id: &str, result: TaskResult) -> Option<AgentId> {
        let entry = self.lock().remove(task_id)?;
        let agent_id = entry.agent_id.clone();
        // The receiver may already be gone if the submitting call timed out
        // in the same instant; that race is resolved by entry removal.
        let _ = entry.tx.send(Ok(result));
        Some(agent_id)
    }

    /// Remove an entry without completing it (timeout path)
    pub(crate) fn remove(&self, task_id: &str) -> bool {
        self.lock().remove(task_id).is_some()
    }

    /// Fail every pending task owned by `agent_id`
    ///
    /// Returns the ids of the failed tasks. The error for each entry comes
    /// from `make_error` so that cancellation and process-exit failures stay
    /// distinguishable at the call sites awaiting them.
    pub(crate) fn fail_all_for_agent(
        &self,
        agent_id: &AgentId,
        mut make_error: impl FnMut() -> OrchestratorError,
    ) -> Vec<String> {
        let mut entries = self.lock();
        let task_ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| &e.agent_id == agent_id)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in &task_ids {
            if let Some(entry) = entries.remove(task_id) {
                let _ = entry.tx.send(Err(make_error()));
            }
        }
        task_ids
    }

    /// Number of in-flight tasks owned by `agent_id`
    pub fn count_for_agent(&self, agent_id: &AgentId) -> usize {
        self.lock()
            .values()
            .filter(|e| &e.agent_id == agent_id)
            .count()
    }

    /// Ids of in-flight tasks owned by `agent_id`
    pub fn tasks_for_agent(&self, agent_id: &AgentId) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, e)| &e.agent_id == agent_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Total number of in-flight tasks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no task is in flight
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Submits tasks to running agents and correlates their responses
pub struct TaskDispatcher {
    supervisor: ProcessSupervisor,
    pending: Arc<PendingTasks>,
    bus: Arc<EventBus>,
}

impl TaskDispatcher {
    /// Dispatcher over the given supervisor and shared pending table
    pub fn new(
        supervisor: ProcessSupervisor,
        pending: Arc<PendingTasks>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            supervisor,
            pending,
            bus,
        }
    }

    /// The shared pending table
    pub fn pending(&self) -> &Arc<PendingTasks> {
        &self.pending
    }

    /// Submit a task to a running agent and await the correlated result
    ///
    /// Fails immediately when the agent is missing, not running, or already
    /// at its concurrency bound. Otherwise the call resolves when a matching
    /// `result` arrives, the per-task timer fires, or the agent goes away.
    pub async fn execute_task(
        &self,
        agent_id: &AgentId,
        request: TaskRequest,
    ) -> Result<TaskResult> {
        if request.id.is_empty() {
            return Err(OrchestratorError::Validation("task id must be set".into()));
        }

        let status = self
            .supervisor
            .status(agent_id)
            .await
            .ok_or_else(|| OrchestratorError::agent_not_found(agent_id.to_string()))?;
        if !status.accepts_tasks() {
            return Err(OrchestratorError::Conflict(format!(
                "agent {agent_id} is {status}, not accepting tasks"
            )));
        }

        let (max_concurrent, default_timeout_ms) =
            self.supervisor.task_limits(agent_id).await?;
        let timeout = Duration::from_millis(request.timeout.unwrap_or(default_timeout_ms));

        let mut rx = self.pending.register(&request.id, agent_id, max_concurrent)?;
        debug!(agent = %agent_id, task = %request.id, ?timeout, "task dispatched");

        let message = WireMessage::task(&request)?;
        if let Err(err) = self.supervisor.send_message(agent_id, &message).await {
            // The entry never reached the child; withdraw it and surface the
            // underlying write failure to the caller.
            self.pending.remove(&request.id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(OrchestratorError::Cancelled(format!(
                "task {} abandoned by the runtime",
                request.id
            ))),
            Err(_elapsed) => {
                if self.pending.remove(&request.id) {
                    warn!(agent = %agent_id, task = %request.id, "task timed out");
                    self.bus.emit(SystemEvent::TaskFailed {
                        task_id: request.id.clone(),
                        agent_id: agent_id.clone(),
                        error: format!("timed out after {timeout:?}"),
                    });
                    Err(OrchestratorError::Timeout(
                        timeout,
                        format!("task {}", request.id),
                    ))
                } else {
                    // The completion won the race with the timer; take it.
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(OrchestratorError::Timeout(
                            timeout,
                            format!("task {}", request.id),
                        )),
                    }
                }
            }
        }
    }
}
