//! Agent Manager facade
//!
//! One entry point per user-visible operation: create, stop, restart,
//! remove, execute task, list, get, stats, plus the pool operations. The
//! facade owns the durable agent records and is the only writer to
//! persistence; the supervisor, dispatcher, health monitor and pool engine
//! are private sub-components wired together here. Subordinate components
//! hold ids and bus handles only, never a reference back to the manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{AgentConfig, AgentId, AgentStatus, AgentType, PersistedAgentStatus};
use crate::config::ManagerConfig;
use crate::dispatch::{PendingTasks, TaskDispatcher};
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::health::{HealthConfig, HealthMonitor, HealthSnapshot, RestartRequest};
use crate::persistence::{AgentRecord, Storage, TaskRecord, TaskStatus};
use crate::pool::{PoolEngine, PoolId, PoolSettings, ScaleDecision, ScalingPolicy, Template, TemplateRegistry};
use crate::protocol::{TaskRequest, TaskResult};
use crate::supervisor::{ProcessRecord, ProcessSupervisor, SupervisorConfig};

/// Combined live view of one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    /// The agent
    pub agent_id: AgentId,

    /// Human-readable name
    pub name: String,

    /// Type tag
    pub agent_type: AgentType,

    /// Volatile lifecycle status
    pub status: AgentStatus,

    /// In-flight tasks right now
    pub pending_tasks: usize,

    /// Volatile process state
    pub record: ProcessRecord,

    /// Latest health snapshot, once the first scan has run
    pub health: Option<HealthSnapshot>,
}

/// Aggregate runtime statistics
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Agents tracked, in any state
    pub total_agents: usize,

    /// Agents currently running
    pub running_agents: usize,

    /// Tasks in flight
    pub pending_tasks: usize,

    /// Tasks completed across all agents
    pub tasks_completed: u64,

    /// Tasks failed across all agents
    pub tasks_failed: u64,

    /// Pools registered
    pub pools: usize,

    /// Milliseconds since the manager was built
    pub uptime_ms: u64,
}

/// Facade over the orchestration runtime
pub struct AgentManager {
    config: ManagerConfig,
    bus: Arc<EventBus>,
    supervisor: ProcessSupervisor,
    dispatcher: TaskDispatcher,
    health: HealthMonitor,
    pools: PoolEngine,
    store: Option<Arc<dyn Storage>>,
    records: RwLock<HashMap<AgentId, AgentRecord>>,
    removed: RwLock<HashSet<AgentId>>,
    restart_rx: StdMutex<Option<mpsc::UnboundedReceiver<RestartRequest>>>,
    cancel: CancellationToken,
    started_at: Instant,
}

impl AgentManager {
    /// Manager with the default scaling policy and no persistence
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_scaling_policy(config, ScalingPolicy::default())
    }

    /// Manager with an explicit scaling policy
    pub fn with_scaling_policy(config: ManagerConfig, policy: ScalingPolicy) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let pending = Arc::new(PendingTasks::new());
        let supervisor = ProcessSupervisor::new(
            SupervisorConfig {
                shutdown_grace: config.shutdown_grace,
                auto_restart: config.auto_restart,
                ..Default::default()
            },
            Arc::clone(&pending),
            Arc::clone(&bus),
        );
        let dispatcher = TaskDispatcher::new(supervisor.clone(), pending, Arc::clone(&bus));
        let (health, restart_rx) = HealthMonitor::new(
            supervisor.clone(),
            Arc::clone(&bus),
            HealthConfig {
                heartbeat_interval: config.heartbeat_interval,
                health_check_interval: config.health_check_interval,
                auto_restart: config.auto_restart,
                resource_limits: config.resource_limits,
                ..Default::default()
            },
        );
        let pools = PoolEngine::new(TemplateRegistry::with_builtins(), Arc::clone(&bus), policy);

        Ok(Self {
            config,
            bus,
            supervisor,
            dispatcher,
            health,
            pools,
            store: None,
            records: RwLock::new(HashMap::new()),
            removed: RwLock::new(HashSet::new()),
            restart_rx: StdMutex::new(Some(restart_rx)),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    /// Attach a persistence store; the manager writes through from then on
    pub fn with_storage(mut self, store: Arc<dyn Storage>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the background machinery: health scans, restart consumption
    /// and the scaling sweep
    ///
    /// Takes a clone of the owning `Arc`; background tasks hold only weak
    /// references and end when the manager is dropped.
    pub fn start(self: Arc<Self>) {
        self.health.start();

        if let Some(mut restart_rx) = self
            .restart_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let weak = Arc::downgrade(&self);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        request = restart_rx.recv() => {
                            let Some(request) = request else { break };
                            let Some(manager) = weak.upgrade() else { break };
                            warn!(
                                agent = %request.agent_id,
                                reason = %request.reason,
                                "restart requested by health monitor"
                            );
                            if let Err(err) = manager.restart(&request.agent_id).await {
                                warn!(agent = %request.agent_id, "health-requested restart failed: {err}");
                            }
                        }
                    }
                }
            });
        }

        let weak = Arc::downgrade(&self);
        let cancel = self.cancel.clone();
        let cooldown = self.pools.policy().cooldown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cooldown);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would sweep before anything exists
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.scaling_sweep().await;
                    }
                }
            }
        });
    }

    /// Stop every agent and tear down the background machinery
    pub async fn shutdown(&self) {
        info!("shutting down agent manager");
        self.cancel.cancel();
        self.health.stop();

        let agent_ids = self.supervisor.agent_ids().await;
        let stops = agent_ids.iter().map(|id| self.supervisor.stop(id, true));
        for (agent_id, outcome) in agent_ids.iter().zip(join_all(stops).await) {
            if let Err(err) = outcome {
                warn!(agent = %agent_id, "stop during shutdown failed: {err}");
            }
            self.persist_status(agent_id, PersistedAgentStatus::Offline)
                .await;
        }
    }

    // ==========================================================================
    // Agent operations
    // ==========================================================================

    /// Create an agent and spawn its process
    pub async fn create(&self, mut config: AgentConfig) -> Result<AgentId> {
        let live = self.supervisor.len().await;
        if live >= self.config.max_agents {
            return Err(OrchestratorError::Capacity(format!(
                "max_agents limit of {} reached",
                self.config.max_agents
            )));
        }

        // Normalise into the shape the supervisor consumes.
        let id_string = config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        config.id = Some(id_string.clone());
        if config.system_prompt.is_none() {
            config.system_prompt = Some(config.agent_type.default_system_prompt().to_string());
        }
        if config.command.is_empty() {
            config.command = self.config.environment_defaults.runtime.clone();
        }
        if config.working_directory.is_none() {
            config.working_directory = Some(
                self.config
                    .environment_defaults
                    .working_directory
                    .join(&id_string),
            );
        }

        let agent_id = self.supervisor.create(config.clone()).await?;
        self.removed.write().await.remove(&agent_id);

        let record = AgentRecord::from_config(&agent_id, &config);
        self.records
            .write()
            .await
            .insert(agent_id.clone(), record.clone());
        self.persist_save_agent(&record).await;

        self.bus.emit(SystemEvent::AgentCreated {
            agent_id: agent_id.clone(),
        });
        Ok(agent_id)
    }

    /// Stop an agent; `force` skips the voluntary-shutdown request
    ///
    /// Bounded by the configured `default_timeout`.
    pub async fn stop(&self, agent_id: &AgentId, force: bool) -> Result<()> {
        self.bounded(self.supervisor.stop(agent_id, force), "stop")
            .await?;
        self.persist_status(agent_id, PersistedAgentStatus::Offline)
            .await;
        Ok(())
    }

    /// Restart an agent with its original configuration
    ///
    /// Bounded by the configured `default_timeout`.
    pub async fn restart(&self, agent_id: &AgentId) -> Result<()> {
        self.bounded(self.supervisor.restart(agent_id), "restart")
            .await?;
        self.persist_status(agent_id, PersistedAgentStatus::Active)
            .await;
        Ok(())
    }

    async fn bounded<F>(&self, operation: F, name: &str) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.config.default_timeout, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OrchestratorError::Timeout(
                self.config.default_timeout,
                format!("{name} operation"),
            )),
        }
    }

    /// Remove an agent entirely
    ///
    /// Stops the process, drops all volatile state and marks the durable
    /// record removed. Repeated removal after the first success is a no-op;
    /// removal of an agent that never existed is a typed not-found failure.
    pub async fn remove(&self, agent_id: &AgentId) -> Result<()> {
        if self.removed.read().await.contains(agent_id) {
            return Ok(());
        }
        if !self.supervisor.contains(agent_id).await {
            return Err(OrchestratorError::agent_not_found(agent_id.to_string()));
        }

        self.supervisor.stop(agent_id, true).await?;
        self.supervisor.remove(agent_id).await?;
        self.health.forget(agent_id).await;
        if let Some(pool_id) = self.pools.detach_agent(agent_id).await {
            debug!(agent = %agent_id, pool = %pool_id, "detached from pool on removal");
        }
        self.records.write().await.remove(agent_id);
        self.removed.write().await.insert(agent_id.clone());
        self.persist_status(agent_id, PersistedAgentStatus::Removed)
            .await;

        self.bus.emit(SystemEvent::AgentRemoved {
            agent_id: agent_id.clone(),
        });
        Ok(())
    }

    /// Submit a task to an agent and await its result
    pub async fn execute_task(
        &self,
        agent_id: &AgentId,
        request: TaskRequest,
    ) -> Result<TaskResult> {
        if let Some(store) = &self.store {
            let mut task = TaskRecord::new(&request.id, &request.task_type, &request.description);
            task.status = TaskStatus::Assigned;
            task.priority = request.priority.unwrap_or(task.priority);
            task.dependencies = request.dependencies.clone().unwrap_or_default();
            task.assigned_agent = Some(agent_id.to_string());
            if let Err(err) = store.save_task(&task).await {
                warn!(task = %request.id, "task persistence failed: {err}");
            }
        }

        let task_id = request.id.clone();
        let outcome = self.dispatcher.execute_task(agent_id, request).await;

        if let Some(store) = &self.store {
            let (status, error) = match &outcome {
                Ok(result) if result.success => (TaskStatus::Completed, result.error.clone()),
                Ok(result) => (
                    TaskStatus::Failed,
                    result.error.clone().or_else(|| Some("task failed".into())),
                ),
                Err(err) if err.kind() == ErrorKind::Cancelled => {
                    (TaskStatus::Cancelled, Some(err.to_string()))
                }
                Err(err) => (TaskStatus::Failed, Some(err.to_string())),
            };
            if let Err(err) = store.finish_task(&task_id, status, error.as_deref()).await {
                warn!(task = %task_id, "task persistence failed: {err}");
            }
        }

        outcome
    }

    /// Combined live view of every tracked agent
    pub async fn list(&self) -> Vec<AgentInfo> {
        let records = self.records.read().await;
        let health = self.health.all_snapshots().await;
        let mut agents = Vec::new();

        for snapshot in self.supervisor.snapshot().await {
            let (name, agent_type) = records
                .get(&snapshot.agent_id)
                .map(|r| (r.name.clone(), r.agent_type))
                .unwrap_or_else(|| (snapshot.agent_id.to_string(), AgentType::General));
            agents.push(AgentInfo {
                pending_tasks: self.dispatcher.pending().count_for_agent(&snapshot.agent_id),
                health: health.get(&snapshot.agent_id).cloned(),
                agent_id: snapshot.agent_id,
                name,
                agent_type,
                status: snapshot.status,
                record: snapshot.record,
            });
        }
        agents
    }

    /// Combined live view of one agent
    pub async fn get(&self, agent_id: &AgentId) -> Result<AgentInfo> {
        self.list()
            .await
            .into_iter()
            .find(|info| &info.agent_id == agent_id)
            .ok_or_else(|| OrchestratorError::agent_not_found(agent_id.to_string()))
    }

    /// Aggregate statistics over the whole runtime
    pub async fn stats(&self) -> ManagerStats {
        let snapshots = self.supervisor.snapshot().await;
        let running = snapshots
            .iter()
            .filter(|s| s.status == AgentStatus::Running)
            .count();
        let (completed, failed) = snapshots.iter().fold((0, 0), |(c, f), s| {
            (c + s.record.tasks_completed, f + s.record.tasks_failed)
        });

        ManagerStats {
            total_agents: snapshots.len(),
            running_agents: running,
            pending_tasks: self.dispatcher.pending().len(),
            tasks_completed: completed,
            tasks_failed: failed,
            pools: self.pools.pools().await.len(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }

    // ==========================================================================
    // Pool operations
    // ==========================================================================

    /// Create a pool and eagerly provision its minimum size from a template
    pub async fn create_pool(
        &self,
        name: &str,
        template_name: &str,
        settings: PoolSettings,
    ) -> Result<PoolId> {
        settings.validate()?;
        let template = self.pools.templates().get(template_name).await?;

        let mut members = Vec::with_capacity(settings.min_size);
        for _ in 0..settings.min_size {
            match self.provision_member(&template, name).await {
                Ok(agent_id) => members.push(agent_id),
                Err(err) => {
                    // Roll the partially provisioned pool back.
                    for agent_id in members {
                        let _ = self.remove(&agent_id).await;
                    }
                    return Err(err);
                }
            }
        }

        self.pools
            .register_pool(name, template_name, settings, members)
            .await
    }

    /// Scale a pool to an explicit target within `[min,max]`
    pub async fn scale_pool(&self, pool_id: &PoolId, target: usize) -> Result<()> {
        let (_, delta) = self.pools.validate_target(pool_id, target).await?;
        if delta > 0 {
            self.grow_pool(pool_id, delta as usize).await
        } else if delta < 0 {
            self.shrink_pool(pool_id, (-delta) as usize).await
        } else {
            Ok(())
        }
    }

    /// Take a free member out of a pool for work
    pub async fn checkout_agent(&self, pool_id: &PoolId) -> Result<Option<AgentId>> {
        self.pools.checkout(pool_id).await
    }

    /// Return a busy member to its pool
    pub async fn checkin_agent(&self, pool_id: &PoolId, agent_id: &AgentId) -> Result<()> {
        self.pools.checkin(pool_id, agent_id).await
    }

    /// One pass of the implicit scaling sweep
    pub async fn scaling_sweep(&self) {
        for (pool_id, decision) in self.pools.scaling_decisions().await {
            let outcome = match decision {
                ScaleDecision::Grow(amount) => self.grow_pool(&pool_id, amount).await,
                ScaleDecision::Shrink(amount) => self.shrink_pool(&pool_id, amount).await,
            };
            if let Err(err) = outcome {
                warn!(pool = %pool_id, "scaling adjustment failed: {err}");
            }
        }
    }

    async fn grow_pool(&self, pool_id: &PoolId, count: usize) -> Result<()> {
        let pool = self.pools.pool(pool_id).await?;
        let template = self.pools.templates().get(&pool.template).await?;
        let from = pool.current_size();

        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(self.provision_member(&template, &pool.name).await?);
        }
        self.pools.add_members(pool_id, members).await?;
        self.pools.note_scaled(pool_id, from).await?;
        Ok(())
    }

    async fn shrink_pool(&self, pool_id: &PoolId, count: usize) -> Result<()> {
        let from = self.pools.pool(pool_id).await?.current_size();
        let victims = self.pools.take_free(pool_id, count).await?;
        for agent_id in victims {
            if let Err(err) = self.remove(&agent_id).await {
                warn!(agent = %agent_id, "pool member removal failed: {err}");
            }
        }
        self.pools.note_scaled(pool_id, from).await?;
        Ok(())
    }

    async fn provision_member(&self, template: &Template, pool_name: &str) -> Result<AgentId> {
        let suffix = Uuid::new_v4().simple().to_string();
        let member_name = format!("{pool_name}-{}", &suffix[..8]);
        self.create(template.agent_config(member_name)).await
    }

    // ==========================================================================
    // Component access
    // ==========================================================================

    /// The event bus carrying lifecycle notifications
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// The health monitor and its snapshots
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// The pool engine and its template registry
    pub fn pool_engine(&self) -> &PoolEngine {
        &self.pools
    }

    /// The template registry pools are instantiated from
    pub fn templates(&self) -> &TemplateRegistry {
        self.pools.templates()
    }

    // ==========================================================================
    // Persistence write-through
    // ==========================================================================

    async fn persist_save_agent(&self, record: &AgentRecord) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save_agent(record).await {
                // Persistence failures never block process lifecycle.
                warn!(agent = %record.id, "persistence write failed: {err}");
            }
        }
    }

    async fn persist_status(&self, agent_id: &AgentId, status: PersistedAgentStatus) {
        if let Some(store) = &self.store {
            match store.update_agent_status(agent_id, status).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(agent = %agent_id, "persistence write failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let config = ManagerConfig {
            max_agents: 0,
            ..Default::default()
        };
        let err = AgentManager::new(config)
            .err()
            .expect("zero max_agents must be rejected");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_remove_of_unknown_agent_is_not_found() {
        let manager = AgentManager::new(ManagerConfig::default()).unwrap();
        let err = manager
            .remove(&AgentId::from_string("ghost"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
