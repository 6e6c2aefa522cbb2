//! Health & heartbeat monitoring
//!
//! Two periodic scans over the live agent population share one cooperative
//! scheduler: the heartbeat scan flags agents that have gone silent, and
//! the composite scan folds responsiveness, performance, reliability and
//! resource headroom into one overall score per agent. The monitor owns the
//! health snapshots and may request restarts over a channel, but never
//! spawns or kills a process itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agents::{AgentId, AgentStatus, ResourceSnapshot};
use crate::config::ResourceLimits;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::supervisor::{AgentSnapshot, ProcessSupervisor};

/// Baseline expected task execution time for the performance score
pub const EXPECTED_EXECUTION_MS: u64 = 60_000;

/// Overall score below which a restart is requested
pub const CRITICAL_OVERALL: f64 = 0.3;

/// Responsiveness below this raises an issue
const RESPONSIVENESS_ISSUE: f64 = 0.5;

/// Performance below this raises an issue
const PERFORMANCE_ISSUE: f64 = 0.6;

/// Resource headroom below this raises an issue
const RESOURCE_ISSUE: f64 = 0.4;

/// Upper bound on retained open issues per snapshot
const MAX_OPEN_ISSUES: usize = 8;

/// Severity of a derived health issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Informational
    Low,

    /// Worth watching
    Medium,

    /// Needs attention
    High,

    /// Needs intervention now
    Critical,
}

/// One derived health issue
#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    /// How bad it is
    pub severity: IssueSeverity,

    /// What was observed
    pub message: String,

    /// When the scan derived it
    pub detected_at: DateTime<Utc>,
}

/// Direction the overall score is moving in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    /// Score rose since the previous scan
    Improving,

    /// Score held steady
    Stable,

    /// Score fell since the previous scan
    Degrading,
}

/// Periodically recomputed health of one agent
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Mean of the four component scores, in [0,1]
    pub overall: f64,

    /// How recently the agent was heard from
    pub responsiveness: f64,

    /// Recent execution time against the expected baseline
    pub performance: f64,

    /// Completed / (completed + failed)
    pub reliability: f64,

    /// Headroom under the configured resource ceilings
    pub resource_usage: f64,

    /// Movement since the previous scan
    pub trend: HealthTrend,

    /// Open issues, bounded
    pub issues: Vec<HealthIssue>,

    /// Completion time of the scan that produced this snapshot
    pub last_check: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Placeholder recorded when scoring an agent failed
    fn failed_scan(now: DateTime<Utc>, message: String) -> Self {
        Self {
            overall: 0.0,
            responsiveness: 0.0,
            performance: 0.0,
            reliability: 0.0,
            resource_usage: 0.0,
            trend: HealthTrend::Degrading,
            issues: vec![HealthIssue {
                severity: IssueSeverity::Critical,
                message,
                detected_at: now,
            }],
            last_check: now,
        }
    }
}

/// Why the monitor wants an agent restarted
#[derive(Debug, Clone)]
pub enum RestartReason {
    /// No activity within three heartbeat intervals
    HeartbeatTimeout {
        /// Milliseconds since last activity
        idle_ms: u64,
    },

    /// Overall health fell below [`CRITICAL_OVERALL`]
    CriticalHealth {
        /// The deciding score
        score: f64,
    },
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartbeatTimeout { idle_ms } => {
                write!(f, "heartbeat timeout after {idle_ms} ms")
            }
            Self::CriticalHealth { score } => {
                write!(f, "critical health score {score:.2}")
            }
        }
    }
}

/// A restart recommendation surfaced to the manager
#[derive(Debug, Clone)]
pub struct RestartRequest {
    /// The unhealthy agent
    pub agent_id: AgentId,

    /// The deciding observation
    pub reason: RestartReason,
}

/// Monitor tuning knobs
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Cadence of the heartbeat scan
    pub heartbeat_interval: Duration,

    /// Cadence of the composite-health scan
    pub health_check_interval: Duration,

    /// Whether unhealthy agents should be restarted
    pub auto_restart: bool,

    /// Resource ceilings for the resource score
    pub resource_limits: ResourceLimits,

    /// Baseline for the performance score
    pub expected_execution_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(10_000),
            health_check_interval: Duration::from_millis(30_000),
            auto_restart: true,
            resource_limits: ResourceLimits::default(),
            expected_execution_ms: EXPECTED_EXECUTION_MS,
        }
    }
}

// ==============================================================================
// Scoring
// ==============================================================================

/// Responsiveness from time since last activity
pub fn responsiveness_score(idle: Duration, heartbeat_interval: Duration) -> f64 {
    if idle < heartbeat_interval * 2 {
        1.0
    } else if idle < heartbeat_interval * 3 {
        0.5
    } else {
        0.0
    }
}

/// Performance from recent execution times against the expected baseline
pub fn performance_score(average_recent_ms: Option<f64>, expected_ms: u64) -> f64 {
    match average_recent_ms {
        Some(average) if average > 0.0 => (expected_ms as f64 / average).clamp(0.0, 1.0),
        _ => 1.0,
    }
}

/// Reliability from lifetime task counters
pub fn reliability_score(completed: u64, failed: u64) -> f64 {
    let total = completed + failed;
    if total == 0 {
        1.0
    } else {
        completed as f64 / total as f64
    }
}

/// Resource headroom under the configured ceilings
pub fn resource_score(usage: &ResourceSnapshot, limits: &ResourceLimits) -> Result<f64> {
    if limits.cpu <= 0.0 || limits.memory == 0 || limits.disk == 0 {
        return Err(OrchestratorError::Validation(
            "resource limits must be positive".into(),
        ));
    }
    let cpu = (1.0 - usage.cpu / limits.cpu).clamp(0.0, 1.0);
    let memory = (1.0 - usage.memory as f64 / limits.memory as f64).clamp(0.0, 1.0);
    let disk = (1.0 - usage.disk as f64 / limits.disk as f64).clamp(0.0, 1.0);
    Ok((cpu + memory + disk) / 3.0)
}

fn compute_snapshot(
    snapshot: &AgentSnapshot,
    config: &HealthConfig,
    previous_overall: Option<f64>,
    now: DateTime<Utc>,
) -> Result<HealthSnapshot> {
    let idle = (now - snapshot.record.last_activity)
        .to_std()
        .unwrap_or(Duration::ZERO);

    let responsiveness = responsiveness_score(idle, config.heartbeat_interval);
    let performance = performance_score(
        snapshot.record.average_recent_duration_ms(),
        config.expected_execution_ms,
    );
    let reliability = reliability_score(
        snapshot.record.tasks_completed,
        snapshot.record.tasks_failed,
    );
    let resource_usage = resource_score(&snapshot.record.resources, &config.resource_limits)?;
    let overall = (responsiveness + performance + reliability + resource_usage) / 4.0;

    let mut issues = Vec::new();
    if responsiveness < RESPONSIVENESS_ISSUE {
        issues.push(HealthIssue {
            severity: if responsiveness == 0.0 {
                IssueSeverity::Critical
            } else {
                IssueSeverity::High
            },
            message: format!("unresponsive for {} ms", idle.as_millis()),
            detected_at: now,
        });
    }
    if performance < PERFORMANCE_ISSUE {
        issues.push(HealthIssue {
            severity: IssueSeverity::Medium,
            message: format!("slow execution (performance {performance:.2})"),
            detected_at: now,
        });
    }
    if resource_usage < RESOURCE_ISSUE {
        issues.push(HealthIssue {
            severity: if resource_usage < 0.2 {
                IssueSeverity::High
            } else {
                IssueSeverity::Medium
            },
            message: format!("resource pressure (headroom {resource_usage:.2})"),
            detected_at: now,
        });
    }
    if overall < CRITICAL_OVERALL {
        issues.push(HealthIssue {
            severity: IssueSeverity::Critical,
            message: format!("overall health {overall:.2} below critical threshold"),
            detected_at: now,
        });
    }
    if matches!(snapshot.status, AgentStatus::Error | AgentStatus::Crashed) {
        issues.push(HealthIssue {
            severity: IssueSeverity::Critical,
            message: format!("agent is {}", snapshot.status),
            detected_at: now,
        });
    }
    issues.truncate(MAX_OPEN_ISSUES);

    let trend = match previous_overall {
        Some(previous) if overall > previous + 0.05 => HealthTrend::Improving,
        Some(previous) if overall < previous - 0.05 => HealthTrend::Degrading,
        _ => HealthTrend::Stable,
    };

    Ok(HealthSnapshot {
        overall,
        responsiveness,
        performance,
        reliability,
        resource_usage,
        trend,
        issues,
        last_check: now,
    })
}

// ==============================================================================
// Monitor
// ==============================================================================

/// Periodically scores every live agent and surfaces restart requests
pub struct HealthMonitor {
    supervisor: ProcessSupervisor,
    bus: Arc<EventBus>,
    snapshots: Arc<RwLock<HashMap<AgentId, HealthSnapshot>>>,
    restart_tx: mpsc::UnboundedSender<RestartRequest>,
    config: HealthConfig,
    cancel: CancellationToken,
}

impl HealthMonitor {
    /// Monitor over `supervisor`, plus the receiving end of its restart
    /// requests
    pub fn new(
        supervisor: ProcessSupervisor,
        bus: Arc<EventBus>,
        config: HealthConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RestartRequest>) {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        (
            Self {
                supervisor,
                bus,
                snapshots: Arc::new(RwLock::new(HashMap::new())),
                restart_tx,
                config,
                cancel: CancellationToken::new(),
            },
            restart_rx,
        )
    }

    /// Start both scans; they run until [`HealthMonitor::stop`]
    pub fn start(&self) {
        let monitor = self.clone_parts();
        let heartbeat_every = self.config.heartbeat_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.heartbeat_scan().await,
                }
            }
        });

        let monitor = self.clone_parts();
        let check_every = self.config.health_check_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.health_scan().await,
                }
            }
        });
    }

    /// Stop both scans
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Latest snapshot for one agent
    pub async fn snapshot(&self, agent_id: &AgentId) -> Option<HealthSnapshot> {
        self.snapshots.read().await.get(agent_id).cloned()
    }

    /// Latest snapshot for every tracked agent
    pub async fn all_snapshots(&self) -> HashMap<AgentId, HealthSnapshot> {
        self.snapshots.read().await.clone()
    }

    /// Drop the snapshot of a removed agent
    pub async fn forget(&self, agent_id: &AgentId) {
        self.snapshots.write().await.remove(agent_id);
    }

    fn clone_parts(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            bus: Arc::clone(&self.bus),
            snapshots: Arc::clone(&self.snapshots),
            restart_tx: self.restart_tx.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// One pass of the heartbeat scan
    pub async fn heartbeat_scan(&self) {
        let now = Utc::now();
        let window = self.config.heartbeat_interval * 3;

        for snapshot in self.supervisor.snapshot().await {
            if snapshot.status != AgentStatus::Running {
                continue;
            }
            let idle = (now - snapshot.record.last_activity)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle <= window {
                continue;
            }

            let idle_ms = idle.as_millis() as u64;
            warn!(agent = %snapshot.agent_id, idle_ms, "heartbeat timeout");
            self.bus.emit(SystemEvent::AgentHeartbeatTimeout {
                agent_id: snapshot.agent_id.clone(),
                idle_ms,
            });
            self.supervisor
                .flag_error(
                    &snapshot.agent_id,
                    format!("heartbeat timeout after {idle_ms} ms"),
                )
                .await;

            if self.config.auto_restart {
                let _ = self.restart_tx.send(RestartRequest {
                    agent_id: snapshot.agent_id.clone(),
                    reason: RestartReason::HeartbeatTimeout { idle_ms },
                });
            }
        }
    }

    /// One pass of the composite-health scan
    pub async fn health_scan(&self) {
        let now = Utc::now();
        let agents = self.supervisor.snapshot().await;

        let mut snapshots = self.snapshots.write().await;
        snapshots.retain(|agent_id, _| agents.iter().any(|a| &a.agent_id == agent_id));

        for agent in agents {
            let previous = snapshots.get(&agent.agent_id).map(|s| s.overall);
            let health = match compute_snapshot(&agent, &self.config, previous, now) {
                Ok(health) => health,
                Err(err) => {
                    // A failed per-agent scan never aborts the sweep.
                    warn!(agent = %agent.agent_id, "health scan failed: {err}");
                    HealthSnapshot::failed_scan(now, format!("health scan failed: {err}"))
                }
            };

            debug!(
                agent = %agent.agent_id,
                overall = health.overall,
                trend = ?health.trend,
                "health scored"
            );

            if health.overall < CRITICAL_OVERALL
                && agent.status == AgentStatus::Running
                && self.config.auto_restart
            {
                warn!(
                    agent = %agent.agent_id,
                    score = health.overall,
                    "critical health; requesting restart"
                );
                let _ = self.restart_tx.send(RestartRequest {
                    agent_id: agent.agent_id.clone(),
                    reason: RestartReason::CriticalHealth {
                        score: health.overall,
                    },
                });
            }

            snapshots.insert(agent.agent_id, health);
        }
    }
}
