//! Pool & scaling engine
//!
//! Keeps sized pools of interchangeable agents of one template within
//! configured bounds, moves members between the free and busy lists as
//! tasks are assigned and completed, and computes scaling decisions under
//! the configured policy. The engine owns only pool bookkeeping: member
//! processes are created and removed by the manager acting on the plans
//! produced here, so the engine never holds a reference back to it.

pub mod template;

pub use template::{Template, TemplateConfig, TemplateEnvironment, TemplateRegistry};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::agents::AgentId;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, SystemEvent};

/// Unique identifier for a pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(String);

impl PoolId {
    /// Create a new unique pool ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from string (for deserialization/testing)
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Size bounds and scaling thresholds of one pool
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Lower bound on pool size
    pub min_size: usize,

    /// Upper bound on pool size
    pub max_size: usize,

    /// Whether the scaling sweep may adjust this pool
    pub auto_scale: bool,

    /// Utilisation above which the sweep grows the pool
    pub scale_up_threshold: f64,

    /// Utilisation below which the sweep shrinks the pool
    pub scale_down_threshold: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            auto_scale: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
        }
    }
}

impl PoolSettings {
    /// Reject inverted bounds and out-of-range thresholds
    pub fn validate(&self) -> Result<()> {
        if self.min_size > self.max_size {
            return Err(OrchestratorError::Validation(format!(
                "pool min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if !(0.0..=1.0).contains(&self.scale_up_threshold)
            || !(0.0..=1.0).contains(&self.scale_down_threshold)
        {
            return Err(OrchestratorError::Validation(
                "scaling thresholds must lie in [0,1]".into(),
            ));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(OrchestratorError::Validation(
                "scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        Ok(())
    }
}

/// Policy driving the implicit scaling sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Whether the sweep runs at all
    pub enabled: bool,

    /// Window between sweeps
    pub cooldown: Duration,

    /// Members added or removed per adjustment
    pub amount: usize,

    /// Upper bound on adjustments per sweep
    pub max_scale_operations: usize,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: Duration::from_secs(300),
            amount: 1,
            max_scale_operations: 3,
        }
    }
}

/// One sized group of interchangeable agents
#[derive(Debug, Clone, Serialize)]
pub struct AgentPool {
    /// Pool id
    pub id: PoolId,

    /// Pool name
    pub name: String,

    /// Name of the template members are instantiated from
    pub template: String,

    /// Size bounds and thresholds
    pub settings: PoolSettings,

    /// Members awaiting work
    pub free: Vec<AgentId>,

    /// Members currently assigned work
    pub busy: Vec<AgentId>,
}

impl AgentPool {
    /// Current size: `|free| + |busy|`
    pub fn current_size(&self) -> usize {
        self.free.len() + self.busy.len()
    }

    /// Fraction of members currently busy; zero for an empty pool
    pub fn utilisation(&self) -> f64 {
        let size = self.current_size();
        if size == 0 {
            0.0
        } else {
            self.busy.len() as f64 / size as f64
        }
    }
}

/// Scaling decision for one pool, produced by the sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add this many members
    Grow(usize),

    /// Remove this many free members
    Shrink(usize),
}

/// Pool bookkeeping and scaling decisions
pub struct PoolEngine {
    pools: RwLock<HashMap<PoolId, AgentPool>>,
    templates: TemplateRegistry,
    bus: Arc<EventBus>,
    policy: ScalingPolicy,
}

impl PoolEngine {
    /// Engine over the given template registry and event bus
    pub fn new(templates: TemplateRegistry, bus: Arc<EventBus>, policy: ScalingPolicy) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            templates,
            bus,
            policy,
        }
    }

    /// The template registry members are instantiated from
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// The scaling policy in effect
    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Register a pool whose initial members were already provisioned
    pub async fn register_pool(
        &self,
        name: impl Into<String>,
        template: impl Into<String>,
        settings: PoolSettings,
        members: Vec<AgentId>,
    ) -> Result<PoolId> {
        settings.validate()?;
        let name = name.into();
        let pool = AgentPool {
            id: PoolId::new(),
            name: name.clone(),
            template: template.into(),
            settings,
            free: members,
            busy: Vec::new(),
        };
        let pool_id = pool.id.clone();

        info!(pool = %pool_id, name = %name, size = pool.current_size(), "pool created");
        self.pools.write().await.insert(pool_id.clone(), pool);
        self.bus.emit(SystemEvent::PoolCreated {
            pool_id: pool_id.to_string(),
            name,
        });
        Ok(pool_id)
    }

    /// Current state of one pool
    pub async fn pool(&self, pool_id: &PoolId) -> Result<AgentPool> {
        self.pools
            .read()
            .await
            .get(pool_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "pool",
                id: pool_id.to_string(),
            })
    }

    /// Current state of every pool
    pub async fn pools(&self) -> Vec<AgentPool> {
        self.pools.read().await.values().cloned().collect()
    }

    /// Drop a pool from the engine, returning its last state
    pub async fn remove_pool(&self, pool_id: &PoolId) -> Result<AgentPool> {
        self.pools
            .write()
            .await
            .remove(pool_id)
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "pool",
                id: pool_id.to_string(),
            })
    }

    /// Validate an explicit scale target against the pool bounds
    ///
    /// Returns `(current_size, delta)`. The pool is left unchanged; a target
    /// outside `[min,max]` fails without side effects.
    pub async fn validate_target(&self, pool_id: &PoolId, target: usize) -> Result<(usize, i64)> {
        let pools = self.pools.read().await;
        let pool = pools.get(pool_id).ok_or_else(|| OrchestratorError::NotFound {
            entity: "pool",
            id: pool_id.to_string(),
        })?;

        if target < pool.settings.min_size || target > pool.settings.max_size {
            return Err(OrchestratorError::Capacity(format!(
                "target {target} outside [{}, {}] for pool {}",
                pool.settings.min_size, pool.settings.max_size, pool.name
            )));
        }
        let current = pool.current_size();
        Ok((current, target as i64 - current as i64))
    }

    /// Commit a shrink: take up to `count` members off the free list
    ///
    /// Busy members are never taken; the returned ids are the caller's to
    /// stop and remove.
    pub async fn take_free(&self, pool_id: &PoolId, count: usize) -> Result<Vec<AgentId>> {
        let mut pools = self.pools.write().await;
        let pool = pools.get_mut(pool_id).ok_or_else(|| OrchestratorError::NotFound {
            entity: "pool",
            id: pool_id.to_string(),
        })?;

        let take = count.min(pool.free.len());
        let taken = pool.free.split_off(pool.free.len() - take);
        Ok(taken)
    }

    /// Commit a grow: append newly provisioned members to the free list
    pub async fn add_members(&self, pool_id: &PoolId, members: Vec<AgentId>) -> Result<()> {
        let mut pools = self.pools.write().await;
        let pool = pools.get_mut(pool_id).ok_or_else(|| OrchestratorError::NotFound {
            entity: "pool",
            id: pool_id.to_string(),
        })?;
        pool.free.extend(members);
        Ok(())
    }

    /// Emit the scaled event for a completed adjustment
    pub async fn note_scaled(&self, pool_id: &PoolId, from: usize) -> Result<usize> {
        let to = self.pool(pool_id).await?.current_size();
        if to != from {
            info!(pool = %pool_id, from, to, "pool scaled");
            self.bus.emit(SystemEvent::PoolScaled {
                pool_id: pool_id.to_string(),
                from,
                to,
            });
        }
        Ok(to)
    }

    /// Move one free member to the busy list and hand it out
    pub async fn checkout(&self, pool_id: &PoolId) -> Result<Option<AgentId>> {
        let mut pools = self.pools.write().await;
        let pool = pools.get_mut(pool_id).ok_or_else(|| OrchestratorError::NotFound {
            entity: "pool",
            id: pool_id.to_string(),
        })?;

        match pool.free.pop() {
            Some(agent_id) => {
                pool.busy.push(agent_id.clone());
                Ok(Some(agent_id))
            }
            None => Ok(None),
        }
    }

    /// Return a busy member to the free list
    pub async fn checkin(&self, pool_id: &PoolId, agent_id: &AgentId) -> Result<()> {
        let mut pools = self.pools.write().await;
        let pool = pools.get_mut(pool_id).ok_or_else(|| OrchestratorError::NotFound {
            entity: "pool",
            id: pool_id.to_string(),
        })?;

        match pool.busy.iter().position(|id| id == agent_id) {
            Some(index) => {
                let agent_id = pool.busy.remove(index);
                pool.free.push(agent_id);
                Ok(())
            }
            None => Err(OrchestratorError::NotFound {
                entity: "agent",
                id: agent_id.to_string(),
            }),
        }
    }

    /// Drop a removed agent from whichever pool holds it
    pub async fn detach_agent(&self, agent_id: &AgentId) -> Option<PoolId> {
        let mut pools = self.pools.write().await;
        for (pool_id, pool) in pools.iter_mut() {
            if let Some(index) = pool.free.iter().position(|id| id == agent_id) {
                pool.free.remove(index);
                return Some(pool_id.clone());
            }
            if let Some(index) = pool.busy.iter().position(|id| id == agent_id) {
                pool.busy.remove(index);
                return Some(pool_id.clone());
            }
        }
        None
    }

    /// Scaling decisions for the current sweep, bounded by the policy
    pub async fn scaling_decisions(&self) -> Vec<(PoolId, ScaleDecision)> {
        if !self.policy.enabled {
            return Vec::new();
        }

        let pools = self.pools.read().await;
        let mut decisions = Vec::new();
        for (pool_id, pool) in pools.iter() {
            if !pool.settings.auto_scale {
                continue;
            }
            if decisions.len() >= self.policy.max_scale_operations {
                break;
            }

            let current = pool.current_size();
            let utilisation = pool.utilisation();
            if utilisation > pool.settings.scale_up_threshold && current < pool.settings.max_size {
                let amount = self.policy.amount.min(pool.settings.max_size - current);
                decisions.push((pool_id.clone(), ScaleDecision::Grow(amount)));
            } else if utilisation < pool.settings.scale_down_threshold
                && current > pool.settings.min_size
            {
                let amount = self
                    .policy
                    .amount
                    .min(current - pool.settings.min_size)
                    .min(pool.free.len());
                if amount > 0 {
                    decisions.push((pool_id.clone(), ScaleDecision::Shrink(amount)));
                }
            }
        }
        decisions
    }
}
