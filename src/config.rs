//! Manager Configuration
//!
//! Configuration record accepted by the agent manager, covering admission
//! limits, scan intervals, restart policy, resource ceilings and the
//! defaults applied to newly created agents.

use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Top-level configuration for the agent manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Hard cap on concurrent agents
    pub max_agents: usize,

    /// Default for stop/start operations
    pub default_timeout: Duration,

    /// Governs the heartbeat scan
    pub heartbeat_interval: Duration,

    /// Governs the composite-health scan
    pub health_check_interval: Duration,

    /// Restart crashed or critically unhealthy agents automatically
    pub auto_restart: bool,

    /// Grace window between a voluntary-shutdown request and SIGTERM
    pub shutdown_grace: Duration,

    /// Resource ceilings used by the health scorer
    pub resource_limits: ResourceLimits,

    /// Behavioural defaults for new agents
    pub agent_defaults: AgentDefaults,

    /// Filesystem and runtime defaults for new agents
    pub environment_defaults: EnvironmentDefaults,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_agents: 50,
            default_timeout: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_millis(10_000),
            health_check_interval: Duration::from_millis(30_000),
            auto_restart: true,
            shutdown_grace: Duration::from_secs(5),
            resource_limits: ResourceLimits::default(),
            agent_defaults: AgentDefaults::default(),
            environment_defaults: EnvironmentDefaults::default(),
        }
    }
}

impl ManagerConfig {
    /// Reject configurations the runtime cannot operate under
    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(OrchestratorError::Validation(
                "max_agents must be positive".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(OrchestratorError::Validation(
                "scan intervals must be positive".into(),
            ));
        }
        if self.resource_limits.cpu <= 0.0 {
            return Err(OrchestratorError::Validation(
                "resource_limits.cpu must be positive".into(),
            ));
        }
        if self.resource_limits.memory == 0 || self.resource_limits.disk == 0 {
            return Err(OrchestratorError::Validation(
                "resource_limits.memory and .disk must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Resource ceilings for health scoring
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    pub memory: u64,

    /// CPU ceiling as a fraction of one core
    pub cpu: f64,

    /// Disk ceiling in bytes
    pub disk: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: 512 * 1024 * 1024,
            cpu: 1.0,
            disk: 1024 * 1024 * 1024,
        }
    }
}

/// Behavioural defaults applied to newly created agents
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Autonomy level in [0,1]
    pub autonomy_level: f64,

    /// Whether agents may learn from completed work
    pub learning_enabled: bool,

    /// Whether agents may adapt their own configuration
    pub adaptation_enabled: bool,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            autonomy_level: 0.8,
            learning_enabled: true,
            adaptation_enabled: true,
        }
    }
}

/// Execution-environment defaults for newly created agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentDefaults {
    /// Program spawned when an agent config names no command
    pub runtime: String,

    /// Root under which per-agent working directories are created
    pub working_directory: PathBuf,

    /// Scratch space root
    pub temp_directory: PathBuf,

    /// Log output root
    pub log_directory: PathBuf,
}

impl Default for EnvironmentDefaults {
    fn default() -> Self {
        Self {
            runtime: String::from("agent-worker"),
            working_directory: PathBuf::from("./agents"),
            temp_directory: std::env::temp_dir(),
            log_directory: PathBuf::from("./logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_agents, 50);
        assert_eq!(config.default_timeout, Duration::from_millis(30_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(10_000));
        assert_eq!(config.health_check_interval, Duration::from_millis(30_000));
        assert!(config.auto_restart);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let mut config = ManagerConfig {
            max_agents: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.max_agents = 1;
        config.resource_limits.cpu = 0.0;
        assert!(config.validate().is_err());
    }
}
