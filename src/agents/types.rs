//! Core Agent Types and Data Structures

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new unique agent ID
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

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Classification of agent types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Server-side services and APIs
    Backend,

    /// Client-side interfaces
    Frontend,

    /// Information gathering and analysis
    Researcher,

    /// Code generation, modification, and refactoring
    Developer,

    /// Test generation, execution, and validation
    Tester,

    /// Code review and quality assessment
    Reviewer,

    /// System design and architecture planning
    Architect,

    /// General-purpose work
    General,
}

impl AgentType {
    /// Stable string tag, matching the wire and persistence encoding
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Researcher => "researcher",
            Self::Developer => "developer",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Architect => "architect",
            Self::General => "general",
        }
    }

    /// Parse a type tag; unknown tags fall back to `General`
    pub fn parse(tag: &str) -> Self {
        match tag {
            "backend" => Self::Backend,
            "frontend" => Self::Frontend,
            "researcher" => Self::Researcher,
            "developer" => Self::Developer,
            "tester" => Self::Tester,
            "reviewer" => Self::Reviewer,
            "architect" => Self::Architect,
            _ => Self::General,
        }
    }

    /// Default system prompt for agents of this type
    pub fn default_system_prompt(&self) -> &'static str {
        match self {
            Self::Backend => {
                "You are a backend agent. Implement and maintain server-side services, \
                 APIs and data pipelines assigned to you."
            }
            Self::Frontend => {
                "You are a frontend agent. Build and refine user-facing interfaces \
                 and client-side behaviour for the tasks assigned to you."
            }
            Self::Researcher => {
                "You are a research agent. Gather information, analyse sources and \
                 report findings for the tasks assigned to you."
            }
            Self::Developer => {
                "You are a developer agent. Write, modify and refactor code to \
                 complete the tasks assigned to you."
            }
            Self::Tester => {
                "You are a testing agent. Design and execute tests, and report \
                 defects found while validating the tasks assigned to you."
            }
            Self::Reviewer => {
                "You are a review agent. Assess submitted work for correctness and \
                 quality, and report actionable feedback."
            }
            Self::Architect => {
                "You are an architecture agent. Produce designs and technical plans \
                 for the systems described in the tasks assigned to you."
            }
            Self::General => {
                "You are a general-purpose agent. Complete the tasks assigned to you \
                 and report results."
            }
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volatile lifecycle status of an agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Process is being spawned
    Starting,

    /// Process is up and accepting tasks
    Running,

    /// Stop was requested; no new tasks accepted
    Stopping,

    /// Process exited cleanly
    Stopped,

    /// Spawn failed or restart budget exhausted
    Error,

    /// Process exited with a non-zero code
    Crashed,
}

impl AgentStatus {
    /// Whether the agent accepts new task submissions
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the process is gone (no live child behind this status)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error | Self::Crashed)
    }

    /// Stable string tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Crashed => "crashed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable status vocabulary used by the persistence layer
///
/// The richer volatile catalogue of [`AgentStatus`] is mapped down to this
/// set when a record is written through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedAgentStatus {
    /// Agent is live and accepting tasks
    Active,

    /// Agent exists but is not yet accepting tasks
    Idle,

    /// Agent process is down
    Offline,

    /// Agent was removed by the operator; terminal
    Removed,
}

impl PersistedAgentStatus {
    /// Stable string tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Offline => "offline",
            Self::Removed => "removed",
        }
    }

    /// Parse a persisted tag; unknown tags read back as `Offline`
    pub fn parse(tag: &str) -> Self {
        match tag {
            "active" => Self::Active,
            "idle" => Self::Idle,
            "removed" => Self::Removed,
            _ => Self::Offline,
        }
    }
}

impl From<AgentStatus> for PersistedAgentStatus {
    fn from(status: AgentStatus) -> Self {
        match status {
            AgentStatus::Starting => Self::Idle,
            AgentStatus::Running => Self::Active,
            AgentStatus::Stopping
            | AgentStatus::Stopped
            | AgentStatus::Error
            | AgentStatus::Crashed => Self::Offline,
        }
    }
}

/// Point-in-time resource usage of one agent process
///
/// The runtime treats the figures as externally supplied: children report
/// them through `status` messages and the health scorer consumes whatever
/// the supplier provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU usage as a fraction of one core
    pub cpu: f64,

    /// Resident memory in bytes
    pub memory: u64,

    /// Disk usage in bytes
    pub disk: u64,
}

/// Spawn-time configuration for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Explicit id; generated when absent
    pub id: Option<String>,

    /// Human-readable name
    pub name: String,

    /// Type tag from the fixed catalogue
    pub agent_type: AgentType,

    /// Optional free-text specialization
    pub specialization: Option<String>,

    /// Capability tags
    pub capabilities: Vec<String>,

    /// System prompt; defaulted from the type catalogue when absent
    pub system_prompt: Option<String>,

    /// Upper bound on concurrently pending tasks
    pub max_concurrent_tasks: usize,

    /// Scheduling priority
    pub priority: i64,

    /// Maximum memory budget in bytes
    pub max_memory_bytes: Option<u64>,

    /// Per-task timeout in milliseconds
    pub task_timeout_ms: u64,

    /// Working directory for the child process
    pub working_directory: Option<PathBuf>,

    /// Environment overrides applied on top of the parent environment
    pub environment: HashMap<String, String>,

    /// Program to spawn
    pub command: String,

    /// Arguments passed to the program
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: String::from("unnamed-agent"),
            agent_type: AgentType::General,
            specialization: None,
            capabilities: Vec::new(),
            system_prompt: None,
            max_concurrent_tasks: 3,
            priority: 5,
            max_memory_bytes: None,
            task_timeout_ms: 300_000,
            working_directory: None,
            environment: HashMap::new(),
            command: String::new(),
            args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_uniqueness() {
        let id1 = AgentId::new();
        let id2 = AgentId::new();
        assert_ne!(id1, id2);

        let fixed = AgentId::from_string("a1");
        assert_eq!(fixed.as_str(), "a1");
    }

    #[test]
    fn test_type_tags_round_trip() {
        for ty in [
            AgentType::Backend,
            AgentType::Frontend,
            AgentType::Researcher,
            AgentType::Developer,
            AgentType::Tester,
            AgentType::Reviewer,
            AgentType::Architect,
            AgentType::General,
        ] {
            assert_eq!(AgentType::parse(ty.as_str()), ty);
        }
        assert_eq!(AgentType::parse("no-such-type"), AgentType::General);
    }

    #[test]
    fn test_status_predicates() {
        assert!(AgentStatus::Running.accepts_tasks());
        assert!(!AgentStatus::Stopping.accepts_tasks());
        assert!(!AgentStatus::Starting.accepts_tasks());
        assert!(AgentStatus::Crashed.is_terminal());
        assert!(!AgentStatus::Running.is_terminal());
    }

    #[test]
    fn test_persisted_status_mapping() {
        assert_eq!(
            PersistedAgentStatus::from(AgentStatus::Running),
            PersistedAgentStatus::Active
        );
        assert_eq!(
            PersistedAgentStatus::from(AgentStatus::Starting),
            PersistedAgentStatus::Idle
        );
        assert_eq!(
            PersistedAgentStatus::from(AgentStatus::Crashed),
            PersistedAgentStatus::Offline
        );
    }

    #[test]
    fn test_every_type_has_a_prompt() {
        assert!(!AgentType::General.default_system_prompt().is_empty());
        assert!(AgentType::Researcher
            .default_system_prompt()
            .contains("research"));
    }
}
