//! Durable record shapes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::{AgentConfig, AgentId, AgentType, PersistedAgentStatus};

/// Durable slice of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent id
    pub id: AgentId,

    /// Type tag
    pub agent_type: AgentType,

    /// Human-readable name
    pub name: String,

    /// Durable status (`active | idle | offline | removed`)
    pub status: PersistedAgentStatus,

    /// Capability tags, stored as a JSON array
    pub capabilities: Vec<String>,

    /// System prompt in effect at creation
    pub system_prompt: String,

    /// Concurrency bound in effect at creation
    pub max_concurrent_tasks: i64,

    /// Scheduling priority
    pub priority: i64,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Build the durable record for a freshly created agent
    pub fn from_config(id: &AgentId, config: &AgentConfig) -> Self {
        Self {
            id: id.clone(),
            agent_type: config.agent_type,
            name: config.name.clone(),
            status: PersistedAgentStatus::Active,
            capabilities: config.capabilities.clone(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| config.agent_type.default_system_prompt().to_string()),
            max_concurrent_tasks: config.max_concurrent_tasks as i64,
            priority: config.priority,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle status of a durable task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet handed to an agent
    Pending,

    /// Handed to an agent
    Assigned,

    /// The agent reported progress
    InProgress,

    /// Finished successfully
    Completed,

    /// Finished unsuccessfully
    Failed,

    /// Withdrawn before completion
    Cancelled,
}

impl TaskStatus {
    /// Stable string tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted tag; unknown tags read back as `Pending`
    pub fn parse(tag: &str) -> Self {
        match tag {
            "assigned" => Self::Assigned,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// Durable record of one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task id
    pub id: String,

    /// Free-form type tag
    pub task_type: String,

    /// Human description
    pub description: String,

    /// Lifecycle status
    pub status: TaskStatus,

    /// Scheduling priority
    pub priority: i64,

    /// Ids of tasks this one depends on, stored as CSV
    pub dependencies: Vec<String>,

    /// Opaque metadata blob, stored as JSON
    pub metadata: Value,

    /// Agent the task was handed to, if any
    pub assigned_agent: Option<String>,

    /// Progress percentage, 0-100
    pub progress: i64,

    /// Failure description for failed tasks
    pub error: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Completion time for terminal tasks
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Fresh pending record
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: 5,
            dependencies: Vec::new(),
            metadata: Value::Null,
            assigned_agent: None,
            progress: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Durable record of one terminal session attached to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id
    pub id: String,

    /// Owning agent
    pub agent_id: AgentId,

    /// Terminal identifier supplied by the embedder
    pub terminal_id: String,

    /// Session status tag
    pub status: String,

    /// Creation time
    pub created_at: DateTime<Utc>,
}
