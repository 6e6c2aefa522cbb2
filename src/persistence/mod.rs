//! Durable state for agent and task records
//!
//! A single embedded SQLite database backs the durable slice of the
//! runtime: agent records, task records and terminal sessions. The
//! [`Storage`] trait is the seam the manager writes through; the SQLite
//! implementation lives in [`sqlite`]. It is the only component that
//! survives a process restart.

pub mod records;
pub mod sqlite;

pub use records::{AgentRecord, SessionRecord, TaskRecord, TaskStatus};
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::agents::{AgentId, PersistedAgentStatus};
use crate::error::Result;

/// Write-through store for durable runtime state
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace an agent record
    async fn save_agent(&self, record: &AgentRecord) -> Result<()>;

    /// Fetch one agent record
    async fn get_agent(&self, id: &AgentId) -> Result<Option<AgentRecord>>;

    /// Fetch every agent record, including removed ones
    async fn all_agents(&self) -> Result<Vec<AgentRecord>>;

    /// Update the durable status of an agent
    async fn update_agent_status(&self, id: &AgentId, status: PersistedAgentStatus) -> Result<()>;

    /// Insert or replace a task record
    async fn save_task(&self, record: &TaskRecord) -> Result<()>;

    /// Fetch one task record
    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>>;

    /// Fetch every task currently in `status`
    async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>>;

    /// Update a task's progress percentage
    async fn update_task_progress(&self, id: &str, progress: i64) -> Result<()>;

    /// Finalise a task: set its terminal status, error and completion time
    async fn finish_task(&self, id: &str, status: TaskStatus, error: Option<&str>) -> Result<()>;

    /// Insert or replace a terminal session record
    async fn save_session(&self, record: &SessionRecord) -> Result<()>;

    /// Fetch the sessions attached to one agent
    async fn sessions_for_agent(&self, agent_id: &AgentId) -> Result<Vec<SessionRecord>>;
}
