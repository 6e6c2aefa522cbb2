//! SQLite-backed storage

use std::path::Path;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use super::records::{AgentRecord, SessionRecord, TaskRecord, TaskStatus};
use super::Storage;
use crate::agents::{AgentId, AgentType, PersistedAgentStatus};
use crate::error::{OrchestratorError, Result};

/// Embedded SQLite store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and run the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    /// Open an in-memory database, for tests and ephemeral embedders
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        // A second connection would see a different empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                max_concurrent_tasks INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                dependencies TEXT NOT NULL,
                metadata TEXT NOT NULL,
                assigned_agent TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                terminal_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(type)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_assigned_agent ON tasks(assigned_agent)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| OrchestratorError::Persistence(format!("invalid stored timestamp {ms}")))
}

fn agent_from_row(row: &SqliteRow) -> Result<AgentRecord> {
    let capabilities_json: String = row.get("capabilities");
    let capabilities: Vec<String> = serde_json::from_str(&capabilities_json)
        .map_err(|e| OrchestratorError::Persistence(format!("invalid capabilities column: {e}")))?;
    let type_tag: String = row.get("type");
    let status_tag: String = row.get("status");

    Ok(AgentRecord {
        id: AgentId::from_string(row.get::<String, _>("id")),
        agent_type: AgentType::parse(&type_tag),
        name: row.get("name"),
        status: PersistedAgentStatus::parse(&status_tag),
        capabilities,
        system_prompt: row.get("system_prompt"),
        max_concurrent_tasks: row.get("max_concurrent_tasks"),
        priority: row.get("priority"),
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord> {
    let dependencies_csv: String = row.get("dependencies");
    let dependencies = dependencies_csv
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let metadata_json: String = row.get("metadata");
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| OrchestratorError::Persistence(format!("invalid metadata column: {e}")))?;
    let status_tag: String = row.get("status");
    let completed_at = row
        .get::<Option<i64>, _>("completed_at")
        .map(from_millis)
        .transpose()?;

    Ok(TaskRecord {
        id: row.get("id"),
        task_type: row.get("type"),
        description: row.get("description"),
        status: TaskStatus::parse(&status_tag),
        priority: row.get("priority"),
        dependencies,
        metadata,
        assigned_agent: row.get("assigned_agent"),
        progress: row.get("progress"),
        error: row.get("error"),
        created_at: from_millis(row.get("created_at"))?,
        completed_at,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get("id"),
        agent_id: AgentId::from_string(row.get::<String, _>("agent_id")),
        terminal_id: row.get("terminal_id"),
        status: row.get("status"),
        created_at: from_millis(row.get("created_at"))?,
    })
}

#[async_trait]
impl Storage for SqliteStore {
    async fn save_agent(&self, record: &AgentRecord) -> Result<()> {
        let capabilities = serde_json::to_string(&record.capabilities)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO agents (id, type, name, status, capabilities, system_prompt,
                                max_concurrent_tasks, priority, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                name = excluded.name,
                status = excluded.status,
                capabilities = excluded.capabilities,
                system_prompt = excluded.system_prompt,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                priority = excluded.priority
            ",
        )
        .bind(record.id.as_str())
        .bind(record.agent_type.as_str())
        .bind(&record.name)
        .bind(record.status.as_str())
        .bind(&capabilities)
        .bind(&record.system_prompt)
        .bind(record.max_concurrent_tasks)
        .bind(record.priority)
        .bind(millis(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(agent_from_row).transpose()
    }

    async fn all_agents(&self) -> Result<Vec<AgentRecord>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(agent_from_row).collect()
    }

    async fn update_agent_status(&self, id: &AgentId, status: PersistedAgentStatus) -> Result<()> {
        let outcome = sqlx::query("UPDATE agents SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if outcome.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound {
                entity: "agent",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO tasks (id, type, description, status, priority, dependencies,
                               metadata, assigned_agent, progress, error, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                priority = excluded.priority,
                dependencies = excluded.dependencies,
                metadata = excluded.metadata,
                assigned_agent = excluded.assigned_agent,
                progress = excluded.progress,
                error = excluded.error,
                completed_at = excluded.completed_at
            ",
        )
        .bind(&record.id)
        .bind(&record.task_type)
        .bind(&record.description)
        .bind(record.status.as_str())
        .bind(record.priority)
        .bind(record.dependencies.join(","))
        .bind(&metadata)
        .bind(record.assigned_agent.as_deref())
        .bind(record.progress)
        .bind(record.error.as_deref())
        .bind(millis(record.created_at))
        .bind(record.completed_at.map(millis))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = ?1 ORDER BY priority DESC, created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn update_task_progress(&self, id: &str, progress: i64) -> Result<()> {
        let progress = progress.clamp(0, 100);
        sqlx::query("UPDATE tasks SET status = ?1, progress = ?2 WHERE id = ?3")
            .bind(TaskStatus::InProgress.as_str())
            .bind(progress)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_task(&self, id: &str, status: TaskStatus, error: Option<&str>) -> Result<()> {
        let progress = if status == TaskStatus::Completed { 100 } else { 0 };
        sqlx::query(
            r"
            UPDATE tasks
            SET status = ?1, error = ?2, completed_at = ?3,
                progress = MAX(progress, ?4)
            WHERE id = ?5
            ",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(millis(Utc::now()))
        .bind(progress)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sessions (id, agent_id, terminal_id, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                terminal_id = excluded.terminal_id,
                status = excluded.status
            ",
        )
        .bind(&record.id)
        .bind(record.agent_id.as_str())
        .bind(&record.terminal_id)
        .bind(&record.status)
        .bind(millis(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sessions_for_agent(&self, agent_id: &AgentId) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE agent_id = ?1 ORDER BY created_at")
            .bind(agent_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(session_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentConfig;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    fn sample_agent(id: &str) -> AgentRecord {
        let config = AgentConfig {
            name: format!("agent-{id}"),
            capabilities: vec!["research".into(), "analysis".into()],
            ..Default::default()
        };
        AgentRecord::from_config(&AgentId::from_string(id), &config)
    }

    #[tokio::test]
    async fn test_agent_round_trip() {
        let store = store().await;
        let record = sample_agent("a1");
        store.save_agent(&record).await.unwrap();

        let loaded = store
            .get_agent(&AgentId::from_string("a1"))
            .await
            .unwrap()
            .expect("agent should exist");
        assert_eq!(loaded.name, record.name);
        assert_eq!(loaded.capabilities, vec!["research", "analysis"]);
        assert_eq!(loaded.status, PersistedAgentStatus::Active);
        assert_eq!(loaded.max_concurrent_tasks, 3);
    }

    #[tokio::test]
    async fn test_update_status_of_missing_agent_is_not_found() {
        let store = store().await;
        let err = store
            .update_agent_status(&AgentId::from_string("ghost"), PersistedAgentStatus::Removed)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_task_round_trip_with_metadata_and_dependencies() {
        let store = store().await;
        let mut record = TaskRecord::new("t1", "research", "look things up");
        record.dependencies = vec!["t0".into(), "t-1".into()];
        record.metadata = json!({"depth": 3});
        record.assigned_agent = Some("a1".into());
        store.save_task(&record).await.unwrap();

        let loaded = store.get_task("t1").await.unwrap().expect("task exists");
        assert_eq!(loaded.dependencies, vec!["t0", "t-1"]);
        assert_eq!(loaded.metadata["depth"], 3);
        assert_eq!(loaded.assigned_agent.as_deref(), Some("a1"));
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_finish_task_sets_completion_fields() {
        let store = store().await;
        store
            .save_task(&TaskRecord::new("t1", "echo", "hi"))
            .await
            .unwrap();

        store
            .finish_task("t1", TaskStatus::Completed, None)
            .await
            .unwrap();
        let done = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());

        store
            .save_task(&TaskRecord::new("t2", "echo", "hi"))
            .await
            .unwrap();
        store
            .finish_task("t2", TaskStatus::Failed, Some("child exited"))
            .await
            .unwrap();
        let failed = store.get_task("t2").await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("child exited"));
    }

    #[tokio::test]
    async fn test_tasks_by_status_orders_by_priority() {
        let store = store().await;
        for (id, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            let mut record = TaskRecord::new(id, "work", "");
            record.priority = priority;
            store.save_task(&record).await.unwrap();
        }

        let pending = store.tasks_by_status(TaskStatus::Pending).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_sessions_attach_to_agent() {
        let store = store().await;
        store.save_agent(&sample_agent("a1")).await.unwrap();

        let session = SessionRecord {
            id: "s1".into(),
            agent_id: AgentId::from_string("a1"),
            terminal_id: "tty-7".into(),
            status: "open".into(),
            created_at: Utc::now(),
        };
        store.save_session(&session).await.unwrap();

        let sessions = store
            .sessions_for_agent(&AgentId::from_string("a1"))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].terminal_id, "tty-7");
    }
}
