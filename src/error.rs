//! Error taxonomy for the orchestration runtime
//!
//! Every user-visible operation returns a typed failure from this module.
//! Callers can distinguish a timeout from a cancellation from a process exit
//! by matching on the variant or by comparing [`ErrorKind`]s.

use std::time::Duration;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Discriminant of an [`OrchestratorError`], for assertions and dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Agent, task, template or pool does not exist
    NotFound,

    /// Duplicate id or illegal state transition
    Conflict,

    /// An admission limit was exceeded
    Capacity,

    /// An operation timed out
    Timeout,

    /// A pending operation was cancelled (agent stopping, shutdown)
    Cancelled,

    /// A child process exited
    ProcessExit,

    /// Spawn or stream-level process failure
    Process,

    /// No activity observed within the heartbeat window
    HeartbeatTimeout,

    /// Malformed configuration or request
    Validation,

    /// Durable write failed (non-fatal to the live session)
    Persistence,
}

/// Errors produced by the orchestration runtime
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Agent, task, template or pool does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity looked up (agent, task, template, pool)
        entity: &'static str,
        /// The id or name that missed
        id: String,
    },

    /// Duplicate id or illegal state transition
    #[error("conflict: {0}")]
    Conflict(String),

    /// An admission limit was exceeded
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// An operation timed out
    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    /// A pending operation was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A child process exited while work was outstanding
    #[error("process exited with code {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ProcessExit {
        /// Exit code reported by the OS, if any
        code: Option<i32>,
    },

    /// Spawn or stream-level process failure
    #[error("process error: {0}")]
    Process(String),

    /// No activity observed within the heartbeat window
    #[error("heartbeat timeout: no activity for {idle_ms} ms")]
    HeartbeatTimeout {
        /// Milliseconds since the last observed activity
        idle_ms: u64,
    },

    /// Malformed configuration or request
    #[error("validation failed: {0}")]
    Validation(String),

    /// Durable write failed
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl OrchestratorError {
    /// Shorthand for a [`OrchestratorError::NotFound`] about an agent
    pub fn agent_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "agent",
            id: id.into(),
        }
    }

    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Capacity(_) => ErrorKind::Capacity,
            Self::Timeout(_, _) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::ProcessExit { .. } => ErrorKind::ProcessExit,
            Self::Process(_) => ErrorKind::Process,
            Self::HeartbeatTimeout { .. } => ErrorKind::HeartbeatTimeout,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinguishable() {
        let timeout = OrchestratorError::Timeout(Duration::from_millis(10), "task t1".into());
        let cancelled = OrchestratorError::Cancelled("agent stopping".into());
        let exited = OrchestratorError::ProcessExit { code: Some(137) };

        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(exited.kind(), ErrorKind::ProcessExit);
        assert_ne!(timeout.kind(), cancelled.kind());
    }

    #[test]
    fn test_process_exit_message_carries_code() {
        let err = OrchestratorError::ProcessExit { code: Some(137) };
        assert!(err.to_string().contains("137"));

        let unknown = OrchestratorError::ProcessExit { code: None };
        assert!(unknown.to_string().contains("unknown"));
    }
}
