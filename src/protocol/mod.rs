//! Child-process wire protocol
//!
//! Agents exchange UTF-8, newline-terminated JSON objects with the runtime
//! over their standard streams. Every object is a [`WireMessage`] envelope;
//! the `data` field carries the typed payload for the message kind. A
//! receiver must tolerate arbitrary non-JSON lines by recording them as log
//! output and proceeding, which [`parse_line`] encodes in its return type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Kind tag of a wire message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Outbound: a task request for the child
    Task,

    /// Outbound: a control command for the child
    Command,

    /// Inbound: a task result from the child
    Result,

    /// Inbound: a resource usage report
    Status,

    /// Inbound: liveness signal
    Heartbeat,

    /// Inbound: child-reported error
    Error,
}

/// Envelope shared by every message on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Unique message id
    pub id: String,

    /// Message kind tag
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// ISO-8601 emission timestamp
    pub timestamp: DateTime<Utc>,

    /// Kind-specific payload
    pub data: Value,

    /// Correlates a response to the message that caused it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Sender identity, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Receiver identity, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl WireMessage {
    /// Build an envelope of the given kind around a serialized payload
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            data,
            correlation_id: None,
            from: None,
            to: None,
        }
    }

    /// Envelope carrying a task request
    pub fn task(request: &TaskRequest) -> Result<Self> {
        Ok(Self::new(MessageKind::Task, serde_json::to_value(request)?))
    }

    /// Envelope carrying a control command
    pub fn command(command: AgentCommand) -> Result<Self> {
        Ok(Self::new(
            MessageKind::Command,
            serde_json::to_value(&command)?,
        ))
    }

    /// Envelope carrying a task result (used by test children)
    pub fn result(result: &TaskResult) -> Result<Self> {
        Ok(Self::new(MessageKind::Result, serde_json::to_value(result)?))
    }

    /// Serialize to a single newline-terminated line
    ///
    /// Multiple messages per line must never be emitted; one call produces
    /// exactly one line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode the payload as a task result
    pub fn task_result(&self) -> Result<TaskResult> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| OrchestratorError::Validation(format!("malformed result payload: {e}")))
    }

    /// Decode the payload as a status report
    pub fn status_report(&self) -> Result<StatusReport> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| OrchestratorError::Validation(format!("malformed status payload: {e}")))
    }
}

/// Classification of one line read from a child's stdout
#[derive(Debug, Clone)]
pub enum InboundLine {
    /// A well-formed wire message
    Message(Box<WireMessage>),

    /// Anything that did not parse as a message; recorded as log output
    Log(String),
}

/// Classify a raw stdout line
pub fn parse_line(line: &str) -> InboundLine {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(msg) = serde_json::from_str::<WireMessage>(trimmed) {
            return InboundLine::Message(Box::new(msg));
        }
    }
    InboundLine::Log(line.to_string())
}

/// Control commands the runtime sends to a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum AgentCommand {
    /// Request a voluntary exit
    Shutdown,

    /// Request an immediate status report
    Status,
}

/// File operation attached to a task request or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    /// Read an existing file
    Read,

    /// Overwrite an existing file
    Write,

    /// Create a new file
    Create,

    /// Delete a file
    Delete,
}

/// A file the task touches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path relative to the agent's working directory
    pub path: String,

    /// File content, where the operation carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// What to do with the file
    pub operation: FileOperation,
}

/// A unit of work submitted to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Task id; responses are correlated by it
    pub id: String,

    /// Free-form type tag (`research`, `coding`, ...)
    #[serde(rename = "type")]
    pub task_type: String,

    /// Human description of the work
    pub description: String,

    /// Structured requirements, opaque to the runtime
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub requirements: Value,

    /// Files the task should touch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileSpec>>,

    /// Ids of tasks this one depends on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,

    /// Per-task timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Scheduling priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl TaskRequest {
    /// Minimal request with a generated id
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            description: description.into(),
            requirements: Value::Null,
            files: None,
            dependencies: None,
            timeout: None,
            priority: None,
        }
    }

    /// Same request with a fixed id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Same request with a per-task timeout
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one task, reported by the child
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Id of the task this result answers
    pub task_id: String,

    /// Whether the task succeeded
    pub success: bool,

    /// Arbitrary result payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error description when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Files produced or modified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileSpec>>,

    /// Wall-clock duration in milliseconds
    pub duration: u64,

    /// Tokens consumed, for model-backed agents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Resource usage reported by a child through a `status` message
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// CPU usage as a fraction of one core
    pub cpu: f64,

    /// Resident memory in bytes
    pub memory: u64,

    /// Disk usage in bytes
    pub disk: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_message_round_trip() {
        let request = TaskRequest::new("echo", "say hi").with_id("t1");
        let msg = WireMessage::task(&request).unwrap();
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        match parse_line(line.trim_end()) {
            InboundLine::Message(parsed) => {
                assert_eq!(parsed.kind, MessageKind::Task);
                let decoded: TaskRequest = serde_json::from_value(parsed.data.clone()).unwrap();
                assert_eq!(decoded.id, "t1");
                assert_eq!(decoded.task_type, "echo");
            }
            InboundLine::Log(_) => panic!("expected a parsed message"),
        }
    }

    #[test]
    fn test_result_payload_uses_camel_case() {
        let result = TaskResult {
            task_id: "t1".into(),
            success: true,
            result: None,
            error: None,
            files: None,
            duration: 5,
            tokens_used: Some(12),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["tokensUsed"], 12);
        assert!(value.get("task_id").is_none());
    }

    #[test]
    fn test_non_json_lines_become_log_output() {
        match parse_line("some stray print from the child") {
            InboundLine::Log(raw) => assert!(raw.contains("stray")),
            InboundLine::Message(_) => panic!("expected log classification"),
        }

        // JSON that is not a valid envelope is still log output, not an error
        match parse_line(r#"{"unexpected": true}"#) {
            InboundLine::Log(_) => {}
            InboundLine::Message(_) => panic!("expected log classification"),
        }
    }

    #[test]
    fn test_command_payload_shape() {
        let msg = WireMessage::command(AgentCommand::Shutdown).unwrap();
        assert_eq!(msg.data["command"], "shutdown");
        assert_eq!(msg.kind, MessageKind::Command);
    }

    #[test]
    fn test_envelope_timestamp_is_iso8601() {
        let msg = WireMessage::new(MessageKind::Heartbeat, Value::Null);
        let value = serde_json::to_value(&msg).unwrap();
        let raw = value["timestamp"].as_str().unwrap();
        assert!(raw.contains('T'));
        assert!(DateTime::parse_from_rfc3339(raw).is_ok());
    }
}
