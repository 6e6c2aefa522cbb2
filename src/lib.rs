//! Synapse - Agent Orchestration Runtime
//!
//! Synapse supervises a dynamic population of long-running worker
//! subprocesses ("agents"), routes typed work items ("tasks") to them over
//! a newline-delimited JSON stdio protocol, monitors their health, and
//! scales pools of interchangeable agents up and down under load.
//!
//! # Architecture
//!
//! - `agents` - Agent identity, type catalogue and configuration
//! - `protocol` - Child-process wire protocol (NDJSON envelopes)
//! - `events` - Typed event bus with bounded history
//! - `persistence` - Embedded SQLite store for durable records
//! - `supervisor` - Child-process lifecycle, streams and restart backoff
//! - `dispatch` - Task submission and response correlation
//! - `health` - Heartbeat and composite-health scans
//! - `pool` - Pools of interchangeable agents, templates and scaling
//! - `manager` - The facade tying the subsystems together

#![warn(missing_docs)]

pub mod agents;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod manager;
pub mod persistence;
pub mod pool;
pub mod protocol;
pub mod supervisor;

pub use agents::{AgentConfig, AgentId, AgentStatus, AgentType};
pub use config::ManagerConfig;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use events::{EventBus, SystemEvent};
pub use manager::{AgentInfo, AgentManager, ManagerStats};
pub use persistence::{SqliteStore, Storage};
pub use pool::{PoolId, PoolSettings, ScalingPolicy};
pub use protocol::{TaskRequest, TaskResult};

/// Synapse version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
