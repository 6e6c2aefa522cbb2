//! Agent identity, catalogue and configuration
//!
//! Core data types describing a managed agent: its identifier, type tag,
//! volatile lifecycle status and spawn configuration.

pub mod types;

pub use types::{
    AgentConfig, AgentId, AgentStatus, AgentType, PersistedAgentStatus, ResourceSnapshot,
};
