//! Shared helpers for integration tests
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;
use synapse::agents::AgentConfig;
use synapse::config::ManagerConfig;

/// Path to the protocol-speaking test child
pub fn mock_agent_bin() -> String {
    env!("CARGO_BIN_EXE_mock-agent").to_string()
}

/// Agent config spawning the mock agent with the given arguments
pub fn mock_agent_config(id: &str, args: &[&str]) -> AgentConfig {
    AgentConfig {
        id: Some(id.to_string()),
        name: format!("{id}-worker"),
        command: mock_agent_bin(),
        args: args.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Manager config with intervals tightened for tests
pub fn fast_config(workdir: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.heartbeat_interval = Duration::from_millis(150);
    config.health_check_interval = Duration::from_millis(300);
    config.shutdown_grace = Duration::from_millis(800);
    config.environment_defaults.working_directory = workdir.to_path_buf();
    config.environment_defaults.runtime = mock_agent_bin();
    config
}

/// Poll `$cond` until it holds or `$window_ms` elapses; yields a bool
#[macro_export]
macro_rules! wait_for {
    ($window_ms:expr, $cond:expr) => {{
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis($window_ms);
        loop {
            if $cond {
                break true;
            }
            if std::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}
