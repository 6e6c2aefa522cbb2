//! Supervisor lifecycle integration tests
//!
//! Drives the process supervisor against the real `mock-agent` child.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use synapse::agents::{AgentId, AgentStatus};
use synapse::dispatch::PendingTasks;
use synapse::error::ErrorKind;
use synapse::events::EventBus;
use synapse::supervisor::{ProcessSupervisor, SupervisorConfig, restart_backoff};

use common::{mock_agent_bin, mock_agent_config};

fn supervisor_with_bus() -> (ProcessSupervisor, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new());
    let supervisor = ProcessSupervisor::new(
        SupervisorConfig {
            shutdown_grace: Duration::from_millis(1_000),
            kill_grace: Duration::from_millis(1_000),
            auto_restart: true,
        },
        Arc::new(PendingTasks::new()),
        Arc::clone(&bus),
    );
    (supervisor, bus)
}

#[tokio::test]
async fn test_create_spawns_running_agent() {
    let (supervisor, bus) = supervisor_with_bus();

    let agent_id = supervisor
        .create(mock_agent_config("sup-a1", &["--heartbeat-ms", "100"]))
        .await
        .unwrap();
    assert_eq!(agent_id, AgentId::from_string("sup-a1"));
    assert_eq!(supervisor.status(&agent_id).await, Some(AgentStatus::Running));

    let record = supervisor.record(&agent_id).await.unwrap();
    assert!(record.pid > 0);
    assert_eq!(record.restart_count, 0);
    assert_eq!(bus.history_named("agent:started").len(), 1);

    supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_id_is_conflict() {
    let (supervisor, _bus) = supervisor_with_bus();

    let agent_id = supervisor
        .create(mock_agent_config("sup-dup", &[]))
        .await
        .unwrap();
    let err = supervisor
        .create(mock_agent_config("sup-dup", &[]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_spawn_error_leaves_agent_in_error_state() {
    let (supervisor, bus) = supervisor_with_bus();

    let mut config = mock_agent_config("sup-broken", &[]);
    config.command = "/nonexistent/agent-binary".to_string();
    let err = supervisor.create(config).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Process);

    let agent_id = AgentId::from_string("sup-broken");
    assert_eq!(supervisor.status(&agent_id).await, Some(AgentStatus::Error));
    assert_eq!(bus.history_named("agent:error").len(), 1);
    // No restart is scheduled for spawn failures
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(supervisor.status(&agent_id).await, Some(AgentStatus::Error));
}

#[tokio::test]
async fn test_graceful_stop_emits_stopped_and_exited() {
    let (supervisor, bus) = supervisor_with_bus();

    let agent_id = supervisor
        .create(mock_agent_config("sup-stop", &["--heartbeat-ms", "100"]))
        .await
        .unwrap();

    // The mock agent honours the shutdown command, so no signal is needed.
    supervisor.stop(&agent_id, false).await.unwrap();
    assert_eq!(supervisor.status(&agent_id).await, Some(AgentStatus::Stopped));

    // Manager-initiated clean exits report both events, exactly once.
    assert_eq!(bus.history_named("agent:stopped").len(), 1);
    assert_eq!(bus.history_named("agent:exited").len(), 1);

    // stop is idempotent on a stopped agent
    supervisor.stop(&agent_id, false).await.unwrap();
    supervisor.stop(&agent_id, true).await.unwrap();
    assert_eq!(bus.history_named("agent:exited").len(), 1);
}

#[tokio::test]
async fn test_force_stop_kills_unwilling_child() {
    let (supervisor, _bus) = supervisor_with_bus();

    // Force skips the voluntary-shutdown phase and goes straight to signals.
    let agent_id = supervisor
        .create(mock_agent_config("sup-force", &["--mode", "silent"]))
        .await
        .unwrap();
    supervisor.stop(&agent_id, true).await.unwrap();
    assert_eq!(supervisor.status(&agent_id).await, Some(AgentStatus::Stopped));
}

#[tokio::test]
async fn test_crash_triggers_backoff_restart() {
    let (supervisor, bus) = supervisor_with_bus();
    let scratch = TempDir::new().unwrap();
    let marker = scratch.path().join("crash-once");

    // First run crashes with 137 after ~100 ms; the respawned process finds
    // the marker and behaves like a healthy echo agent.
    let agent_id = supervisor
        .create(mock_agent_config(
            "sup-crash",
            &[
                "--crash-marker",
                marker.to_str().unwrap(),
                "--delay-ms",
                "100",
                "--exit-code",
                "137",
                "--heartbeat-ms",
                "100",
            ],
        ))
        .await
        .unwrap();

    assert!(
        wait_for!(2_000, {
            supervisor.status(&agent_id).await == Some(AgentStatus::Crashed)
        }),
        "agent should crash"
    );
    let exited = bus.history_named("agent:exited");
    assert_eq!(exited.len(), 1);
    assert!(bus.history_named("agent:restarted").is_empty());

    // Backoff for the first restart is one second.
    assert_eq!(restart_backoff(0), Duration::from_millis(1_000));
    assert!(
        wait_for!(3_000, {
            supervisor.status(&agent_id).await == Some(AgentStatus::Running)
        }),
        "agent should restart after backoff"
    );

    let record = supervisor.record(&agent_id).await.unwrap();
    assert_eq!(record.restart_count, 1);
    assert_eq!(bus.history_named("agent:restarted").len(), 1);
    // agent:started was re-emitted for the new process
    assert_eq!(bus.history_named("agent:started").len(), 2);

    // Observed status walk: running -> crashed -> starting -> running
    let transitions: Vec<(AgentStatus, AgentStatus)> = bus
        .history_named("agent:status-changed")
        .into_iter()
        .filter_map(|record| match record.event {
            synapse::events::SystemEvent::AgentStatusChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert!(transitions.contains(&(AgentStatus::Running, AgentStatus::Crashed)));
    assert!(transitions.contains(&(AgentStatus::Crashed, AgentStatus::Starting)));
    assert!(transitions.contains(&(AgentStatus::Starting, AgentStatus::Running)));

    supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_manual_restart_increments_restart_count_once() {
    let (supervisor, bus) = supervisor_with_bus();

    let agent_id = supervisor
        .create(mock_agent_config("sup-restart", &["--heartbeat-ms", "100"]))
        .await
        .unwrap();
    let before = supervisor.record(&agent_id).await.unwrap().restart_count;

    supervisor.restart(&agent_id).await.unwrap();
    assert_eq!(supervisor.status(&agent_id).await, Some(AgentStatus::Running));

    let after = supervisor.record(&agent_id).await.unwrap().restart_count;
    assert_eq!(after, before + 1);
    assert_eq!(bus.history_named("agent:restarted").len(), 1);

    supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_send_message_requires_running_agent() {
    let (supervisor, _bus) = supervisor_with_bus();

    let agent_id = supervisor
        .create(mock_agent_config("sup-send", &[]))
        .await
        .unwrap();
    supervisor.stop(&agent_id, true).await.unwrap();

    let message = synapse::protocol::WireMessage::new(
        synapse::protocol::MessageKind::Command,
        serde_json::json!({ "command": "status" }),
    );
    let err = supervisor.send_message(&agent_id, &message).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let ghost = AgentId::from_string("sup-ghost");
    let err = supervisor.send_message(&ghost, &message).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_remove_drops_supervisor_state() {
    let (supervisor, _bus) = supervisor_with_bus();

    let agent_id = supervisor
        .create(mock_agent_config("sup-remove", &[]))
        .await
        .unwrap();
    supervisor.stop(&agent_id, true).await.unwrap();
    supervisor.remove(&agent_id).await.unwrap();

    assert!(supervisor.status(&agent_id).await.is_none());
    let err = supervisor.remove(&agent_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // The id is free for a fresh create with a reset restart count.
    let agent_id = supervisor
        .create(mock_agent_config("sup-remove", &[]))
        .await
        .unwrap();
    assert_eq!(supervisor.record(&agent_id).await.unwrap().restart_count, 0);
    supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_mock_agent_binary_exists() {
    assert!(std::path::Path::new(&mock_agent_bin()).exists());
}
