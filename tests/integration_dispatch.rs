//! Dispatcher integration tests against the real mock-agent child

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use synapse::agents::{AgentId, AgentStatus};
use synapse::dispatch::{PendingTasks, TaskDispatcher};
use synapse::error::ErrorKind;
use synapse::events::EventBus;
use synapse::protocol::TaskRequest;
use synapse::supervisor::{ProcessSupervisor, SupervisorConfig};

use common::mock_agent_config;

struct Fixture {
    supervisor: ProcessSupervisor,
    dispatcher: TaskDispatcher,
    bus: Arc<EventBus>,
}

fn fixture() -> Fixture {
    let bus = Arc::new(EventBus::new());
    let pending = Arc::new(PendingTasks::new());
    let supervisor = ProcessSupervisor::new(
        SupervisorConfig {
            shutdown_grace: Duration::from_millis(1_000),
            kill_grace: Duration::from_millis(1_000),
            auto_restart: false,
        },
        Arc::clone(&pending),
        Arc::clone(&bus),
    );
    let dispatcher = TaskDispatcher::new(supervisor.clone(), pending, Arc::clone(&bus));
    Fixture {
        supervisor,
        dispatcher,
        bus,
    }
}

#[tokio::test]
async fn test_echo_task_completes_and_counts() {
    let f = fixture();
    let agent_id = f
        .supervisor
        .create(mock_agent_config("disp-echo", &["--heartbeat-ms", "100"]))
        .await
        .unwrap();

    let request = TaskRequest::new("echo", "hi").with_id("t1");
    let result = f.dispatcher.execute_task(&agent_id, request).await.unwrap();

    assert!(result.success);
    assert_eq!(result.task_id, "t1");
    assert_eq!(result.result.unwrap()["echo"], "hi");

    let record = f.supervisor.record(&agent_id).await.unwrap();
    assert_eq!(record.tasks_completed, 1);
    assert_eq!(record.tasks_failed, 0);
    assert_eq!(f.bus.history_named("task:completed").len(), 1);
    assert!(f.dispatcher.pending().is_empty());

    f.supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_failed_result_increments_failure_counter() {
    let f = fixture();
    let agent_id = f
        .supervisor
        .create(mock_agent_config("disp-fail", &["--mode", "fail"]))
        .await
        .unwrap();

    let result = f
        .dispatcher
        .execute_task(&agent_id, TaskRequest::new("work", "doomed").with_id("t1"))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("synthetic failure"));

    let record = f.supervisor.record(&agent_id).await.unwrap();
    assert_eq!(record.tasks_completed, 0);
    assert_eq!(record.tasks_failed, 1);
    assert_eq!(f.bus.history_named("task:failed").len(), 1);

    f.supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_timeout_leaves_child_running_and_pending_empty() {
    let f = fixture();
    let agent_id = f
        .supervisor
        .create(mock_agent_config(
            "disp-timeout",
            &["--mode", "silent", "--heartbeat-ms", "100"],
        ))
        .await
        .unwrap();

    let started = Instant::now();
    let err = f
        .dispatcher
        .execute_task(
            &agent_id,
            TaskRequest::new("echo", "never answered")
                .with_id("t2")
                .with_timeout_ms(50),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(f.dispatcher.pending().is_empty());
    // The child is not killed on task timeout.
    assert_eq!(
        f.supervisor.status(&agent_id).await,
        Some(AgentStatus::Running)
    );

    f.supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_concurrency_bound_is_enforced_at_dispatch() {
    let f = fixture();
    let mut config = mock_agent_config("disp-bound", &["--mode", "silent"]);
    config.max_concurrent_tasks = 1;
    let agent_id = f.supervisor.create(config).await.unwrap();

    // Park one submission against the silent child.
    let parked = tokio::spawn({
        let dispatcher = TaskDispatcher::new(
            f.supervisor.clone(),
            Arc::clone(f.dispatcher.pending()),
            Arc::clone(&f.bus),
        );
        let agent_id = agent_id.clone();
        async move {
            dispatcher
                .execute_task(
                    &agent_id,
                    TaskRequest::new("echo", "parked")
                        .with_id("b-1")
                        .with_timeout_ms(2_000),
                )
                .await
        }
    });

    // Give the first submission time to register its pending entry.
    assert!(wait_for!(1_000, {
        f.dispatcher.pending().count_for_agent(&agent_id) == 1
    }));

    // The second submission is over the bound and fails immediately.
    let err = f
        .dispatcher
        .execute_task(
            &agent_id,
            TaskRequest::new("echo", "rejected").with_id("b-2"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);

    // The parked call eventually times out against the silent child.
    let parked = parked.await.unwrap().unwrap_err();
    assert_eq!(parked.kind(), ErrorKind::Timeout);

    f.supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_interleaved_responses_match_by_id() {
    let f = fixture();
    let mut config = mock_agent_config(
        "disp-interleave",
        &["--mode", "slow", "--delay-ms", "100", "--heartbeat-ms", "100"],
    );
    config.max_concurrent_tasks = 3;
    let agent_id = f.supervisor.create(config).await.unwrap();

    // Three concurrent submissions with distinct ids; each must complete
    // with the result whose taskId matches its request.
    let (r1, r2, r3) = tokio::join!(
        f.dispatcher.execute_task(
            &agent_id,
            TaskRequest::new("echo", "payload-one").with_id("it-1")
        ),
        f.dispatcher.execute_task(
            &agent_id,
            TaskRequest::new("echo", "payload-two").with_id("it-2")
        ),
        f.dispatcher.execute_task(
            &agent_id,
            TaskRequest::new("echo", "payload-three").with_id("it-3")
        ),
    );

    let r1 = r1.unwrap();
    let r2 = r2.unwrap();
    let r3 = r3.unwrap();
    assert_eq!(r1.task_id, "it-1");
    assert_eq!(r1.result.unwrap()["echo"], "payload-one");
    assert_eq!(r2.task_id, "it-2");
    assert_eq!(r2.result.unwrap()["echo"], "payload-two");
    assert_eq!(r3.task_id, "it-3");
    assert_eq!(r3.result.unwrap()["echo"], "payload-three");

    let record = f.supervisor.record(&agent_id).await.unwrap();
    assert_eq!(record.tasks_completed, 3);

    f.supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_malformed_lines_do_not_lose_valid_messages() {
    let f = fixture();
    let agent_id = f
        .supervisor
        .create(mock_agent_config("disp-garbage", &["--mode", "garbage"]))
        .await
        .unwrap();

    // The garbage mode child emits junk before every valid result.
    for n in 0..3 {
        let result = f
            .dispatcher
            .execute_task(
                &agent_id,
                TaskRequest::new("echo", "still fine").with_id(format!("g-{n}")),
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    let record = f.supervisor.record(&agent_id).await.unwrap();
    assert_eq!(record.tasks_completed, 3);

    f.supervisor.stop(&agent_id, true).await.unwrap();
}

#[tokio::test]
async fn test_stopping_agent_cancels_pending_with_distinct_kind() {
    let f = fixture();
    let agent_id = f
        .supervisor
        .create(mock_agent_config("disp-cancel", &["--mode", "silent"]))
        .await
        .unwrap();

    let pending_call = tokio::spawn({
        let dispatcher = TaskDispatcher::new(
            f.supervisor.clone(),
            Arc::clone(f.dispatcher.pending()),
            Arc::clone(&f.bus),
        );
        let agent_id = agent_id.clone();
        async move {
            dispatcher
                .execute_task(
                    &agent_id,
                    TaskRequest::new("echo", "parked")
                        .with_id("c-1")
                        .with_timeout_ms(10_000),
                )
                .await
        }
    });

    assert!(wait_for!(1_000, {
        f.dispatcher.pending().count_for_agent(&agent_id) == 1
    }));

    f.supervisor.stop(&agent_id, false).await.unwrap();

    let err = pending_call.await.unwrap().unwrap_err();
    // Cancellation is distinguishable from a timeout.
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(f.dispatcher.pending().is_empty());
}

#[tokio::test]
async fn test_task_to_unknown_agent_is_not_found() {
    let f = fixture();
    let err = f
        .dispatcher
        .execute_task(
            &AgentId::from_string("nobody"),
            TaskRequest::new("echo", "hello"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
