//! Typed event bus with bounded history
//!
//! Lifecycle notifications travel between subsystems as a closed set of
//! [`SystemEvent`] variants over a broadcast channel. Each bus instance
//! keeps a bounded ring of recent events for diagnostics; entries are
//! dropped once the ring is full or once they age past the retention
//! window. Delivery is per-receiver, so a failing subscriber never blocks
//! the others. Construction and teardown are explicit so tests can use a
//! fresh instance per case.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use crate::agents::{AgentId, AgentStatus};

/// Stream of event records handed to subscribers
pub type EventStream = Pin<Box<dyn Stream<Item = EventRecord> + Send + 'static>>;

/// Default bound on retained history entries
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Default retention window for history entries
pub const DEFAULT_HISTORY_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Closed set of lifecycle notifications
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SystemEvent {
    /// An agent record was created and its process spawned
    AgentCreated {
        /// The new agent
        agent_id: AgentId,
    },

    /// An agent transitioned to running
    AgentStarted {
        /// The started agent
        agent_id: AgentId,
    },

    /// A manager-initiated stop completed
    AgentStopped {
        /// The stopped agent
        agent_id: AgentId,
    },

    /// An agent entered the error state
    AgentError {
        /// The failing agent
        agent_id: AgentId,
        /// Why it failed
        message: String,
    },

    /// The OS reported an agent process exit
    AgentExited {
        /// The exited agent
        agent_id: AgentId,
        /// Exit code, when the OS reported one
        code: Option<i32>,
    },

    /// A crashed or unhealthy agent was restarted
    AgentRestarted {
        /// The restarted agent
        agent_id: AgentId,
        /// Restart count after this restart
        restart_count: u32,
    },

    /// An agent was removed by the operator
    AgentRemoved {
        /// The removed agent
        agent_id: AgentId,
    },

    /// An agent moved between lifecycle states
    AgentStatusChanged {
        /// The agent in question
        agent_id: AgentId,
        /// Previous status
        from: AgentStatus,
        /// New status
        to: AgentStatus,
    },

    /// The heartbeat scan found a silent agent
    AgentHeartbeatTimeout {
        /// The silent agent
        agent_id: AgentId,
        /// Milliseconds since its last activity
        idle_ms: u64,
    },

    /// A pool was created
    PoolCreated {
        /// Pool id
        pool_id: String,
        /// Pool name
        name: String,
    },

    /// A pool changed size
    PoolScaled {
        /// Pool id
        pool_id: String,
        /// Size before
        from: usize,
        /// Size after
        to: usize,
    },

    /// A dispatched task completed successfully
    TaskCompleted {
        /// Task id
        task_id: String,
        /// Executing agent
        agent_id: AgentId,
        /// Reported duration in milliseconds
        duration_ms: u64,
    },

    /// A dispatched task failed
    TaskFailed {
        /// Task id
        task_id: String,
        /// Executing agent
        agent_id: AgentId,
        /// Failure description
        error: String,
    },
}

impl SystemEvent {
    /// Stable event name, usable as a subscription filter
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentCreated { .. } => "agent:created",
            Self::AgentStarted { .. } => "agent:started",
            Self::AgentStopped { .. } => "agent:stopped",
            Self::AgentError { .. } => "agent:error",
            Self::AgentExited { .. } => "agent:exited",
            Self::AgentRestarted { .. } => "agent:restarted",
            Self::AgentRemoved { .. } => "agent:removed",
            Self::AgentStatusChanged { .. } => "agent:status-changed",
            Self::AgentHeartbeatTimeout { .. } => "agent:heartbeat-timeout",
            Self::PoolCreated { .. } => "pool:created",
            Self::PoolScaled { .. } => "pool:scaled",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
        }
    }
}

/// One delivered event with its emission time
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// The event payload
    pub event: SystemEvent,

    /// When it was emitted
    pub timestamp: DateTime<Utc>,
}

/// In-process publish/subscribe facility with bounded history
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
    history: Mutex<VecDeque<EventRecord>>,
    capacity: usize,
    retention: Duration,
}

impl EventBus {
    /// Bus with the default history bounds
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_RETENTION)
    }

    /// Bus with explicit history bounds
    pub fn with_limits(capacity: usize, retention: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            retention,
        }
    }

    /// Publish an event to all subscribers and the history ring
    pub fn emit(&self, event: SystemEvent) {
        let record = EventRecord {
            event,
            timestamp: Utc::now(),
        };
        debug!(event = record.event.name(), "emitting event");

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(record.clone());
            Self::prune(&mut history, self.capacity, self.retention);
        }

        // A send error only means there are no live receivers right now;
        // the history ring still records the event.
        let _ = self.tx.send(record);
    }

    /// Subscribe to all subsequent events
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream; a lagging subscriber skips missed entries
    /// without disturbing anyone else
    pub fn stream(&self) -> EventStream {
        let rx = self.tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|result| async move {
            match result {
                Ok(record) => Some(record),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("event subscriber lagged by {n} events");
                    None
                }
            }
        }))
    }

    /// Subscribe to events matching one name only
    pub fn stream_named(&self, name: &'static str) -> EventStream {
        Box::pin(
            self.stream()
                .filter(move |record| futures::future::ready(record.event.name() == name)),
        )
    }

    /// Retained history, oldest first
    pub fn history(&self) -> Vec<EventRecord> {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        Self::prune(&mut history, self.capacity, self.retention);
        history.iter().cloned().collect()
    }

    /// Retained history entries whose event name matches `name`
    pub fn history_named(&self, name: &str) -> Vec<EventRecord> {
        self.history()
            .into_iter()
            .filter(|r| r.event.name() == name)
            .collect()
    }

    /// Drop all retained history
    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn prune(history: &mut VecDeque<EventRecord>, capacity: usize, retention: Duration) {
        while history.len() > capacity {
            history.pop_front();
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        while history
            .front()
            .is_some_and(|record| record.timestamp < cutoff)
        {
            history.pop_front();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_started(n: usize) -> SystemEvent {
        SystemEvent::AgentStarted {
            agent_id: AgentId::from_string(format!("agent-{n}")),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(agent_started(1));

        let record = rx.recv().await.unwrap();
        assert_eq!(record.event.name(), "agent:started");
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let bus = EventBus::with_limits(5, Duration::from_secs(3600));
        for n in 0..20 {
            bus.emit(agent_started(n));
        }

        let history = bus.history();
        assert_eq!(history.len(), 5);
        // Oldest entries were dropped first
        match &history[0].event {
            SystemEvent::AgentStarted { agent_id } => {
                assert_eq!(agent_id.as_str(), "agent-15");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_history_respects_retention_window() {
        let bus = EventBus::with_limits(100, Duration::from_secs(0));
        bus.emit(agent_started(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(bus.history().is_empty());
    }

    #[test]
    fn test_history_filter_by_name() {
        let bus = EventBus::new();
        bus.emit(agent_started(1));
        bus.emit(SystemEvent::TaskFailed {
            task_id: "t1".into(),
            agent_id: AgentId::from_string("agent-1"),
            error: "boom".into(),
        });

        assert_eq!(bus.history_named("task:failed").len(), 1);
        assert_eq!(bus.history_named("agent:started").len(), 1);
        assert!(bus.history_named("pool:created").is_empty());
    }

    #[tokio::test]
    async fn test_stream_filters_by_event_name() {
        let bus = EventBus::new();
        let mut failures = bus.stream_named("task:failed");

        bus.emit(agent_started(1));
        bus.emit(SystemEvent::TaskFailed {
            task_id: "t9".into(),
            agent_id: AgentId::from_string("agent-1"),
            error: "boom".into(),
        });

        let record = failures.next().await.unwrap();
        match record.event {
            SystemEvent::TaskFailed { task_id, .. } => assert_eq!(task_id, "t9"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let _stalled = bus.subscribe(); // never polled
        let mut live = bus.subscribe();

        bus.emit(agent_started(1));
        let record = live.recv().await.unwrap();
        assert_eq!(record.event.name(), "agent:started");
    }
}
