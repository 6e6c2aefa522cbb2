//! Property tests for the pure parts of the runtime

use std::time::Duration;
use proptest::prelude::*;

use synapse::agents::ResourceSnapshot;
use synapse::config::ResourceLimits;
use synapse::events::{EventBus, SystemEvent};
use synapse::health::{
    performance_score, reliability_score, resource_score, responsiveness_score,
};
use synapse::supervisor::restart_backoff;

proptest! {
    #[test]
    fn prop_backoff_is_monotone_and_capped(count in 0u32..64) {
        let delay = restart_backoff(count);
        prop_assert!(delay >= Duration::from_millis(1_000));
        prop_assert!(delay <= Duration::from_millis(30_000));
        prop_assert!(restart_backoff(count + 1) >= delay);
    }

    #[test]
    fn prop_backoff_doubles_until_cap(count in 0u32..5) {
        let expected = (1_000u64 << count).min(30_000);
        prop_assert_eq!(restart_backoff(count), Duration::from_millis(expected));
    }

    #[test]
    fn prop_reliability_is_a_fraction(completed in 0u64..1_000_000, failed in 0u64..1_000_000) {
        let score = reliability_score(completed, failed);
        prop_assert!((0.0..=1.0).contains(&score));
        if failed == 0 {
            prop_assert_eq!(score, 1.0);
        }
    }

    #[test]
    fn prop_performance_is_clamped(average in proptest::option::of(0.0f64..10_000_000.0)) {
        let score = performance_score(average, 60_000);
        prop_assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn prop_responsiveness_is_a_step_function(idle_ms in 0u64..1_000_000) {
        let score = responsiveness_score(
            Duration::from_millis(idle_ms),
            Duration::from_millis(10_000),
        );
        prop_assert!(score == 0.0 || score == 0.5 || score == 1.0);
    }

    #[test]
    fn prop_resource_score_stays_in_unit_interval(
        cpu in 0.0f64..4.0,
        memory in 0u64..(4 << 30),
        disk in 0u64..(4 << 30),
    ) {
        let limits = ResourceLimits::default();
        let usage = ResourceSnapshot { cpu, memory, disk };
        let score = resource_score(&usage, &limits).unwrap();
        prop_assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn prop_event_history_never_exceeds_capacity(capacity in 1usize..50, emissions in 0usize..200) {
        let bus = EventBus::with_limits(capacity, Duration::from_secs(3_600));
        for n in 0..emissions {
            bus.emit(SystemEvent::AgentStarted {
                agent_id: synapse::agents::AgentId::from_string(format!("agent-{n}")),
            });
        }
        prop_assert!(bus.history().len() <= capacity);
        prop_assert_eq!(bus.history().len(), emissions.min(capacity));
    }
}
