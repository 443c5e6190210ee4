//! Integration tests for the EventBus
//!
//! Covers:
//! - FIFO-capped global history
//! - Typed and wildcard subscriber dispatch order
//! - Isolation of failing and panicking subscribers
//! - Per-run event logs and filtered history queries
//! - Broadcast stream delivery

use lectern_common::events::{
    payload, AgentEvent, EventBus, EventFilter, EventType, SubscriberError,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn publish_n(bus: &EventBus, n: usize) {
    for i in 0..n {
        bus.publish(
            format!("agent{}", i),
            EventType::Progress,
            payload(json!({ "seq": i })),
            None,
        );
    }
}

#[test]
fn test_history_never_exceeds_capacity() {
    // Given: a bus with capacity 5
    let bus = EventBus::new(5);

    // When: 12 events are published
    publish_n(&bus, 12);

    // Then: history holds exactly 5
    assert_eq!(bus.history_len(), 5);
    assert_eq!(bus.get_history(100, None, None).len(), 5);
}

#[test]
fn test_history_evicts_oldest_first() {
    let bus = EventBus::new(3);
    publish_n(&bus, 5);

    let seqs: Vec<u64> = bus
        .get_history(10, None, None)
        .iter()
        .map(|e| e.payload["seq"].as_u64().unwrap())
        .collect();

    // Oldest two (0, 1) evicted; remaining in publication order
    assert_eq!(seqs, vec![2, 3, 4]);
}

#[test]
fn test_get_history_returns_most_recent_matching() {
    let bus = EventBus::new(100);
    for i in 0..6 {
        let agent = if i % 2 == 0 { "vision" } else { "content" };
        bus.publish(agent, EventType::AgentDone, payload(json!({ "seq": i })), None);
    }
    bus.publish("vision", EventType::AgentError, payload(json!({ "seq": 6 })), None);

    let vision_done = bus.get_history(2, Some("vision"), Some(EventType::AgentDone));
    let seqs: Vec<u64> = vision_done
        .iter()
        .map(|e| e.payload["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![2, 4]);

    let errors = bus.get_history(10, None, Some(EventType::AgentError));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].agent_name, "vision");
}

#[test]
fn test_typed_subscribers_run_before_wildcard() {
    let bus = EventBus::new(10);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    bus.subscribe(EventFilter::Any, move |_| {
        o.lock().unwrap().push("wildcard");
        Ok(())
    });
    let o = order.clone();
    bus.subscribe(EventType::AgentStart, move |_| {
        o.lock().unwrap().push("typed");
        Ok(())
    });

    bus.publish("extractor", EventType::AgentStart, serde_json::Map::new(), None);

    assert_eq!(*order.lock().unwrap(), vec!["typed", "wildcard"]);
}

#[test]
fn test_failing_subscriber_does_not_block_others() {
    // Given: an erroring subscriber, a panicking subscriber, and a healthy one
    let bus = EventBus::new(10);
    let delivered = Arc::new(AtomicUsize::new(0));

    bus.subscribe(EventFilter::Any, |_| Err(SubscriberError::new("broken observer")));
    bus.subscribe(EventFilter::Any, |_| -> Result<(), SubscriberError> {
        panic!("observer blew up")
    });
    let d = delivered.clone();
    bus.subscribe(EventFilter::Any, move |_| {
        d.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    // When: two events are published
    bus.publish("vision", EventType::AgentStart, serde_json::Map::new(), None);
    bus.publish("vision", EventType::AgentDone, serde_json::Map::new(), None);

    // Then: the healthy subscriber saw both and history is intact
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(bus.history_len(), 2);
}

#[test]
fn test_pipeline_logs_are_kept_per_run() {
    let bus = EventBus::new(2);
    let run_a = Uuid::new_v4();
    let run_b = Uuid::new_v4();

    for _ in 0..4 {
        bus.publish("vision", EventType::AgentStart, serde_json::Map::new(), Some(run_a));
    }
    bus.publish("content", EventType::AgentDone, serde_json::Map::new(), Some(run_b));
    bus.publish("untagged", EventType::Progress, serde_json::Map::new(), None);

    // Per-run log is not bounded by global capacity
    assert_eq!(bus.get_pipeline_events(run_a).len(), 4);
    assert_eq!(bus.get_pipeline_events(run_b).len(), 1);
    assert!(bus.get_pipeline_events(Uuid::new_v4()).is_empty());

    assert!(bus.forget_pipeline(run_a));
    assert!(bus.get_pipeline_events(run_a).is_empty());

    bus.clear_history();
    assert_eq!(bus.history_len(), 0);
    assert!(bus.get_pipeline_events(run_b).is_empty());
}

#[test]
fn test_concurrent_publishers_respect_capacity() {
    let bus = EventBus::new(50);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bus = bus.clone();
            std::thread::spawn(move || publish_n(&bus, 100))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(bus.history_len(), 50);
}

#[tokio::test]
async fn test_stream_receives_published_events() {
    let bus = EventBus::new(10);
    let mut rx = bus.subscribe_stream();

    let run_id = Uuid::new_v4();
    bus.publish("extractor", EventType::AgentDone, payload(json!({"elapsed": 1.25})), Some(run_id));

    let event: AgentEvent = rx.recv().await.unwrap();
    assert_eq!(event.agent_name, "extractor");
    assert_eq!(event.pipeline_id, Some(run_id));
    assert_eq!(event.payload_f64("elapsed"), Some(1.25));
}
