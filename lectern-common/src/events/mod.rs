//! Event system for agent lifecycle and progress notifications
//!
//! The EventBus is an explicitly constructed, cloneable handle. One instance
//! is created at startup and passed to the scheduler, the progress tracker
//! and any observers.

mod types;

pub use types::{payload, AgentEvent, EventFilter, EventType};

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Error returned by a subscriber callback
///
/// Logged by the bus and never propagated to the publisher.
#[derive(Debug, Error)]
#[error("subscriber failed: {0}")]
pub struct SubscriberError(pub String);

impl SubscriberError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Observer registered on the bus
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &AgentEvent) -> Result<(), SubscriberError>;
}

impl<F> EventSubscriber for F
where
    F: Fn(&AgentEvent) -> Result<(), SubscriberError> + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent) -> Result<(), SubscriberError> {
        self(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    filter: EventFilter,
    subscriber: Arc<dyn EventSubscriber>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Registration>,
    history: VecDeque<AgentEvent>,
    pipeline_logs: HashMap<Uuid, Vec<AgentEvent>>,
}

/// Central distribution bus for agent events
///
/// All mutable state (subscriber list, global history, per-run logs) sits
/// behind one mutex. Callbacks run outside the lock on a snapshot of the
/// subscriber list, so a subscriber may itself publish or unsubscribe.
///
/// Events are additionally sent on a `tokio::broadcast` channel for async
/// consumers (`subscribe_stream`). That send is lossy.
///
/// # Examples
///
/// ```
/// use lectern_common::events::{EventBus, EventFilter, EventType};
///
/// let bus = EventBus::new(100);
/// bus.subscribe(EventFilter::Any, |e| {
///     println!("{} {}", e.agent_name, e.event_type);
///     Ok(())
/// });
/// bus.publish("vision", EventType::AgentStart, serde_json::Map::new(), None);
/// assert_eq!(bus.get_history(10, None, None).len(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    tx: broadcast::Sender<AgentEvent>,
    capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus retaining at most `capacity` events in global history
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            tx,
            capacity,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panic while holding the lock cannot leave BusState half-updated
        // in a way that matters to readers, so recover the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish an event
    ///
    /// Appends to global history (evicting the oldest beyond capacity), to
    /// the per-run log when `pipeline_id` is set, then notifies subscribers
    /// registered for this type followed by wildcard subscribers.
    pub fn publish(
        &self,
        agent_name: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Map<String, serde_json::Value>,
        pipeline_id: Option<Uuid>,
    ) -> AgentEvent {
        let event = AgentEvent::new(agent_name, event_type, payload, pipeline_id);
        self.publish_event(event.clone());
        event
    }

    /// Publish an already constructed event
    pub fn publish_event(&self, event: AgentEvent) {
        let (typed, wildcard) = {
            let mut state = self.lock();
            state.history.push_back(event.clone());
            while state.history.len() > self.capacity {
                state.history.pop_front();
            }
            if let Some(id) = event.pipeline_id {
                state.pipeline_logs.entry(id).or_default().push(event.clone());
            }

            let mut typed = Vec::new();
            let mut wildcard = Vec::new();
            for reg in &state.subscribers {
                match reg.filter {
                    EventFilter::Only(t) if t == event.event_type => {
                        typed.push((reg.id, reg.subscriber.clone()))
                    }
                    EventFilter::Any => wildcard.push((reg.id, reg.subscriber.clone())),
                    _ => {}
                }
            }
            (typed, wildcard)
        };

        for (id, subscriber) in typed.into_iter().chain(wildcard) {
            notify(id, subscriber.as_ref(), &event);
        }

        let _ = self.tx.send(event);
    }

    /// Register a callback for one event type or the wildcard
    pub fn subscribe<F>(&self, filter: impl Into<EventFilter>, callback: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.subscribe_arc(filter, Arc::new(callback))
    }

    /// Register a shared subscriber object
    pub fn subscribe_arc(
        &self,
        filter: impl Into<EventFilter>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let filter = filter.into();
        self.lock().subscribers.push(Registration {
            id,
            filter,
            subscriber,
        });
        debug!(subscription = id.0, ?filter, "Subscriber registered");
        id
    }

    /// Remove a subscriber; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|reg| reg.id != id);
        before != state.subscribers.len()
    }

    /// Async stream of every event published after this call
    pub fn subscribe_stream(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Most recent `limit` events matching the filters, oldest first
    pub fn get_history(
        &self,
        limit: usize,
        agent_name: Option<&str>,
        event_type: Option<EventType>,
    ) -> Vec<AgentEvent> {
        let state = self.lock();
        let mut matched: Vec<AgentEvent> = state
            .history
            .iter()
            .rev()
            .filter(|e| agent_name.map_or(true, |name| e.agent_name == name))
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Complete event log of one run in publication order
    pub fn get_pipeline_events(&self, pipeline_id: Uuid) -> Vec<AgentEvent> {
        self.lock()
            .pipeline_logs
            .get(&pipeline_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop global history and every per-run log
    pub fn clear_history(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.pipeline_logs.clear();
    }

    /// Drop one run's event log
    pub fn forget_pipeline(&self, pipeline_id: Uuid) -> bool {
        self.lock().pipeline_logs.remove(&pipeline_id).is_some()
    }

    /// Number of registered callback subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Configured global history bound
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events currently held in global history
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn notify(id: SubscriptionId, subscriber: &dyn EventSubscriber, event: &AgentEvent) {
    match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            subscription = id.0,
            event_type = %event.event_type,
            agent = %event.agent_name,
            "Subscriber error ignored: {}",
            e
        ),
        Err(_) => warn!(
            subscription = id.0,
            event_type = %event.event_type,
            agent = %event.agent_name,
            "Subscriber panicked; continuing"
        ),
    }
}
