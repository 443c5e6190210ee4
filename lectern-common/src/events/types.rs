//! Event value types carried by the EventBus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of event published on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Agent invocation began
    AgentStart,
    /// Agent invocation finished successfully
    AgentDone,
    /// Agent invocation failed
    AgentError,
    /// Overall/stage progress update
    Progress,
    /// Run reached `completed`
    RunCompleted,
    /// Run reached `failed`
    RunFailed,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::AgentStart,
        EventType::AgentDone,
        EventType::AgentError,
        EventType::Progress,
        EventType::RunCompleted,
        EventType::RunFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStart => "agent_start",
            EventType::AgentDone => "agent_done",
            EventType::AgentError => "agent_error",
            EventType::Progress => "progress",
            EventType::RunCompleted => "run_completed",
            EventType::RunFailed => "run_failed",
        }
    }

    /// Terminal run notifications
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::RunCompleted | EventType::RunFailed)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription key: one event type, or every type (wildcard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    Only(EventType),
    Any,
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::Only(t) => *t == event_type,
            EventFilter::Any => true,
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(event_type: EventType) -> Self {
        EventFilter::Only(event_type)
    }
}

/// Immutable record of one agent lifecycle or progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_type: EventType,
    /// Publishing agent (or "pipeline" / "progress" for run-level events)
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl AgentEvent {
    pub fn new(
        agent_name: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Map<String, serde_json::Value>,
        pipeline_id: Option<Uuid>,
    ) -> Self {
        Self {
            event_type,
            agent_name: agent_name.into(),
            timestamp: Utc::now(),
            pipeline_id,
            payload,
        }
    }

    /// Payload value as f64, if present and numeric
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }
}

/// Build a payload map from a `serde_json::json!({...})` object value
///
/// Non-object values are stored under `"value"`.
pub fn payload(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
