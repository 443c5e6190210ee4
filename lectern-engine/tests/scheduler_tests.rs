//! Pipeline scheduler integration tests
//!
//! Registries of scripted agents exercise phase ordering, dependency
//! passing, fallback placeholders, fatal failures, panics and cancellation.

use async_trait::async_trait;
use lectern_common::events::{EventBus, EventType};
use lectern_engine::agents::{Agent, AgentDescriptor, AgentError, AgentInputs, AgentOutput, Phase};
use lectern_engine::models::{AgentState, RunStatus};
use lectern_engine::workflow::{AgentRegistry, PipelineScheduler, RunHandle, CANCELLED_MESSAGE};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
    WaitForCancel,
}

/// Agent whose outcome is fixed up front; records the inputs it saw
struct Scripted {
    descriptor: AgentDescriptor,
    behavior: Behavior,
    seen: Arc<Mutex<Vec<BTreeMap<String, AgentOutput>>>>,
}

impl Scripted {
    fn new(name: &str, phase: Phase, deps: &[&str], behavior: Behavior) -> Self {
        Self {
            descriptor: AgentDescriptor::new(name, name, phase).depends_on(deps.iter().copied()),
            behavior,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn tolerant(mut self, tolerant: bool) -> Self {
        self.descriptor = self.descriptor.fallback_tolerant(tolerant);
        self
    }

    fn seen(&self) -> Arc<Mutex<Vec<BTreeMap<String, AgentOutput>>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl Agent for Scripted {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn run(&self, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        self.seen.lock().unwrap().push(inputs.outputs.clone());
        match self.behavior {
            Behavior::Succeed => Ok(AgentOutput::summary(json!({
                "agent": self.descriptor.name,
                "inputs": inputs.outputs.keys().collect::<Vec<_>>(),
            }))),
            Behavior::Fail => Err(AgentError::failed(format!("{} exploded", self.descriptor.name))),
            Behavior::Panic => panic!("{} panicked", self.descriptor.name),
            Behavior::WaitForCancel => {
                inputs.cancel.cancelled().await;
                Err(AgentError::Cancelled)
            }
        }
    }
}

fn scheduler(registry: AgentRegistry) -> (PipelineScheduler, EventBus) {
    let bus = EventBus::new(1000);
    (PipelineScheduler::new(Arc::new(registry), bus.clone()), bus)
}

fn error_events_for(bus: &EventBus, run_id: uuid::Uuid, agent: &str) -> usize {
    bus.get_pipeline_events(run_id)
        .iter()
        .filter(|e| e.event_type == EventType::AgentError && e.agent_name == agent)
        .count()
}

#[tokio::test]
async fn test_failed_analyzer_degrades_but_run_completes() {
    let scorer = Scripted::new("scorer", Phase::Evaluate, &["vision", "content"], Behavior::Succeed);
    let scorer_seen = scorer.seen();
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("vision", Phase::Analyze, &["extractor"], Behavior::Fail))
        .register(Scripted::new("content", Phase::Analyze, &["extractor"], Behavior::Succeed))
        .register(scorer)
        .build()
        .unwrap();
    let (scheduler, bus) = scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.degraded_agents(), vec!["vision".to_string()]);
    assert_eq!(run.agent("vision").unwrap().state, AgentState::Error);
    assert_eq!(run.agent("scorer").unwrap().state, AgentState::Done);
    assert!((run.progress_percent - 100.0).abs() < 1e-9);

    // Scorer ran once, against a placeholder for vision and real content
    let seen = scorer_seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0]["vision"].is_placeholder());
    assert!(!seen[0]["content"].is_placeholder());
    assert!(!seen[0].contains_key("extractor"), "only declared dependencies are passed");

    assert_eq!(error_events_for(&bus, run.id, "vision"), 1);
    let events = bus.get_pipeline_events(run.id);
    assert_eq!(events.last().unwrap().event_type, EventType::RunCompleted);
}

#[tokio::test]
async fn test_sequential_failure_fails_run_and_skips_later_phases() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("vision", Phase::Analyze, &["extractor"], Behavior::Succeed))
        .register(Scripted::new("scorer", Phase::Evaluate, &["vision"], Behavior::Fail))
        .register(Scripted::new("report", Phase::Synthesize, &["scorer"], Behavior::Succeed))
        .build()
        .unwrap();
    let (scheduler, bus) = scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().starts_with("scorer failed"));
    assert!(run.completed_at.is_some());
    assert_eq!(run.agent("report").unwrap().state, AgentState::Idle);
    assert!(run.result.is_none());

    let events = bus.get_pipeline_events(run.id);
    assert!(!events.iter().any(|e| e.agent_name == "report"));
    assert_eq!(events.last().unwrap().event_type, EventType::RunFailed);
}

#[tokio::test]
async fn test_tolerant_flag_overrides_phase_default() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("scorer", Phase::Evaluate, &["extractor"], Behavior::Fail).tolerant(true))
        .register(Scripted::new("report", Phase::Synthesize, &["scorer"], Behavior::Succeed))
        .build()
        .unwrap();
    let (scheduler, _bus) = scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.degraded_agents(), vec!["scorer".to_string()]);

    // And the reverse: an intolerant analyzer fails the run
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("vision", Phase::Analyze, &["extractor"], Behavior::Fail).tolerant(false))
        .register(Scripted::new("content", Phase::Analyze, &["extractor"], Behavior::Succeed))
        .build()
        .unwrap();
    let (scheduler, _bus) = crate::scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;
    assert_eq!(run.status, RunStatus::Failed);
    // Siblings in the parallel phase still ran to completion
    assert_eq!(run.agent("content").unwrap().state, AgentState::Done);
}

#[tokio::test]
async fn test_panicking_agent_is_contained() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("vision", Phase::Analyze, &["extractor"], Behavior::Panic))
        .register(Scripted::new("report", Phase::Synthesize, &["vision"], Behavior::Succeed))
        .build()
        .unwrap();
    let (scheduler, bus) = scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;

    assert_eq!(run.status, RunStatus::Completed);
    let record = run.agent("vision").unwrap();
    assert_eq!(record.state, AgentState::Error);
    assert!(record.error.as_deref().unwrap().contains("vision panicked"));
    assert_eq!(error_events_for(&bus, run.id, "vision"), 1);
}

#[tokio::test]
async fn test_sequential_members_see_earlier_outputs() {
    let second = Scripted::new("second", Phase::Evaluate, &["first"], Behavior::Succeed);
    let seen = second.seen();
    let registry = AgentRegistry::builder()
        .register(Scripted::new("first", Phase::Evaluate, &[], Behavior::Succeed))
        .register(second)
        .build()
        .unwrap();
    let (scheduler, _bus) = scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;
    assert_eq!(run.status, RunStatus::Completed);

    let seen = seen.lock().unwrap();
    let first = seen[0]["first"].as_summary().unwrap();
    assert_eq!(first["agent"], "first");
}

#[tokio::test]
async fn test_final_output_is_last_phase_result() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("report", Phase::Synthesize, &["extractor"], Behavior::Succeed))
        .build()
        .unwrap();
    let (scheduler, _bus) = scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;
    let result = run.result.as_ref().and_then(|r| r.as_summary()).unwrap();
    assert_eq!(result["agent"], "report");
}

#[tokio::test]
async fn test_run_releases_progress_tracker() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("report", Phase::Synthesize, &["extractor"], Behavior::Fail))
        .build()
        .unwrap();
    let (scheduler, _bus) = scheduler(registry);

    let first = scheduler.run("a.mp4").await;
    let second = scheduler.run("b.mp4").await;

    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(second.status, RunStatus::Failed);
    assert!(scheduler.progress().is_empty());
}

#[tokio::test]
async fn test_event_order_per_agent() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .register(Scripted::new("vision", Phase::Analyze, &["extractor"], Behavior::Fail))
        .build()
        .unwrap();
    let (scheduler, bus) = scheduler(registry);

    let run = scheduler.run("lecture.mp4").await;
    let vision: Vec<EventType> = bus
        .get_pipeline_events(run.id)
        .into_iter()
        .filter(|e| e.agent_name == "vision")
        .map(|e| e.event_type)
        .collect();
    assert_eq!(vision, vec![EventType::AgentStart, EventType::AgentError]);

    let error = bus
        .get_pipeline_events(run.id)
        .into_iter()
        .find(|e| e.event_type == EventType::AgentError)
        .unwrap();
    assert_eq!(error.payload["fallback"], true);
    assert!(error.payload_f64("elapsed").is_some());
}

#[tokio::test]
async fn test_cancellation_fails_run() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::WaitForCancel))
        .register(Scripted::new("vision", Phase::Analyze, &["extractor"], Behavior::Succeed))
        .build()
        .unwrap();
    let (scheduler, _bus) = scheduler(registry);

    let handle: RunHandle = Arc::new(RwLock::new(scheduler.create_run("lecture.mp4")));
    let cancel = CancellationToken::new();
    let task = {
        let scheduler = scheduler.clone();
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.execute(handle, cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("run did not stop after cancellation")
        .unwrap();

    let run = handle.read().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(run.agent("vision").unwrap().state, AgentState::Idle);
}

#[tokio::test]
async fn test_finished_run_cannot_be_rerun() {
    let registry = AgentRegistry::builder()
        .register(Scripted::new("extractor", Phase::Extract, &[], Behavior::Succeed))
        .build()
        .unwrap();
    let (scheduler, bus) = scheduler(registry);

    let handle: RunHandle = Arc::new(RwLock::new(scheduler.create_run("lecture.mp4")));
    scheduler.execute(handle.clone(), CancellationToken::new()).await;
    let events_after_first = bus.history_len();

    scheduler.execute(handle.clone(), CancellationToken::new()).await;
    assert_eq!(handle.read().await.status, RunStatus::Completed);
    assert_eq!(bus.history_len(), events_after_first);
}
