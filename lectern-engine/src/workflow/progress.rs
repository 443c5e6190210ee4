//! Weighted progress tracking
//!
//! One tracker per in-flight run. Each stage carries a relative weight; the
//! weights are rescaled to sum to 100. Overall progress is the weight of all
//! stages before the current one plus the current stage's weight scaled by
//! its percent.

use crate::agents::Phase;
use chrono::{DateTime, Utc};
use lectern_common::events::{payload, EventBus, EventType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Publisher name used for progress and run-level events
pub const PROGRESS_PUBLISHER: &str = "pipeline";

/// Notes included with each progress update
const UPDATE_NOTE_COUNT: usize = 5;
/// Notes included with the completion payload
const COMPLETE_NOTE_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    #[error("Unknown stage: {0}")]
    UnknownStage(String),
    #[error("Tracker already finished")]
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
}

/// Timeline note attached to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressNote {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub id: String,
    pub weight: f64,
    pub percent: f64,
    pub status: StageStatus,
}

/// Point-in-time view of a tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: Uuid,
    pub overall_percent: f64,
    pub current_stage: Option<String>,
    pub stages: Vec<StageSnapshot>,
    pub elapsed_seconds: f64,
    pub notes: Vec<ProgressNote>,
    pub finished: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
struct StageState {
    id: String,
    weight: f64,
    percent: f64,
    status: StageStatus,
}

#[derive(Debug)]
struct TrackerState {
    stages: Vec<StageState>,
    current: Option<usize>,
    overall: f64,
    notes: VecDeque<ProgressNote>,
    finished: bool,
    error: Option<String>,
}

impl TrackerState {
    fn recent_notes(&self, n: usize) -> Vec<ProgressNote> {
        let skip = self.notes.len().saturating_sub(n);
        self.notes.iter().skip(skip).cloned().collect()
    }

    fn push_note(&mut self, note: ProgressNote, capacity: usize) {
        self.notes.push_back(note);
        while self.notes.len() > capacity {
            self.notes.pop_front();
        }
    }
}

/// Default relative weight of a phase's stage
pub fn default_phase_weight(phase: Phase) -> f64 {
    match phase {
        Phase::Extract => 20.0,
        Phase::Analyze => 50.0,
        Phase::Evaluate => 15.0,
        Phase::Feedback => 10.0,
        Phase::Synthesize => 5.0,
    }
}

/// Progress aggregation for one run
pub struct ProgressTracker {
    run_id: Uuid,
    bus: EventBus,
    note_capacity: usize,
    started: Instant,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    /// Create a tracker from `(stage_id, relative_weight)` pairs
    pub fn new(run_id: Uuid, stages: Vec<(String, f64)>, bus: EventBus, note_capacity: usize) -> Self {
        let total: f64 = stages.iter().map(|(_, w)| w.max(0.0)).sum();
        let count = stages.len().max(1) as f64;
        let stages = stages
            .into_iter()
            .map(|(id, w)| StageState {
                id,
                weight: if total > 0.0 {
                    w.max(0.0) * 100.0 / total
                } else {
                    100.0 / count
                },
                percent: 0.0,
                status: StageStatus::Pending,
            })
            .collect();

        Self {
            run_id,
            bus,
            note_capacity: note_capacity.max(1),
            started: Instant::now(),
            state: Mutex::new(TrackerState {
                stages,
                current: None,
                overall: 0.0,
                notes: VecDeque::new(),
                finished: false,
                error: None,
            }),
        }
    }

    /// One stage per phase, weighted by `default_phase_weight`
    pub fn for_phases(run_id: Uuid, phases: &[Phase], bus: EventBus, note_capacity: usize) -> Self {
        let stages = phases
            .iter()
            .map(|p| (p.as_str().to_string(), default_phase_weight(*p)))
            .collect();
        Self::new(run_id, stages, bus, note_capacity)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Set a stage's completion percent and recompute overall progress
    ///
    /// `percent` is clamped to `[0, 100]`. Repeating an identical update is a
    /// no-op. Returns the overall percent.
    pub fn update_stage(
        &self,
        stage_id: &str,
        percent: f64,
        message: Option<&str>,
    ) -> Result<f64, ProgressError> {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };

        let event_payload = {
            let mut state = self.lock();
            if state.finished {
                return Err(ProgressError::Finished);
            }
            let idx = state
                .stages
                .iter()
                .position(|s| s.id == stage_id)
                .ok_or_else(|| ProgressError::UnknownStage(stage_id.to_string()))?;

            let unchanged = state.current == Some(idx)
                && state.stages[idx].percent == percent
                && message.map_or(true, |m| {
                    state.notes.back().map_or(false, |n| n.kind == stage_id && n.message == m)
                });
            if unchanged {
                return Ok(state.overall);
            }

            for (i, stage) in state.stages.iter_mut().enumerate() {
                if i < idx {
                    stage.percent = 100.0;
                    stage.status = StageStatus::Completed;
                } else if i == idx {
                    stage.percent = percent;
                    stage.status = if percent >= 100.0 {
                        StageStatus::Completed
                    } else {
                        StageStatus::InProgress
                    };
                }
            }
            state.current = Some(idx);
            let prior: f64 = state.stages[..idx].iter().map(|s| s.weight).sum();
            state.overall = (prior + state.stages[idx].weight * percent / 100.0).min(100.0);

            if let Some(msg) = message {
                let note = ProgressNote {
                    timestamp: Utc::now(),
                    kind: stage_id.to_string(),
                    message: msg.to_string(),
                };
                state.push_note(note, self.note_capacity);
            }

            json!({
                "stage": stage_id,
                "stage_percent": percent,
                "progress": state.overall,
                "message": message,
                "notes": state.recent_notes(UPDATE_NOTE_COUNT),
            })
        };

        let overall = event_payload["progress"].as_f64().unwrap_or(0.0);
        self.bus.publish(
            PROGRESS_PUBLISHER,
            EventType::Progress,
            payload(event_payload),
            Some(self.run_id),
        );
        Ok(overall)
    }

    /// Append a free-form timeline note
    pub fn add_note(&self, kind: &str, message: &str) {
        let note = ProgressNote {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            message: message.to_string(),
        };
        let mut state = self.lock();
        state.push_note(note, self.note_capacity);
    }

    /// Terminal success notification
    ///
    /// Returns false if the tracker had already finished.
    pub fn complete(&self, result: Option<serde_json::Value>) -> bool {
        let event_payload = {
            let mut state = self.lock();
            if state.finished {
                return false;
            }
            state.finished = true;
            state.overall = 100.0;
            state.current = state.stages.len().checked_sub(1);
            for stage in state.stages.iter_mut() {
                stage.percent = 100.0;
                stage.status = StageStatus::Completed;
            }
            json!({
                "status": "completed",
                "progress": 100.0,
                "elapsed_seconds": self.started.elapsed().as_secs_f64(),
                "result": result,
                "notes": state.recent_notes(COMPLETE_NOTE_COUNT),
            })
        };
        self.bus.publish(
            PROGRESS_PUBLISHER,
            EventType::RunCompleted,
            payload(event_payload),
            Some(self.run_id),
        );
        true
    }

    /// Terminal failure notification
    ///
    /// Returns false if the tracker had already finished.
    pub fn error(&self, message: &str) -> bool {
        let event_payload = {
            let mut state = self.lock();
            if state.finished {
                return false;
            }
            state.finished = true;
            state.error = Some(message.to_string());
            json!({
                "status": "failed",
                "progress": state.overall,
                "error": message,
                "elapsed_seconds": self.started.elapsed().as_secs_f64(),
            })
        };
        self.bus.publish(
            PROGRESS_PUBLISHER,
            EventType::RunFailed,
            payload(event_payload),
            Some(self.run_id),
        );
        true
    }

    pub fn overall_percent(&self) -> f64 {
        self.lock().overall
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        ProgressSnapshot {
            run_id: self.run_id,
            overall_percent: state.overall,
            current_stage: state.current.map(|i| state.stages[i].id.clone()),
            stages: state
                .stages
                .iter()
                .map(|s| StageSnapshot {
                    id: s.id.clone(),
                    weight: s.weight,
                    percent: s.percent,
                    status: s.status,
                })
                .collect(),
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            notes: state.notes.iter().cloned().collect(),
            finished: state.finished,
            error: state.error.clone(),
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("run_id", &self.run_id)
            .field("overall", &self.overall_percent())
            .finish()
    }
}

/// One tracker per in-flight run
#[derive(Debug, Default, Clone)]
pub struct ProgressRegistry {
    trackers: Arc<Mutex<HashMap<Uuid, Arc<ProgressTracker>>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<ProgressTracker>>> {
        self.trackers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Existing tracker for `run_id`, or a new one from `create`
    pub fn get_or_create<F>(&self, run_id: Uuid, create: F) -> Arc<ProgressTracker>
    where
        F: FnOnce() -> ProgressTracker,
    {
        self.lock()
            .entry(run_id)
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    pub fn get(&self, run_id: Uuid) -> Option<Arc<ProgressTracker>> {
        self.lock().get(&run_id).cloned()
    }

    pub fn remove(&self, run_id: Uuid) -> Option<Arc<ProgressTracker>> {
        self.lock().remove(&run_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
