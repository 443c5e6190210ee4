//! Pipeline run state machine
//!
//! A run progresses `QUEUED → RUNNING → {COMPLETED | FAILED}` and never
//! regresses. Each declared agent has exactly one `AgentRunRecord`.

use crate::agents::AgentOutput;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started
    Queued,
    /// Phases executing
    Running,
    /// All phases executed (possibly with degraded agents)
    Completed,
    /// A required stage failed or the run was cancelled
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether `self → next` is a forward lifecycle step
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Queued, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of an accepted status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub run_id: Uuid,
    pub old_status: RunStatus,
    pub new_status: RunStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// Per-agent execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Done,
    Error,
}

/// Execution record for one agent within one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRecord {
    pub name: String,
    pub state: AgentState,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<f64>,
    pub error: Option<String>,
    /// Output handed to dependents (a placeholder when the agent failed
    /// under fallback tolerance)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentOutput>,
}

impl AgentRunRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AgentState::Idle,
            started_at: None,
            elapsed_seconds: None,
            error: None,
            result: None,
        }
    }

    /// Idle → Running. Returns false if the record already left Idle.
    pub fn mark_running(&mut self) -> bool {
        if self.state != AgentState::Idle {
            return false;
        }
        self.state = AgentState::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Running → Done
    pub fn mark_done(&mut self, output: AgentOutput, elapsed_seconds: f64) -> bool {
        if self.state != AgentState::Running {
            return false;
        }
        self.state = AgentState::Done;
        self.elapsed_seconds = Some(elapsed_seconds);
        self.result = Some(output);
        true
    }

    /// Running → Error, optionally attaching the placeholder handed downstream
    pub fn mark_error(
        &mut self,
        error: impl Into<String>,
        elapsed_seconds: f64,
        placeholder: Option<AgentOutput>,
    ) -> bool {
        if self.state != AgentState::Running {
            return false;
        }
        self.state = AgentState::Error;
        self.elapsed_seconds = Some(elapsed_seconds);
        self.error = Some(error.into());
        self.result = placeholder;
        true
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, AgentState::Done | AgentState::Error)
    }
}

/// One invocation of the analysis pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub video: PathBuf,
    pub status: RunStatus,
    pub progress_percent: f64,
    pub agents: BTreeMap<String, AgentRunRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Final synthesize-phase output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentOutput>,
    pub error: Option<String>,
}

impl PipelineRun {
    /// Create a queued run with one idle record per declared agent
    pub fn new<I, S>(video: impl Into<PathBuf>, agent_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_id(Uuid::new_v4(), video, agent_names)
    }

    pub fn with_id<I, S>(id: Uuid, video: impl Into<PathBuf>, agent_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agents = agent_names
            .into_iter()
            .map(|n| {
                let name = n.into();
                (name.clone(), AgentRunRecord::new(name))
            })
            .collect();
        Self {
            id,
            video: video.into(),
            status: RunStatus::Queued,
            progress_percent: 0.0,
            agents,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Apply a status change
    ///
    /// Rejected transitions leave the run unchanged.
    pub fn transition_to(&mut self, new_status: RunStatus) -> Result<StateTransition, PipelineError> {
        if !self.status.can_transition_to(new_status) {
            return Err(PipelineError::InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        let now = Utc::now();
        let transition = StateTransition {
            run_id: self.id,
            old_status: self.status,
            new_status,
            transitioned_at: now,
        };
        self.status = new_status;

        match new_status {
            RunStatus::Running => self.started_at = Some(now),
            RunStatus::Completed => {
                self.completed_at = Some(now);
                self.progress_percent = 100.0;
            }
            RunStatus::Failed => self.completed_at = Some(now),
            RunStatus::Queued => {}
        }

        Ok(transition)
    }

    /// Mark the run failed with a message
    pub fn fail(&mut self, error: impl Into<String>) -> Result<StateTransition, PipelineError> {
        let transition = self.transition_to(RunStatus::Failed)?;
        self.error = Some(error.into());
        Ok(transition)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentRunRecord> {
        self.agents.get(name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut AgentRunRecord> {
        self.agents.get_mut(name)
    }

    /// Agents whose records ended in error
    pub fn degraded_agents(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|r| r.state == AgentState::Error)
            .map(|r| r.name.clone())
            .collect()
    }

    /// Completed without any failed agent
    pub fn is_fully_successful(&self) -> bool {
        self.status == RunStatus::Completed && self.degraded_agents().is_empty()
    }

    pub fn elapsed_seconds(&self) -> Option<f64> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            video: self.video.clone(),
            status: self.status,
            progress_percent: self.progress_percent,
            agents: self
                .agents
                .iter()
                .map(|(name, record)| (name.clone(), record.state))
                .collect(),
            degraded_agents: self.degraded_agents(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Lightweight view of a run for status/listing queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub video: PathBuf,
    pub status: RunStatus,
    pub progress_percent: f64,
    pub agents: BTreeMap<String, AgentState>,
    pub degraded_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
