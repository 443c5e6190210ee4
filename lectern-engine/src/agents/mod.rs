//! Agent contract
//!
//! An agent is a named analysis unit with declared dependencies and a phase.
//! The scheduler hands each agent the outputs of its declared dependencies
//! and records the outcome.

pub mod builtin;

use crate::models::TurboResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use builtin::{
    default_registry, ContentAgent, ExtractorAgent, ReportAgent, VibeAgent, VisionAgent,
};

/// Pipeline phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Analyze,
    Evaluate,
    Feedback,
    Synthesize,
}

impl Phase {
    /// Fixed execution order
    pub const ORDER: [Phase; 5] = [
        Phase::Extract,
        Phase::Analyze,
        Phase::Evaluate,
        Phase::Feedback,
        Phase::Synthesize,
    ];

    /// Members run concurrently and are joined before the next phase
    pub fn is_parallel(&self) -> bool {
        matches!(self, Phase::Analyze)
    }

    /// Agents in this phase get a placeholder instead of failing the run,
    /// unless overridden per agent
    pub fn default_fallback_tolerant(&self) -> bool {
        matches!(self, Phase::Analyze)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Analyze => "analyze",
            Phase::Evaluate => "evaluate",
            Phase::Feedback => "feedback",
            Phase::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static agent metadata, fixed at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub role: String,
    pub dependencies: Vec<String>,
    pub phase: Phase,
    pub fallback_tolerant: bool,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, role: impl Into<String>, phase: Phase) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            dependencies: Vec::new(),
            phase,
            fallback_tolerant: phase.default_fallback_tolerant(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn fallback_tolerant(mut self, tolerant: bool) -> Self {
        self.fallback_tolerant = tolerant;
        self
    }
}

/// Agent result value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentOutput {
    /// Extraction/analysis timelines from the turbo engine
    Turbo { result: Arc<TurboResult> },
    /// Free-form JSON summary
    Summary { value: serde_json::Value },
    /// Stand-in for an agent that failed under fallback tolerance
    Placeholder { agent: String, reason: String },
}

impl AgentOutput {
    pub fn turbo(result: TurboResult) -> Self {
        AgentOutput::Turbo {
            result: Arc::new(result),
        }
    }

    pub fn summary(value: serde_json::Value) -> Self {
        AgentOutput::Summary { value }
    }

    pub fn placeholder(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentOutput::Placeholder {
            agent: agent.into(),
            reason: reason.into(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, AgentOutput::Placeholder { .. })
    }

    pub fn as_turbo(&self) -> Option<&Arc<TurboResult>> {
        match self {
            AgentOutput::Turbo { result } => Some(result),
            _ => None,
        }
    }

    pub fn as_summary(&self) -> Option<&serde_json::Value> {
        match self {
            AgentOutput::Summary { value } => Some(value),
            _ => None,
        }
    }
}

/// Inputs passed to one agent invocation
///
/// `outputs` holds exactly the agent's declared dependencies.
#[derive(Debug, Clone)]
pub struct AgentInputs {
    pub run_id: Uuid,
    pub video: PathBuf,
    pub outputs: BTreeMap<String, AgentOutput>,
    /// Cancelled when the run is cancelled; long-running agents should check
    /// it at their own safe points
    pub cancel: CancellationToken,
}

impl AgentInputs {
    /// Inputs for a standalone invocation outside a scheduled run
    pub fn standalone(video: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            video: video.into(),
            outputs: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, output: AgentOutput) -> Self {
        self.outputs.insert(name.into(), output);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AgentOutput> {
        self.outputs.get(name)
    }

    /// Dependency output, unless it is a placeholder
    pub fn real(&self, name: &str) -> Option<&AgentOutput> {
        self.get(name).filter(|o| !o.is_placeholder())
    }

    /// First turbo result among the dependencies
    pub fn turbo(&self) -> Option<&Arc<TurboResult>> {
        self.outputs.values().find_map(AgentOutput::as_turbo)
    }

    /// Names of dependencies that delivered placeholders
    pub fn degraded(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .filter(|(_, o)| o.is_placeholder())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn require(&self, name: &str) -> Result<&AgentOutput, AgentError> {
        self.real(name)
            .ok_or_else(|| AgentError::MissingInput(name.to_string()))
    }
}

/// Agent invocation failure
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("{0}")]
    Failed(String),

    /// Required dependency output absent or placeholder
    #[error("Missing input from '{0}'")]
    MissingInput(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Agent panicked: {0}")]
    Panicked(String),
}

impl AgentError {
    pub fn failed(msg: impl Into<String>) -> Self {
        AgentError::Failed(msg.into())
    }
}

/// Analysis unit executed by the scheduler
#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    async fn run(&self, inputs: AgentInputs) -> Result<AgentOutput, AgentError>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}
