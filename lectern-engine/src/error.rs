//! Error types for lectern-engine
//!
//! Component-local failures (per-frame, per-segment, per-agent, extraction)
//! have their own enums next to the code that raises them. This module holds
//! the registry and pipeline-level errors that reach callers.

use crate::models::RunStatus;
use std::any::Any;
use thiserror::Error;
use uuid::Uuid;

/// Agent registry validation failure
///
/// Raised by `AgentRegistryBuilder::build` before any run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two agents registered under the same name
    #[error("Duplicate agent name: {0}")]
    DuplicateAgent(String),

    /// An agent depends on a name that is not registered
    #[error("Agent '{agent}' depends on undeclared agent '{dependency}'")]
    UnknownDependency { agent: String, dependency: String },

    /// The dependency graph contains a cycle
    #[error("Dependency cycle among agents: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A dependency would not have produced output by the time the agent runs
    #[error("Agent '{agent}' ({phase}) depends on '{dependency}' which is not scheduled before it")]
    DependencyOrder {
        agent: String,
        phase: String,
        dependency: String,
    },

    /// No agents registered
    #[error("Registry contains no agents")]
    EmptyRegistry,
}

/// Pipeline run error
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Status change that is not a forward lifecycle step
    #[error("Invalid run transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// Unknown run id
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// Registry validation failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Shared configuration/IO error
    #[error("Common error: {0}")]
    Common(#[from] lectern_common::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Message carried by a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
