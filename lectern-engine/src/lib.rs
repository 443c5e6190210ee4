//! lectern-engine library
//!
//! Analysis-pipeline engine: a dependency-aware agent scheduler plus the
//! turbo extraction/parallel-analysis engine its extract phase drives.

pub mod agents;
pub mod error;
pub mod models;
pub mod service;
pub mod services;
pub mod workflow;

pub use agents::{Agent, AgentDescriptor, AgentError, AgentInputs, AgentOutput, Phase};
pub use error::{PipelineError, PipelineResult, RegistryError};
pub use service::PipelineService;
pub use services::turbo::{TurboEngine, TurboError};
pub use workflow::{AgentRegistry, PipelineScheduler, ProgressTracker};
