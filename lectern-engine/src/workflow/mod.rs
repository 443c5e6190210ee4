//! Pipeline workflow: agent registry, phase scheduler, progress tracking

pub mod progress;
pub mod registry;
pub mod scheduler;

pub use progress::{ProgressRegistry, ProgressSnapshot, ProgressTracker, StageStatus};
pub use registry::{AgentRegistry, AgentRegistryBuilder};
pub use scheduler::{PipelineScheduler, RunHandle, CANCELLED_MESSAGE};
