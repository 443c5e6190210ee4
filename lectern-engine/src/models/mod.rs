//! Data models for lectern-engine
//!
//! - Pipeline run lifecycle and per-agent run records
//! - Turbo engine output (frame/audio timelines)

pub mod pipeline_run;
pub mod turbo;

pub use pipeline_run::{AgentRunRecord, AgentState, PipelineRun, RunStatus, RunSummary, StateTransition};
pub use turbo::{
    AudioSegmentRecord, AudioSummary, ChunkPlan, ContentMetrics, FrameRecord, SkippedFrame,
    sort_frames, sort_segments, TurboResult, VisionMetrics,
};
