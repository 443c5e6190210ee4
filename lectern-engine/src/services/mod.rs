//! Turbo engine services
//!
//! - `media_extractor`: external media tool wrapper (frames + audio)
//! - `frame_analyzer` / `frame_pool`: chunked parallel frame analysis
//! - `audio_segments`: windowed prosody analysis
//! - `turbo`: orchestration of the above

pub mod audio_segments;
pub mod frame_analyzer;
pub mod frame_pool;
pub mod media_extractor;
pub mod turbo;

pub use audio_segments::{AudioAnalysis, AudioError, AudioSegmentAnalyzer, ProsodyProbe, SegmentMetrics, SegmentProbe};
pub use frame_analyzer::{FrameAnalysis, FrameAnalyzer, FrameAnalyzerFactory, FrameError, LumaAnalyzerFactory};
pub use frame_pool::{plan_chunks, worker_count, FramePool, FramePoolOutput};
pub use media_extractor::{ExtractError, ExtractedMedia, MediaExtractor};
pub use turbo::{TurboEngine, TurboError};
