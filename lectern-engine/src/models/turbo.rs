//! Turbo engine output types
//!
//! Frame and audio records are produced out of order by the worker pools
//! and sorted by timestamp before they leave the engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-frame visual measurements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionMetrics {
    /// Mean luma, 0.0 (black) – 1.0 (white)
    pub brightness: f64,
    /// Luma standard deviation, 0.0 – 0.5
    pub contrast: f64,
    /// Analyzer-specific fields
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Per-frame on-screen content measurements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetrics {
    /// Fraction of pixels on a strong luma edge
    pub edge_density: f64,
    /// Frame looks like a projected slide (bright, flat background with text)
    pub is_slide: bool,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Analysis of one sampled time instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Seconds from start of video
    pub timestamp: f64,
    pub vision: VisionMetrics,
    pub content: ContentMetrics,
}

/// Frame whose analysis failed; kept so nothing disappears without record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFrame {
    pub timestamp: f64,
    pub path: PathBuf,
    pub reason: String,
}

/// Prosody measurements for one fixed-width audio window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSegmentRecord {
    pub start_time: f64,
    pub end_time: f64,
    /// Mean RMS amplitude
    pub energy: f64,
    /// Mean voiced pitch in Hz (0.0 if unvoiced)
    pub pitch: f64,
    /// Pitch standard deviation in Hz
    pub pitch_variance: f64,
    pub is_silent: bool,
    pub is_monotone: bool,
    /// Analysis failed and conservative defaults were substituted
    #[serde(default)]
    pub placeholder: bool,
}

impl AudioSegmentRecord {
    /// Conservative stand-in for a window whose analysis failed
    pub fn placeholder(start_time: f64, end_time: f64) -> Self {
        Self {
            start_time,
            end_time,
            energy: 0.0,
            pitch: 0.0,
            pitch_variance: 0.0,
            is_silent: true,
            is_monotone: true,
            placeholder: true,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Whole-track audio summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioSummary {
    pub duration_seconds: f64,
    /// Fraction of the track below the silence threshold
    pub silence_ratio: f64,
    pub energy_mean: f64,
    /// Pitch standard deviation over the opening minute
    pub pitch_std: f64,
    pub is_monotone: bool,
    pub segment_count: usize,
}

/// How extracted frames were split across workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_frames: usize,
    pub workers: usize,
    pub chunk_size: usize,
    pub chunk_count: usize,
}

impl ChunkPlan {
    /// Index ranges of each chunk, in order
    pub fn ranges(&self) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        let size = self.chunk_size.max(1);
        (0..self.chunk_count).map(move |i| {
            let start = i * size;
            start..(start + size).min(self.total_frames)
        })
    }
}

/// Everything the turbo engine learned about one video
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurboResult {
    /// Sorted ascending by timestamp
    pub frame_timeline: Vec<FrameRecord>,
    /// `None` when the audio track could not be analyzed (see `audio_error`)
    pub audio_metrics: Option<AudioSummary>,
    /// Sorted ascending by start time
    pub audio_timeline: Vec<AudioSegmentRecord>,
    pub skipped_frames: Vec<SkippedFrame>,
    pub audio_error: Option<String>,
    /// Extraction + analysis wall-clock time
    pub elapsed_seconds: f64,
    pub extraction_seconds: f64,
    pub analysis_seconds: f64,
    /// Frames handed to analysis
    pub frame_count: usize,
    pub chunk_plan: ChunkPlan,
    /// Hardware-accelerated decode produced the frames
    #[serde(default)]
    pub hw_accelerated: bool,
}

impl TurboResult {
    /// Sort both timelines by time. Idempotent.
    pub fn sort_timelines(&mut self) {
        sort_frames(&mut self.frame_timeline);
        sort_segments(&mut self.audio_timeline);
        self.skipped_frames
            .sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    }

    pub fn speaking_ratio(&self) -> Option<f64> {
        if self.audio_timeline.is_empty() {
            return None;
        }
        let speaking = self.audio_timeline.iter().filter(|s| !s.is_silent).count();
        Some(speaking as f64 / self.audio_timeline.len() as f64)
    }
}

/// Stable ascending sort by timestamp
pub fn sort_frames(frames: &mut [FrameRecord]) {
    frames.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
}

/// Stable ascending sort by window start
pub fn sort_segments(segments: &mut [AudioSegmentRecord]) {
    segments.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: f64) -> FrameRecord {
        FrameRecord {
            timestamp: ts,
            vision: VisionMetrics::default(),
            content: ContentMetrics::default(),
        }
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut frames = vec![frame(3.0), frame(0.0), frame(2.0), frame(1.0)];
        sort_frames(&mut frames);
        let once = frames.clone();
        sort_frames(&mut frames);
        assert_eq!(frames, once);
        assert!(frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_chunk_ranges_cover_all_frames() {
        let plan = ChunkPlan {
            total_frames: 205,
            workers: 2,
            chunk_size: 100,
            chunk_count: 3,
        };
        let ranges: Vec<_> = plan.ranges().collect();
        assert_eq!(ranges, vec![0..100, 100..200, 200..205]);
    }

    #[test]
    fn test_placeholder_segment_is_conservative() {
        let seg = AudioSegmentRecord::placeholder(10.0, 20.0);
        assert_eq!(seg.energy, 0.0);
        assert!(seg.is_silent && seg.is_monotone && seg.placeholder);
        assert_eq!(seg.duration(), 10.0);
    }
}
