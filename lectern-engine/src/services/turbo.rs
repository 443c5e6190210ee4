//! Turbo orchestrator
//!
//! Extraction followed by parallel analysis: vision chunks go to the frame
//! pool while the whole audio track is analyzed concurrently on its own
//! pool. Both halves are joined, then each timeline is sorted by time.

use crate::models::TurboResult;
use crate::services::audio_segments::{AudioError, AudioSegmentAnalyzer};
use crate::services::frame_analyzer::{FrameAnalyzerFactory, LumaAnalyzerFactory};
use crate::services::frame_pool::{worker_count, FramePool};
use crate::services::media_extractor::{ExtractError, MediaExtractor};
use lectern_common::config::TurboConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TurboError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("No frames to analyze")]
    NoFrames,

    #[error("Work directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurboError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TurboError::Cancelled)
    }
}

/// Extraction + parallel analysis engine
pub struct TurboEngine {
    extractor: MediaExtractor,
    frames: FramePool,
    factory: Arc<dyn FrameAnalyzerFactory>,
    audio: Arc<AudioSegmentAnalyzer>,
    work_root: PathBuf,
    keep_work_dir: bool,
}

impl TurboEngine {
    pub fn new(
        extractor: MediaExtractor,
        workers: usize,
        audio: AudioSegmentAnalyzer,
        work_root: impl Into<PathBuf>,
    ) -> Result<Self, TurboError> {
        Ok(Self {
            extractor,
            frames: FramePool::new(workers)?,
            factory: Arc::new(LumaAnalyzerFactory),
            audio: Arc::new(audio),
            work_root: work_root.into(),
            keep_work_dir: false,
        })
    }

    /// Engine from the `[turbo]` config section; per-run scratch directories
    /// are created under `work_root`
    pub fn from_config(config: &TurboConfig, work_root: impl Into<PathBuf>) -> Result<Self, TurboError> {
        let workers = config
            .workers
            .unwrap_or_else(|| worker_count(config.worker_reservation));
        let extractor = MediaExtractor::new(&config.ffmpeg_path).with_hw_accel(config.use_hw_accel);
        let audio = AudioSegmentAnalyzer::new(config.audio_segment_seconds)
            .map_err(|e| TurboError::WorkerPool(e.to_string()))?;
        Ok(Self::new(extractor, workers, audio, work_root)?.keep_work_dir(config.keep_work_dir))
    }

    pub fn with_factory(mut self, factory: Arc<dyn FrameAnalyzerFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn keep_work_dir(mut self, keep: bool) -> Self {
        self.keep_work_dir = keep;
        self
    }

    pub fn workers(&self) -> usize {
        self.frames.workers()
    }

    pub fn extractor(&self) -> &MediaExtractor {
        &self.extractor
    }

    /// Scratch directory for one run
    pub fn work_dir_for(&self, run_id: Uuid) -> PathBuf {
        self.work_root.join(run_id.to_string())
    }

    /// Analyze already-extracted frames and audio
    ///
    /// Audio failure is recorded in `audio_error`, never fatal.
    pub async fn analyze(
        &self,
        frames: Vec<PathBuf>,
        audio: &Path,
        cancel: &CancellationToken,
    ) -> Result<TurboResult, TurboError> {
        self.analyze_with_progress(frames, audio, cancel, None).await
    }

    /// As `analyze`, counting processed frames into `progress`
    pub async fn analyze_with_progress(
        &self,
        frames: Vec<PathBuf>,
        audio: &Path,
        cancel: &CancellationToken,
        progress: Option<Arc<AtomicUsize>>,
    ) -> Result<TurboResult, TurboError> {
        if frames.is_empty() {
            return Err(TurboError::NoFrames);
        }
        if cancel.is_cancelled() {
            return Err(TurboError::Cancelled);
        }

        let start = Instant::now();
        let frame_count = frames.len();

        let analyzer = self.audio.clone();
        let audio_path = audio.to_path_buf();
        let audio_job = tokio::task::spawn_blocking(move || analyzer.analyze_file(&audio_path));
        let vision_job = self
            .frames
            .analyze(frames, self.factory.clone(), cancel.clone(), progress);

        let (vision, audio_outcome) = tokio::join!(vision_job, audio_job);
        let vision = vision?;

        let mut result = TurboResult {
            frame_timeline: vision.records,
            skipped_frames: vision.skipped,
            chunk_plan: vision.plan,
            frame_count,
            ..Default::default()
        };

        let audio_outcome = audio_outcome.map_err(|e| AudioError::Pool(format!("audio job: {}", e)));
        match audio_outcome.and_then(|r| r) {
            Ok(analysis) => {
                result.audio_metrics = Some(analysis.summary);
                result.audio_timeline = analysis.segments;
            }
            Err(e) => {
                warn!(audio = %audio.display(), "Audio analysis failed, continuing without audio: {}", e);
                result.audio_error = Some(e.to_string());
            }
        }

        result.sort_timelines();
        result.analysis_seconds = start.elapsed().as_secs_f64();
        result.elapsed_seconds = result.analysis_seconds;

        debug!(
            frames = frame_count,
            analyzed = result.frame_timeline.len(),
            skipped = result.skipped_frames.len(),
            segments = result.audio_timeline.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Turbo analysis joined"
        );
        Ok(result)
    }

    /// Extract, analyze, and clean up `work_dir`
    pub async fn run(
        &self,
        video: &Path,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<TurboResult, TurboError> {
        let start = Instant::now();
        tokio::fs::create_dir_all(work_dir).await?;

        let outcome = self.run_in(video, work_dir, cancel).await;

        if !self.keep_work_dir {
            if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
                warn!(work_dir = %work_dir.display(), "Failed to remove work directory: {}", e);
            }
        }

        let mut result = outcome?;
        result.elapsed_seconds = start.elapsed().as_secs_f64();
        info!(
            video = %video.display(),
            frames = result.frame_count,
            skipped = result.skipped_frames.len(),
            chunks = result.chunk_plan.chunk_count,
            workers = result.chunk_plan.workers,
            hw_accel = result.hw_accelerated,
            extraction_s = result.extraction_seconds,
            analysis_s = result.analysis_seconds,
            elapsed_s = result.elapsed_seconds,
            "Turbo run complete"
        );
        Ok(result)
    }

    async fn run_in(
        &self,
        video: &Path,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<TurboResult, TurboError> {
        let media = tokio::select! {
            _ = cancel.cancelled() => return Err(TurboError::Cancelled),
            media = self.extractor.extract(video, work_dir) => media?,
        };

        let mut result = self.analyze(media.frames, &media.audio, cancel).await?;
        result.extraction_seconds = media.elapsed_seconds;
        result.hw_accelerated = media.hw_accelerated;
        Ok(result)
    }
}

impl std::fmt::Debug for TurboEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurboEngine")
            .field("extractor", &self.extractor)
            .field("workers", &self.frames.workers())
            .field("analyzer", &self.factory.name())
            .field("segment_seconds", &self.audio.segment_seconds())
            .field("work_root", &self.work_root)
            .field("keep_work_dir", &self.keep_work_dir)
            .finish()
    }
}
