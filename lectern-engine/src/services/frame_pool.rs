//! Chunked frame analysis worker pool
//!
//! Frames are split into contiguous chunks sized from the worker count and
//! analyzed on a dedicated rayon pool. Each chunk job builds its analyzer
//! once and reuses it for every frame in the chunk, replacing it only after
//! a panic. Chunks complete out of order; callers sort the merged records.

use crate::error::panic_message;
use crate::models::{ChunkPlan, FrameRecord, SkippedFrame};
use crate::services::frame_analyzer::{FrameAnalyzer, FrameAnalyzerFactory};
use crate::services::media_extractor::{frame_timestamp, FRAME_RATE};
use crate::services::turbo::TurboError;
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const MIN_CHUNK_SIZE: usize = 50;
pub const MAX_CHUNK_SIZE: usize = 100;

/// Chunk sizing for `total_frames` over `workers`
///
/// Target size is `total / workers` clamped to `[50, 100]`. When that would
/// produce more than 1.5× `workers` chunks, the size grows so the count
/// stays at about 1.5× the worker count.
pub fn plan_chunks(total_frames: usize, workers: usize) -> ChunkPlan {
    let workers = workers.max(1);
    if total_frames == 0 {
        return ChunkPlan {
            total_frames,
            workers,
            chunk_size: 0,
            chunk_count: 0,
        };
    }

    let mut chunk_size = (total_frames / workers).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    let target_chunks = ((workers as f64 * 1.5) as usize).max(1);
    if total_frames > target_chunks * chunk_size {
        chunk_size = total_frames / target_chunks + 1;
    }

    ChunkPlan {
        total_frames,
        workers,
        chunk_size,
        chunk_count: total_frames.div_ceil(chunk_size),
    }
}

/// Available hardware parallelism minus `reservation`, at least one
pub fn worker_count(reservation: usize) -> usize {
    num_cpus::get().saturating_sub(reservation).max(1)
}

/// Merged output of every chunk job
#[derive(Debug, Default)]
pub struct FramePoolOutput {
    /// Unsorted; chunk completion order
    pub records: Vec<FrameRecord>,
    pub skipped: Vec<SkippedFrame>,
    pub plan: ChunkPlan,
}

struct ChunkOutput {
    records: Vec<FrameRecord>,
    skipped: Vec<SkippedFrame>,
}

/// Fixed-size rayon pool for frame analysis
pub struct FramePool {
    workers: usize,
    pool: Arc<rayon::ThreadPool>,
}

impl FramePool {
    pub fn new(workers: usize) -> Result<Self, TurboError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("lectern-frame-{}", i))
            .build()
            .map_err(|e| TurboError::WorkerPool(e.to_string()))?;
        Ok(Self {
            workers,
            pool: Arc::new(pool),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Analyze `frames` chunk by chunk
    ///
    /// Cancellation is checked before each chunk starts; a running chunk
    /// always finishes. `progress` counts frames processed (analyzed or
    /// skipped).
    pub async fn analyze(
        &self,
        frames: Vec<PathBuf>,
        factory: Arc<dyn FrameAnalyzerFactory>,
        cancel: CancellationToken,
        progress: Option<Arc<AtomicUsize>>,
    ) -> Result<FramePoolOutput, TurboError> {
        let plan = plan_chunks(frames.len(), self.workers);
        debug!(
            frames = plan.total_frames,
            workers = plan.workers,
            chunk_size = plan.chunk_size,
            chunks = plan.chunk_count,
            analyzer = factory.name(),
            "Frame chunk plan"
        );
        if plan.chunk_count == 0 {
            return Ok(FramePoolOutput {
                plan,
                ..Default::default()
            });
        }

        let pool = self.pool.clone();
        let results = tokio::task::spawn_blocking(move || {
            let ranges: Vec<_> = plan.ranges().collect();
            pool.install(|| {
                ranges
                    .into_par_iter()
                    .map(|range| {
                        if cancel.is_cancelled() {
                            return None;
                        }
                        let offset = range.start;
                        Some(analyze_chunk(
                            &frames[range],
                            offset,
                            factory.as_ref(),
                            progress.as_deref(),
                        ))
                    })
                    .collect::<Vec<Option<ChunkOutput>>>()
            })
        })
        .await
        .map_err(|e| TurboError::Join(e.to_string()))?;

        let mut output = FramePoolOutput {
            plan,
            ..Default::default()
        };
        for chunk in results {
            let Some(chunk) = chunk else {
                return Err(TurboError::Cancelled);
            };
            output.records.extend(chunk.records);
            output.skipped.extend(chunk.skipped);
        }
        Ok(output)
    }
}

fn analyze_chunk(
    frames: &[PathBuf],
    offset: usize,
    factory: &dyn FrameAnalyzerFactory,
    progress: Option<&AtomicUsize>,
) -> ChunkOutput {
    let timestamp_of = |i: usize, path: &PathBuf| {
        frame_timestamp(path).unwrap_or((offset + i) as f64 / FRAME_RATE as f64)
    };
    let skip_from = |from: usize, reason: &str, skipped: &mut Vec<SkippedFrame>| {
        let rest = &frames[from..];
        skipped.extend(rest.iter().enumerate().map(|(i, path)| SkippedFrame {
            timestamp: timestamp_of(from + i, path),
            path: path.clone(),
            reason: reason.to_string(),
        }));
        if let Some(p) = progress {
            p.fetch_add(rest.len(), Ordering::Relaxed);
        }
    };

    let mut records = Vec::with_capacity(frames.len());
    let mut skipped = Vec::new();

    let mut analyzer: Box<dyn FrameAnalyzer> = match factory.create() {
        Ok(a) => a,
        Err(e) => {
            warn!(offset, frames = frames.len(), "Chunk analyzer unavailable, skipping chunk: {}", e);
            skip_from(0, &e.to_string(), &mut skipped);
            return ChunkOutput { records, skipped };
        }
    };

    for (i, path) in frames.iter().enumerate() {
        let timestamp = timestamp_of(i, path);
        let reason = match catch_unwind(AssertUnwindSafe(|| analyzer.analyze(path))) {
            Ok(Ok(analysis)) => {
                records.push(FrameRecord {
                    timestamp,
                    vision: analysis.vision,
                    content: analysis.content,
                });
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => {
                let reason = format!("Analyzer panicked: {}", panic_message(payload.as_ref()));
                // The analyzer's state is unknown after a panic
                match factory.create() {
                    Ok(fresh) => analyzer = fresh,
                    Err(e) => {
                        warn!(frame = %path.display(), offset, "{}; rebuild failed, skipping rest of chunk: {}", reason, e);
                        skipped.push(SkippedFrame {
                            timestamp,
                            path: path.clone(),
                            reason,
                        });
                        if let Some(p) = progress {
                            p.fetch_add(1, Ordering::Relaxed);
                        }
                        skip_from(i + 1, &e.to_string(), &mut skipped);
                        return ChunkOutput { records, skipped };
                    }
                }
                Some(reason)
            }
        };

        if let Some(reason) = reason {
            warn!(frame = %path.display(), timestamp, "Frame skipped: {}", reason);
            skipped.push(SkippedFrame {
                timestamp,
                path: path.clone(),
                reason,
            });
        }
        if let Some(p) = progress {
            p.fetch_add(1, Ordering::Relaxed);
        }
    }

    ChunkOutput { records, skipped }
}
