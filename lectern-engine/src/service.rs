//! Pipeline invocation surface
//!
//! Owns in-flight and finished runs and their cancellation tokens. Runs are
//! driven by the scheduler on the tokio runtime; everything here only reads
//! them.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{PipelineRun, RunSummary};
use crate::workflow::progress::ProgressSnapshot;
use crate::workflow::scheduler::{PipelineScheduler, RunHandle};
use lectern_common::events::{AgentEvent, EventBus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Shared pipeline service handle
#[derive(Clone)]
pub struct PipelineService {
    scheduler: PipelineScheduler,
    runs: Arc<RwLock<HashMap<Uuid, RunHandle>>>,
    /// Cancellation tokens for in-flight runs
    cancellation_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl PipelineService {
    pub fn new(scheduler: PipelineScheduler) -> Self {
        Self {
            scheduler,
            runs: Arc::new(RwLock::new(HashMap::new())),
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn scheduler(&self) -> &PipelineScheduler {
        &self.scheduler
    }

    pub fn bus(&self) -> &EventBus {
        self.scheduler.bus()
    }

    async fn register(&self, video: PathBuf) -> (Uuid, RunHandle, CancellationToken) {
        let run = self.scheduler.create_run(video);
        let run_id = run.id;
        let handle: RunHandle = Arc::new(RwLock::new(run));
        let token = CancellationToken::new();

        self.runs.write().await.insert(run_id, handle.clone());
        self.cancellation_tokens
            .write()
            .await
            .insert(run_id, token.clone());
        (run_id, handle, token)
    }

    async fn drive(&self, run_id: Uuid, handle: RunHandle, token: CancellationToken) {
        self.scheduler.execute(handle, token).await;
        self.cancellation_tokens.write().await.remove(&run_id);
        self.scheduler.progress().remove(run_id);
    }

    /// Start a run in the background, returning its id immediately
    pub async fn start_run(&self, video: impl Into<PathBuf>) -> Uuid {
        let (run_id, handle, token) = self.register(video.into()).await;
        info!(run_id = %run_id, "Pipeline run queued");

        let service = self.clone();
        tokio::spawn(async move {
            service.drive(run_id, handle, token).await;
        });
        run_id
    }

    /// Run to completion and return the final run
    pub async fn run(&self, video: impl Into<PathBuf>) -> PipelineRun {
        let (run_id, handle, token) = self.register(video.into()).await;
        self.drive(run_id, handle.clone(), token).await;
        let run = handle.read().await.clone();
        run
    }

    pub async fn get_run(&self, run_id: Uuid) -> Option<PipelineRun> {
        let handle = self.runs.read().await.get(&run_id).cloned()?;
        let run = handle.read().await.clone();
        Some(run)
    }

    pub async fn get_run_status(&self, run_id: Uuid) -> Option<RunSummary> {
        let handle = self.runs.read().await.get(&run_id).cloned()?;
        let summary = handle.read().await.summary();
        Some(summary)
    }

    /// Events published for `run_id`, oldest first
    pub async fn get_run_events(&self, run_id: Uuid) -> PipelineResult<Vec<AgentEvent>> {
        if !self.runs.read().await.contains_key(&run_id) {
            return Err(PipelineError::RunNotFound(run_id));
        }
        Ok(self.bus().get_pipeline_events(run_id))
    }

    /// Up to `limit` runs, newest first
    pub async fn list_recent_runs(&self, limit: usize) -> Vec<RunSummary> {
        let handles: Vec<RunHandle> = self.runs.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.read().await.summary());
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        summaries
    }

    /// Request cancellation; false if the run is unknown or already finished
    pub async fn cancel_run(&self, run_id: Uuid) -> bool {
        match self.cancellation_tokens.read().await.get(&run_id) {
            Some(token) => {
                info!(run_id = %run_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Live progress of an in-flight run
    pub fn progress(&self, run_id: Uuid) -> Option<ProgressSnapshot> {
        self.scheduler.progress().get(run_id).map(|t| t.snapshot())
    }

    /// Drop a finished run and its event log
    pub async fn forget_run(&self, run_id: Uuid) -> bool {
        let Some(handle) = self.runs.read().await.get(&run_id).cloned() else {
            return false;
        };
        if !handle.read().await.status.is_terminal() {
            return false;
        }
        self.runs.write().await.remove(&run_id);
        self.bus().forget_pipeline(run_id);
        true
    }
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("agents", &self.scheduler.registry().names())
            .finish_non_exhaustive()
    }
}
