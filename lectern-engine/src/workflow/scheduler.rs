//! Pipeline scheduler
//!
//! Executes the registry's phases in fixed order. Sequential phases run their
//! members one at a time in registration order; the parallel phase launches
//! every member concurrently and joins before moving on.
//!
//! # Error Handling
//! - Each agent runs in its own task, so a panic is caught as an agent error
//! - A failing fallback-tolerant agent is recorded as `error` and a
//!   placeholder output is handed to its dependents
//! - A failing agent without fallback marks the run `failed`; remaining
//!   phases are skipped
//! - Cancellation is observed at phase boundaries and passed to agents

use crate::agents::{Agent, AgentError, AgentInputs, AgentOutput, Phase};
use crate::error::panic_message;
use crate::models::{PipelineRun, RunStatus};
use crate::workflow::progress::{ProgressRegistry, ProgressTracker};
use crate::workflow::registry::AgentRegistry;
use futures::stream::{FuturesUnordered, StreamExt};
use lectern_common::events::{payload, EventBus, EventType};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error message recorded on runs stopped by cancellation
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Shared handle to a run; written only by the scheduler executing it
pub type RunHandle = Arc<RwLock<PipelineRun>>;

/// Dependency-aware agent scheduler
#[derive(Clone)]
pub struct PipelineScheduler {
    registry: Arc<AgentRegistry>,
    bus: EventBus,
    progress: ProgressRegistry,
    note_capacity: usize,
}

impl PipelineScheduler {
    pub fn new(registry: Arc<AgentRegistry>, bus: EventBus) -> Self {
        Self {
            registry,
            bus,
            progress: ProgressRegistry::new(),
            note_capacity: 20,
        }
    }

    /// Share an externally owned progress registry
    pub fn with_progress_registry(mut self, progress: ProgressRegistry) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_note_capacity(mut self, note_capacity: usize) -> Self {
        self.note_capacity = note_capacity;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    /// Queued run with one record per registered agent
    pub fn create_run(&self, video: impl Into<PathBuf>) -> PipelineRun {
        PipelineRun::new(video, self.registry.names())
    }

    /// Run the pipeline on `video` to completion
    pub async fn run(&self, video: impl Into<PathBuf>) -> PipelineRun {
        let handle: RunHandle = Arc::new(RwLock::new(self.create_run(video)));
        self.execute(handle.clone(), CancellationToken::new()).await;
        let run = handle.read().await.clone();
        self.progress.remove(run.id);
        run
    }

    /// Drive a queued run through every phase
    ///
    /// On return the run is `completed` or `failed`.
    pub async fn execute(&self, run: RunHandle, cancel: CancellationToken) {
        let (run_id, video) = {
            let mut guard = run.write().await;
            if let Err(e) = guard.transition_to(RunStatus::Running) {
                warn!(run_id = %guard.id, "Run not started: {}", e);
                return;
            }
            (guard.id, guard.video.clone())
        };

        let phases = self.registry.phases();
        let phase_ids: Vec<Phase> = phases.iter().map(|(p, _)| *p).collect();
        let tracker = self.progress.get_or_create(run_id, || {
            ProgressTracker::for_phases(run_id, &phase_ids, self.bus.clone(), self.note_capacity)
        });

        info!(run_id = %run_id, video = %video.display(), agents = self.registry.len(), "Pipeline run started");
        let started = Instant::now();
        let mut outputs: BTreeMap<String, AgentOutput> = BTreeMap::new();
        let mut last_output: Option<AgentOutput> = None;

        for (phase, members) in phases {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, phase = %phase, "Run cancelled at phase boundary");
                self.fail_run(&run, &tracker, CANCELLED_MESSAGE).await;
                return;
            }

            self.update_progress(&run, &tracker, phase, 0.0, Some(&format!("{} started", phase)))
                .await;
            debug!(run_id = %run_id, phase = %phase, members = members.len(), "Phase started");

            let phase_result = if phase.is_parallel() {
                self.run_parallel(&run, &tracker, phase, &members, &video, &outputs, &cancel)
                    .await
            } else {
                self.run_sequential(&run, &tracker, phase, &members, &video, &outputs, &cancel)
                    .await
            };

            match phase_result {
                Ok(produced) => {
                    for (name, output) in produced {
                        last_output = Some(output.clone());
                        outputs.insert(name, output);
                    }
                }
                Err((agent, e)) => {
                    let message = match e {
                        AgentError::Cancelled => CANCELLED_MESSAGE.to_string(),
                        other => format!("{} failed: {}", agent, other),
                    };
                    self.fail_run(&run, &tracker, &message).await;
                    return;
                }
            }

            self.update_progress(&run, &tracker, phase, 100.0, Some(&format!("{} finished", phase)))
                .await;
        }

        let (summary, degraded) = {
            let mut guard = run.write().await;
            guard.result = last_output;
            if let Err(e) = guard.transition_to(RunStatus::Completed) {
                error!(run_id = %run_id, "Completion rejected: {}", e);
                return;
            }
            (
                json!({
                    "degraded_agents": guard.degraded_agents(),
                    "elapsed_seconds": started.elapsed().as_secs_f64(),
                }),
                guard.degraded_agents(),
            )
        };
        tracker.complete(Some(summary));

        if degraded.is_empty() {
            info!(run_id = %run_id, elapsed_ms = started.elapsed().as_millis() as u64, "Pipeline run completed");
        } else {
            warn!(
                run_id = %run_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                degraded = ?degraded,
                "Pipeline run completed with degraded inputs"
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential(
        &self,
        run: &RunHandle,
        tracker: &ProgressTracker,
        phase: Phase,
        members: &[Arc<dyn Agent>],
        video: &Path,
        prior: &BTreeMap<String, AgentOutput>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, AgentOutput)>, (String, AgentError)> {
        // Later members see earlier members' outputs
        let mut visible = prior.clone();
        let mut produced = Vec::with_capacity(members.len());
        let total = members.len();

        for (i, agent) in members.iter().enumerate() {
            let name = agent.name().to_string();
            let inputs = self.inputs_for(agent.as_ref(), run, video, &visible, cancel).await;
            let output = self.invoke(agent.clone(), inputs, run).await.map_err(|e| (name.clone(), e))?;
            visible.insert(name.clone(), output.clone());
            produced.push((name, output));

            let pct = (i + 1) as f64 * 100.0 / total as f64;
            if pct < 100.0 {
                self.update_progress(run, tracker, phase, pct, None).await;
            }
        }
        Ok(produced)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        run: &RunHandle,
        tracker: &ProgressTracker,
        phase: Phase,
        members: &[Arc<dyn Agent>],
        video: &Path,
        prior: &BTreeMap<String, AgentOutput>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, AgentOutput)>, (String, AgentError)> {
        let mut pending = FuturesUnordered::new();
        for agent in members {
            let inputs = self.inputs_for(agent.as_ref(), run, video, prior, cancel).await;
            let name = agent.name().to_string();
            let fut = self.invoke(agent.clone(), inputs, run);
            pending.push(async move { (name, fut.await) });
        }

        // Join every sibling before deciding the phase outcome
        let total = members.len();
        let mut produced = Vec::with_capacity(total);
        let mut fatal: Option<(String, AgentError)> = None;
        while let Some((name, result)) = pending.next().await {
            match result {
                Ok(output) => produced.push((name, output)),
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some((name, e));
                    }
                }
            }
            let done = produced.len() + usize::from(fatal.is_some());
            let pct = done as f64 * 100.0 / total as f64;
            if pct < 100.0 {
                self.update_progress(run, tracker, phase, pct, None).await;
            }
        }

        match fatal {
            Some(f) => Err(f),
            None => {
                // Deterministic order regardless of completion order
                produced.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(produced)
            }
        }
    }

    async fn inputs_for(
        &self,
        agent: &dyn Agent,
        run: &RunHandle,
        video: &Path,
        available: &BTreeMap<String, AgentOutput>,
        cancel: &CancellationToken,
    ) -> AgentInputs {
        let outputs = agent
            .descriptor()
            .dependencies
            .iter()
            .filter_map(|dep| available.get(dep).map(|o| (dep.clone(), o.clone())))
            .collect();
        AgentInputs {
            run_id: run.read().await.id,
            video: video.to_path_buf(),
            outputs,
            cancel: cancel.child_token(),
        }
    }

    /// Execute one agent in its own task and record the outcome
    ///
    /// `Ok` carries the real output, or a placeholder when the agent failed
    /// under fallback tolerance. `Err` means the run cannot continue.
    async fn invoke(
        &self,
        agent: Arc<dyn Agent>,
        inputs: AgentInputs,
        run: &RunHandle,
    ) -> Result<AgentOutput, AgentError> {
        let descriptor = agent.descriptor().clone();
        let name = descriptor.name.clone();
        let run_id = inputs.run_id;

        {
            let mut guard = run.write().await;
            if let Some(record) = guard.agent_mut(&name) {
                record.mark_running();
            }
        }
        self.bus.publish(
            name.clone(),
            EventType::AgentStart,
            payload(json!({
                "phase": descriptor.phase,
                "dependencies": descriptor.dependencies,
                "degraded_inputs": inputs.degraded(),
            })),
            Some(run_id),
        );

        let started = Instant::now();
        let task_agent = agent.clone();
        let outcome = match tokio::spawn(async move { task_agent.run(inputs).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(AgentError::Panicked(panic_message(join_err.into_panic().as_ref())))
            }
            Err(_) => Err(AgentError::Cancelled),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(output) => {
                {
                    let mut guard = run.write().await;
                    if let Some(record) = guard.agent_mut(&name) {
                        record.mark_done(output.clone(), elapsed);
                    }
                }
                self.bus.publish(
                    name.clone(),
                    EventType::AgentDone,
                    payload(json!({
                        "phase": descriptor.phase,
                        "elapsed": elapsed,
                        "placeholder": output.is_placeholder(),
                    })),
                    Some(run_id),
                );
                info!(run_id = %run_id, agent = %name, elapsed_ms = (elapsed * 1000.0) as u64, "Agent done");
                Ok(output)
            }
            Err(e) => {
                let tolerated =
                    descriptor.fallback_tolerant && !matches!(e, AgentError::Cancelled);
                let placeholder = tolerated.then(|| AgentOutput::placeholder(&name, e.to_string()));
                {
                    let mut guard = run.write().await;
                    if let Some(record) = guard.agent_mut(&name) {
                        record.mark_error(e.to_string(), elapsed, placeholder.clone());
                    }
                }
                self.bus.publish(
                    name.clone(),
                    EventType::AgentError,
                    payload(json!({
                        "phase": descriptor.phase,
                        "elapsed": elapsed,
                        "error": e.to_string(),
                        "fallback": tolerated,
                    })),
                    Some(run_id),
                );

                match placeholder {
                    Some(p) => {
                        warn!(run_id = %run_id, agent = %name, error = %e, "Agent failed; substituting placeholder");
                        Ok(p)
                    }
                    None => {
                        error!(run_id = %run_id, agent = %name, error = %e, "Agent failed without fallback");
                        Err(e)
                    }
                }
            }
        }
    }

    async fn update_progress(
        &self,
        run: &RunHandle,
        tracker: &ProgressTracker,
        phase: Phase,
        percent: f64,
        message: Option<&str>,
    ) {
        match tracker.update_stage(phase.as_str(), percent, message) {
            Ok(overall) => run.write().await.progress_percent = overall,
            Err(e) => debug!(phase = %phase, "Progress update ignored: {}", e),
        }
    }

    async fn fail_run(&self, run: &RunHandle, tracker: &ProgressTracker, message: &str) {
        let run_id = {
            let mut guard = run.write().await;
            if let Err(e) = guard.fail(message) {
                error!(run_id = %guard.id, "Failure transition rejected: {}", e);
            }
            guard.id
        };
        tracker.error(message);
        error!(run_id = %run_id, error = message, "Pipeline run failed");
    }
}
