//! Built-in agents
//!
//! `extractor` runs the turbo engine; `vision`, `content` and `vibe`
//! condense its timelines; `report` merges whatever the analyzers
//! produced. Scoring and feedback agents are registered by the caller.

use super::{Agent, AgentDescriptor, AgentError, AgentInputs, AgentOutput, Phase};
use crate::error::RegistryError;
use crate::models::TurboResult;
use crate::services::turbo::TurboEngine;
use crate::workflow::registry::AgentRegistry;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

pub const EXTRACTOR: &str = "extractor";
pub const VISION: &str = "vision";
pub const CONTENT: &str = "content";
pub const VIBE: &str = "vibe";
pub const REPORT: &str = "report";

fn turbo_input(inputs: &AgentInputs) -> Result<&Arc<TurboResult>, AgentError> {
    inputs
        .require(EXTRACTOR)?
        .as_turbo()
        .ok_or_else(|| AgentError::MissingInput(EXTRACTOR.to_string()))
}

fn mean_std(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Extracts and analyzes the video with the turbo engine
pub struct ExtractorAgent {
    descriptor: AgentDescriptor,
    engine: Arc<TurboEngine>,
}

impl ExtractorAgent {
    pub fn new(engine: Arc<TurboEngine>) -> Self {
        Self {
            descriptor: AgentDescriptor::new(EXTRACTOR, "media extraction and parallel analysis", Phase::Extract),
            engine,
        }
    }
}

#[async_trait]
impl Agent for ExtractorAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn run(&self, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        let work_dir = self.engine.work_dir_for(inputs.run_id);
        match self.engine.run(&inputs.video, &work_dir, &inputs.cancel).await {
            Ok(result) => Ok(AgentOutput::turbo(result)),
            Err(e) if e.is_cancelled() => Err(AgentError::Cancelled),
            Err(e) => Err(AgentError::failed(e.to_string())),
        }
    }
}

/// Frame-level visual statistics
pub struct VisionAgent {
    descriptor: AgentDescriptor,
}

impl VisionAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new(VISION, "visual behavior", Phase::Analyze).depends_on([EXTRACTOR]),
        }
    }
}

impl Default for VisionAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for VisionAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn run(&self, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        let turbo = turbo_input(&inputs)?;
        if turbo.frame_timeline.is_empty() {
            return Err(AgentError::failed("no analyzable frames"));
        }

        let (brightness_mean, brightness_std) = mean_std(turbo.frame_timeline.iter().map(|f| f.vision.brightness));
        let (contrast_mean, _) = mean_std(turbo.frame_timeline.iter().map(|f| f.vision.contrast));

        Ok(AgentOutput::summary(json!({
            "frames_analyzed": turbo.frame_timeline.len(),
            "frames_skipped": turbo.skipped_frames.len(),
            "brightness_mean": brightness_mean,
            "brightness_std": brightness_std,
            "contrast_mean": contrast_mean,
        })))
    }
}

/// On-screen content statistics
pub struct ContentAgent {
    descriptor: AgentDescriptor,
}

impl ContentAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new(CONTENT, "on-screen content", Phase::Analyze).depends_on([EXTRACTOR]),
        }
    }
}

impl Default for ContentAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ContentAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn run(&self, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        let turbo = turbo_input(&inputs)?;
        let frames = &turbo.frame_timeline;
        if frames.is_empty() {
            return Err(AgentError::failed("no analyzable frames"));
        }

        let slides = frames.iter().filter(|f| f.content.is_slide).count();
        // Entries into slide content
        let slide_segments = frames
            .iter()
            .zip(std::iter::once(false).chain(frames.iter().map(|f| f.content.is_slide)))
            .filter(|(f, prev)| f.content.is_slide && !prev)
            .count();
        let (edge_density_mean, _) = mean_std(frames.iter().map(|f| f.content.edge_density));

        Ok(AgentOutput::summary(json!({
            "slide_ratio": slides as f64 / frames.len() as f64,
            "slide_segments": slide_segments,
            "edge_density_mean": edge_density_mean,
        })))
    }
}

/// Audio prosody summary
pub struct VibeAgent {
    descriptor: AgentDescriptor,
}

impl VibeAgent {
    pub fn new() -> Self {
        Self {
            descriptor: AgentDescriptor::new(VIBE, "audio prosody", Phase::Analyze).depends_on([EXTRACTOR]),
        }
    }
}

impl Default for VibeAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for VibeAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn run(&self, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        let turbo = turbo_input(&inputs)?;
        let Some(metrics) = &turbo.audio_metrics else {
            let reason = turbo.audio_error.as_deref().unwrap_or("no audio track");
            return Err(AgentError::failed(format!("audio unavailable: {}", reason)));
        };

        let segments = &turbo.audio_timeline;
        let monotone = segments.iter().filter(|s| s.is_monotone && !s.is_silent).count();
        let placeholders = segments.iter().filter(|s| s.placeholder).count();

        Ok(AgentOutput::summary(json!({
            "duration_seconds": metrics.duration_seconds,
            "speaking_ratio": turbo.speaking_ratio(),
            "silence_ratio": metrics.silence_ratio,
            "energy_mean": metrics.energy_mean,
            "pitch_std": metrics.pitch_std,
            "is_monotone": metrics.is_monotone,
            "monotone_segments": monotone,
            "segments": segments.len(),
            "placeholder_segments": placeholders,
        })))
    }
}

/// Final report: every analyzer section plus the list of placeholders
pub struct ReportAgent {
    descriptor: AgentDescriptor,
}

impl ReportAgent {
    pub fn new() -> Self {
        Self::with_sections([VISION, CONTENT, VIBE])
    }

    /// Report over an arbitrary set of upstream agents
    pub fn with_sections<I, S>(sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            descriptor: AgentDescriptor::new(REPORT, "report synthesis", Phase::Synthesize).depends_on(sections),
        }
    }
}

impl Default for ReportAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ReportAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn run(&self, inputs: AgentInputs) -> Result<AgentOutput, AgentError> {
        let mut sections = Map::new();
        for name in &self.descriptor.dependencies {
            let value = match inputs.get(name) {
                Some(AgentOutput::Summary { value }) => value.clone(),
                Some(AgentOutput::Turbo { result }) => json!({
                    "frame_count": result.frame_count,
                    "elapsed_seconds": result.elapsed_seconds,
                }),
                Some(AgentOutput::Placeholder { .. }) | None => Value::Null,
            };
            sections.insert(name.clone(), value);
        }

        let placeholders = inputs.degraded();
        debug!(run_id = %inputs.run_id, degraded = ?placeholders, "Report assembled");

        Ok(AgentOutput::summary(json!({
            "run_id": inputs.run_id,
            "video": inputs.video,
            "sections": sections,
            "placeholders": placeholders,
            "complete": placeholders.is_empty(),
        })))
    }
}

/// Registry of the built-in agents around `engine`
pub fn default_registry(engine: Arc<TurboEngine>) -> Result<AgentRegistry, RegistryError> {
    AgentRegistry::builder()
        .register(ExtractorAgent::new(engine))
        .register(VisionAgent::new())
        .register(ContentAgent::new())
        .register(VibeAgent::new())
        .register(ReportAgent::new())
        .build()
}
