//! External media extraction
//!
//! Drives the external transcoding tool to produce downsampled frame images
//! and a resampled mono audio track. Frame and audio extraction run as two
//! concurrent processes. Hardware-accelerated decode is tried first when the
//! tool reports CUDA support; a failed hardware pass is retried on the
//! software path without the caller seeing the intermediate failure.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Sampled frames per second of video
pub const FRAME_RATE: u32 = 1;
pub const FRAME_WIDTH: u32 = 640;
pub const FRAME_HEIGHT: u32 = 360;
pub const AUDIO_SAMPLE_RATE: u32 = 16_000;
pub const AUDIO_CHANNELS: u16 = 1;

/// Frame file naming: `frame_0001.jpg`, `frame_0002.jpg`, ...
pub const FRAME_PREFIX: &str = "frame_";
pub const FRAME_EXTENSION: &str = "jpg";
const FRAME_PATTERN: &str = "frame_%04d.jpg";
pub const AUDIO_FILE_NAME: &str = "audio.wav";

/// Accelerator probe results, keyed by tool path
static HW_ACCEL_CACHE: Lazy<Mutex<HashMap<PathBuf, bool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Media tool not found: {}", .0.display())]
    ToolNotFound(PathBuf),

    #[error("Failed to start media tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Input video not found: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("Frame extraction failed (hardware: {hardware}; software: {software})")]
    HardwareAndSoftwareFailed { hardware: String, software: String },

    #[error("Media tool exited unsuccessfully: {0}")]
    ToolFailed(String),

    #[error("Frame extraction failed: {0}")]
    FramesFailed(String),

    #[error("Audio extraction failed: {0}")]
    AudioFailed(String),

    #[error("Extraction produced no frames")]
    NoFrames,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output of one extraction
#[derive(Debug, Clone)]
pub struct ExtractedMedia {
    /// Frame images in capture order
    pub frames: Vec<PathBuf>,
    pub audio: PathBuf,
    /// Frames came from the hardware-accelerated path
    pub hw_accelerated: bool,
    pub elapsed_seconds: f64,
}

/// Seconds from video start of a frame file, from its 1-based sequence number
pub fn frame_timestamp(path: &Path) -> Option<f64> {
    frame_number(path).map(|n| n.saturating_sub(1) as f64 / FRAME_RATE as f64)
}

fn frame_number(path: &Path) -> Option<u64> {
    let ext = path.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case(FRAME_EXTENSION) {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(FRAME_PREFIX)?
        .parse::<u64>()
        .ok()
}

/// Frame files in `dir`, sorted by sequence number
pub async fn list_frames(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut frames: Vec<(u64, PathBuf)> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(n) = frame_number(&path) {
            frames.push((n, path));
        }
    }
    frames.sort_by_key(|(n, _)| *n);
    Ok(frames.into_iter().map(|(_, p)| p).collect())
}

/// Wrapper around the external media tool
#[derive(Debug, Clone)]
pub struct MediaExtractor {
    tool: PathBuf,
    use_hw_accel: bool,
}

impl MediaExtractor {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            use_hw_accel: true,
        }
    }

    pub fn with_hw_accel(mut self, enabled: bool) -> Self {
        self.use_hw_accel = enabled;
        self
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Whether the tool reports CUDA decode support
    ///
    /// Probed once per tool path per process.
    pub async fn hw_accel_available(&self) -> bool {
        if let Some(cached) = self.cached_probe() {
            return cached;
        }

        let available = match Command::new(&self.tool)
            .args(["-hide_banner", "-hwaccels"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
        {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .any(|l| l.trim() == "cuda")
            }
            Err(e) => {
                debug!(tool = %self.tool.display(), "Accelerator probe failed: {}", e);
                false
            }
        };

        debug!(tool = %self.tool.display(), available, "Hardware accelerator probe");
        HW_ACCEL_CACHE
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(self.tool.clone(), available);
        available
    }

    fn cached_probe(&self) -> Option<bool> {
        HW_ACCEL_CACHE
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&self.tool)
            .copied()
    }

    /// Extract frames and audio from `video` into `output_dir`
    ///
    /// `output_dir` is emptied first.
    pub async fn extract(&self, video: &Path, output_dir: &Path) -> Result<ExtractedMedia, ExtractError> {
        if !fs::try_exists(video).await.unwrap_or(false) {
            return Err(ExtractError::InputMissing(video.to_path_buf()));
        }

        if fs::try_exists(output_dir).await.unwrap_or(false) {
            fs::remove_dir_all(output_dir).await?;
        }
        fs::create_dir_all(output_dir).await?;

        let started = Instant::now();
        let hw = self.use_hw_accel && self.hw_accel_available().await;
        info!(
            video = %video.display(),
            hw_accel = hw,
            "Extracting frames at {} fps ({}x{}) and {} Hz mono audio",
            FRAME_RATE, FRAME_WIDTH, FRAME_HEIGHT, AUDIO_SAMPLE_RATE
        );

        let (frames, audio) = tokio::join!(
            self.extract_frames(video, output_dir, hw),
            self.extract_audio(video, output_dir)
        );
        let (frames, hw_accelerated) = frames?;
        let audio = audio?;

        let elapsed_seconds = started.elapsed().as_secs_f64();
        info!(
            frames = frames.len(),
            hw_accelerated,
            elapsed_ms = (elapsed_seconds * 1000.0) as u64,
            "Extraction complete"
        );

        Ok(ExtractedMedia {
            frames,
            audio,
            hw_accelerated,
            elapsed_seconds,
        })
    }

    async fn extract_frames(
        &self,
        video: &Path,
        output_dir: &Path,
        hw: bool,
    ) -> Result<(Vec<PathBuf>, bool), ExtractError> {
        let pattern = output_dir.join(FRAME_PATTERN);

        let hw_failure = if hw {
            match self.run_tool(hardware_frame_args(video, &pattern)).await {
                Ok(()) => match list_frames(output_dir).await? {
                    frames if !frames.is_empty() => return Ok((frames, true)),
                    _ => Some("no frames produced".to_string()),
                },
                Err(ExtractError::ToolNotFound(p)) => return Err(ExtractError::ToolNotFound(p)),
                Err(e) => Some(e.to_string()),
            }
        } else {
            None
        };

        if let Some(reason) = &hw_failure {
            warn!(video = %video.display(), "Hardware decode failed, retrying in software: {}", reason);
            for frame in list_frames(output_dir).await? {
                if let Err(e) = fs::remove_file(&frame).await {
                    warn!(frame = %frame.display(), "Failed to remove hardware-path frame: {}", e);
                }
            }
        }

        match self.run_tool(software_frame_args(video, &pattern)).await {
            Ok(()) => {}
            Err(ExtractError::ToolNotFound(p)) => return Err(ExtractError::ToolNotFound(p)),
            Err(e) => {
                return Err(match hw_failure {
                    Some(hardware) => ExtractError::HardwareAndSoftwareFailed {
                        hardware,
                        software: e.to_string(),
                    },
                    None => ExtractError::FramesFailed(e.to_string()),
                })
            }
        }

        let frames = list_frames(output_dir).await?;
        if frames.is_empty() {
            return Err(ExtractError::NoFrames);
        }
        Ok((frames, false))
    }

    async fn extract_audio(&self, video: &Path, output_dir: &Path) -> Result<PathBuf, ExtractError> {
        let audio = output_dir.join(AUDIO_FILE_NAME);
        match self.run_tool(audio_args(video, &audio)).await {
            Ok(()) => {}
            Err(ExtractError::ToolNotFound(p)) => return Err(ExtractError::ToolNotFound(p)),
            Err(e) => return Err(ExtractError::AudioFailed(e.to_string())),
        }
        let size = fs::metadata(&audio).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(ExtractError::AudioFailed(format!(
                "{} missing or empty",
                audio.display()
            )));
        }
        Ok(audio)
    }

    /// Run the tool to completion; non-zero exit is an error carrying stderr
    async fn run_tool(&self, args: Vec<OsString>) -> Result<(), ExtractError> {
        debug!(tool = %self.tool.display(), ?args, "Running media tool");
        let output = Command::new(&self.tool)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ExtractError::ToolNotFound(self.tool.clone()),
                _ => ExtractError::Spawn(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(ExtractError::ToolFailed(format!("{} ({})", output.status, tail)));
        }
        Ok(())
    }
}

fn preamble() -> Vec<OsString> {
    ["-hide_banner", "-loglevel", "error", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect()
}

fn input_args(video: &Path) -> [OsString; 2] {
    ["-i".into(), video.as_os_str().to_owned()]
}

fn hardware_frame_args(video: &Path, pattern: &Path) -> Vec<OsString> {
    let mut args = preamble();
    args.extend(["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"].map(OsString::from));
    args.extend(input_args(video));
    args.extend([
        "-vf".into(),
        format!(
            "scale_cuda={}:{},hwdownload,format=nv12,fps={}",
            FRAME_WIDTH, FRAME_HEIGHT, FRAME_RATE
        )
        .into(),
        "-q:v".into(),
        "2".into(),
        pattern.as_os_str().to_owned(),
    ]);
    args
}

fn software_frame_args(video: &Path, pattern: &Path) -> Vec<OsString> {
    let mut args = preamble();
    args.extend(input_args(video));
    args.extend([
        "-vf".into(),
        format!("fps={},scale={}:{}", FRAME_RATE, FRAME_WIDTH, FRAME_HEIGHT).into(),
        "-q:v".into(),
        "2".into(),
        pattern.as_os_str().to_owned(),
    ]);
    args
}

fn audio_args(video: &Path, audio: &Path) -> Vec<OsString> {
    let mut args = preamble();
    args.extend(input_args(video));
    args.extend([
        "-vn".into(),
        "-acodec".into(),
        "pcm_s16le".into(),
        "-ar".into(),
        AUDIO_SAMPLE_RATE.to_string().into(),
        "-ac".into(),
        AUDIO_CHANNELS.to_string().into(),
        audio.as_os_str().to_owned(),
    ]);
    args
}
