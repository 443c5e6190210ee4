//! Bootstrap configuration loading and root folder resolution
//!
//! Configuration sources, highest priority first:
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. Built-in defaults (code constants)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "LECTERN_CONFIG";

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV_VAR: &str = "LECTERN_ROOT_FOLDER";

/// Environment variable overriding the media tool binary
pub const FFMPEG_ENV_VAR: &str = "LECTERN_FFMPEG";

/// Bootstrap configuration loaded from TOML
///
/// Every section is optional; missing values fall back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Working root folder (scratch space for extracted media)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Event bus configuration
    #[serde(default)]
    pub events: EventsConfig,

    /// Progress tracker configuration
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Turbo extraction/analysis configuration
    #[serde(default)]
    pub turbo: TurboConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Maximum number of events retained in global history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// Progress tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Number of timeline notes retained per run
    #[serde(default = "default_note_capacity")]
    pub note_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            note_capacity: default_note_capacity(),
        }
    }
}

/// Turbo engine configuration
///
/// Frame rate, frame size and audio format are fixed constants in the
/// extractor, not configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurboConfig {
    /// Media tool binary (name on PATH or absolute path)
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Try hardware-accelerated decoding first
    #[serde(default = "default_true")]
    pub use_hw_accel: bool,

    /// Cores kept free for the coordinating runtime
    #[serde(default = "default_worker_reservation")]
    pub worker_reservation: usize,

    /// Explicit worker count (overrides hardware parallelism detection)
    #[serde(default)]
    pub workers: Option<usize>,

    /// Audio analysis window length in seconds
    #[serde(default = "default_audio_segment_seconds")]
    pub audio_segment_seconds: f64,

    /// Keep extracted frames and audio after analysis
    #[serde(default)]
    pub keep_work_dir: bool,
}

impl Default for TurboConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            use_hw_accel: true,
            worker_reservation: default_worker_reservation(),
            workers: None,
            audio_segment_seconds: default_audio_segment_seconds(),
            keep_work_dir: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_history_capacity() -> usize {
    1000
}

fn default_note_capacity() -> usize {
    20
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_true() -> bool {
    true
}

fn default_worker_reservation() -> usize {
    1
}

fn default_audio_segment_seconds() -> f64 {
    10.0
}

impl TomlConfig {
    /// Validate value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.events.history_capacity == 0 {
            return Err(Error::Config(
                "events.history_capacity must be at least 1".to_string(),
            ));
        }
        if self.progress.note_capacity == 0 {
            return Err(Error::Config(
                "progress.note_capacity must be at least 1".to_string(),
            ));
        }
        if !(self.turbo.audio_segment_seconds.is_finite() && self.turbo.audio_segment_seconds >= 1.0)
        {
            return Err(Error::Config(format!(
                "turbo.audio_segment_seconds must be >= 1.0 (got {})",
                self.turbo.audio_segment_seconds
            )));
        }
        if self.turbo.workers == Some(0) {
            return Err(Error::Config("turbo.workers must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Apply environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV_VAR) {
            self.root_folder = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var(FFMPEG_ENV_VAR) {
            self.turbo.ffmpeg_path = PathBuf::from(path);
        }
    }
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Resolve the bootstrap configuration
///
/// Uses the CLI path if given, then `LECTERN_CONFIG`, then the platform
/// config file if it exists, then defaults. Environment overrides are
/// applied last.
pub fn resolve_config(cli_path: Option<&Path>) -> Result<TomlConfig> {
    let explicit = cli_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));

    let mut config = match explicit {
        // An explicitly named file must exist
        Some(path) => {
            info!("Loading config from {}", path.display());
            load_toml_config(&path)?
        }
        None => match default_config_file().filter(|p| p.exists()) {
            Some(path) => {
                info!("Loading config from {}", path.display());
                load_toml_config(&path)?
            }
            None => {
                debug!("No config file found, using built-in defaults");
                TomlConfig::default()
            }
        },
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Resolve the working root folder
///
/// Priority: CLI argument → environment variable → TOML value → OS default
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV_VAR) {
        return PathBuf::from(path);
    }
    if let Some(path) = &config.root_folder {
        return path.clone();
    }
    default_root_folder()
}

/// Platform config file location (`<config dir>/lectern/lectern.toml`)
fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("lectern").join("lectern.toml"))
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("lectern"))
        .unwrap_or_else(|| std::env::temp_dir().join("lectern"))
}
