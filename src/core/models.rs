use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ConfigError;

pub const MIN_PARALLELISM: u32 = 1;
pub const MAX_PARALLELISM: u32 = 32;

// "300KB", "1 mb", "2M", "800k"
static TARGET_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*([kKmM])[bB]?\s*$").expect("target size pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    #[serde(rename = "KB")]
    Kilobytes,
    #[serde(rename = "MB")]
    Megabytes,
}

impl SizeUnit {
    /// Single-letter unit used by the compressor's size flag.
    pub fn flag_letter(&self) -> char {
        match self {
            Self::Kilobytes => 'k',
            Self::Megabytes => 'm',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kilobytes => "KB",
            Self::Megabytes => "MB",
        }
    }
}

/// Target file size handed to the compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub value: u32,
    pub unit: SizeUnit,
}

impl TargetSize {
    pub fn kilobytes(value: u32) -> Self {
        Self {
            value,
            unit: SizeUnit::Kilobytes,
        }
    }

    pub fn megabytes(value: u32) -> Self {
        Self {
            value,
            unit: SizeUnit::Megabytes,
        }
    }

    /// The positional size argument, `-k<N>` or `-m<N>`.
    pub fn flag(&self) -> String {
        format!("-{}{}", self.unit.flag_letter(), self.value)
    }
}

impl Default for TargetSize {
    fn default() -> Self {
        Self::megabytes(1)
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.as_str())
    }
}

impl FromStr for TargetSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = TARGET_SIZE_RE
            .captures(s)
            .ok_or_else(|| ConfigError::InvalidTargetSize(s.to_string()))?;

        let value: u32 = caps[1]
            .parse()
            .map_err(|_| ConfigError::InvalidTargetSize(s.to_string()))?;

        let unit = match &caps[2] {
            "k" | "K" => SizeUnit::Kilobytes,
            _ => SizeUnit::Megabytes,
        };

        let size = Self { value, unit };
        if size.value == 0 {
            return Err(ConfigError::InvalidTargetSize(s.to_string()));
        }
        Ok(size)
    }
}

/// Quick settings for common output targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    Web,
    Social,
    Standard,
    HighQuality,
    Print,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Web,
        Preset::Social,
        Preset::Standard,
        Preset::HighQuality,
        Preset::Print,
    ];

    pub fn target_size(&self) -> TargetSize {
        match self {
            Self::Web => TargetSize::kilobytes(300),
            Self::Social => TargetSize::kilobytes(800),
            Self::Standard => TargetSize::megabytes(1),
            Self::HighQuality => TargetSize::megabytes(2),
            Self::Print => TargetSize::megabytes(3),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Web => "Web",
            Self::Social => "Social Media",
            Self::Standard => "Standard",
            Self::HighQuality => "High Quality",
            Self::Print => "Print",
        }
    }
}

/// Everything needed to launch one compression job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub target_size: TargetSize,
    pub parallelism: u32,
}

impl JobConfig {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            target_size: TargetSize::default(),
            parallelism: 20,
        }
    }

    pub fn with_target_size(mut self, target_size: TargetSize) -> Self {
        self.target_size = target_size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Checks the configuration against the filesystem.
    ///
    /// Must pass before any process is spawned. The input directory is
    /// checked every time since it can disappear between runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if is_blank(&self.input_dir) {
            return Err(ConfigError::MissingInput);
        }
        if is_blank(&self.output_dir) {
            return Err(ConfigError::MissingOutput);
        }

        match std::fs::metadata(&self.input_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(ConfigError::InputNotDirectory(self.input_dir.clone())),
            Err(_) => return Err(ConfigError::InputNotFound(self.input_dir.clone())),
        }

        if self.target_size.value == 0 {
            return Err(ConfigError::InvalidTargetSize(self.target_size.to_string()));
        }

        if !(MIN_PARALLELISM..=MAX_PARALLELISM).contains(&self.parallelism) {
            return Err(ConfigError::ParallelismOutOfRange {
                value: self.parallelism,
                min: MIN_PARALLELISM,
                max: MAX_PARALLELISM,
            });
        }

        Ok(())
    }

    /// Positional arguments for the compressor: input, output, size flag.
    ///
    /// Paths are passed through as raw OS strings, never re-encoded.
    pub fn tool_args(&self) -> Vec<OsString> {
        vec![
            self.input_dir.clone().into_os_string(),
            self.output_dir.clone().into_os_string(),
            self.target_size.flag().into(),
        ]
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether a run in this state blocks a new `start`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTag {
    Progress,
    Success,
    Error,
    Warning,
    Plain,
}

/// One line of compressor output, classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub seq: u64,
    pub tag: LogTag,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub run_id: RunId,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub run_id: RunId,
    pub from: RunState,
    pub to: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Events delivered to the consumer, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Log { run_id: RunId, event: LogEvent },
    Progress(ProgressUpdate),
    Lifecycle(LifecycleTransition),
}

/// Snapshot of one execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: RunId,
    pub config: JobConfig,
    pub state: RunState,
    pub progress: f64,
    pub logs: Vec<LogEvent>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Formats a duration as `MM:SS`.
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
