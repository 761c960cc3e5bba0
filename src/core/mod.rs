pub mod classifier;
pub mod controller;
pub mod error;
pub mod models;
pub mod progress;
pub mod supervisor;

pub use classifier::classify;
pub use controller::{JobController, RunHandle, ToolSettings};
pub use error::{ConfigError, NotRunningError, SpawnError, StartError};
pub use models::{
    JobConfig, JobEvent, JobRun, LifecycleTransition, LogEvent, LogTag, Preset, ProgressUpdate,
    RunId, RunState, SizeUnit, TargetSize,
};
pub use progress::ProgressEstimator;
pub use supervisor::{ExitOutcome, OutputLines, ProcessHandle};
