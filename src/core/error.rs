use std::path::PathBuf;
use thiserror::Error;

/// A job configuration that must not reach the compressor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("No input directory given")]
    MissingInput,

    #[error("Input directory does not exist: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("Input path is not a directory: {}", .0.display())]
    InputNotDirectory(PathBuf),

    #[error("No output directory given")]
    MissingOutput,

    #[error("Invalid target size: {0}")]
    InvalidTargetSize(String),

    #[error("Parallel jobs must be between {min} and {max}, got {value}")]
    ParallelismOutOfRange { value: u32, min: u32, max: u32 },
}

/// The compressor executable could not be launched.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Compressor not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Compressor is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    #[error("Permission denied launching {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Failed to launch {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a `start` request was refused.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("A compression run is already active ({0})")]
    ConcurrentRun(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Run {0} is not running")]
pub struct NotRunningError(pub String);
