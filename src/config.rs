//! Application configuration.
//!
//! Values are layered, later sources winning:
//! built-in defaults, `dualcomp.toml` (or the file named by `DUALCOMP_CONFIG`),
//! `DUALCOMP_*` environment variables, then command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::{ConfigError, TargetSize, ToolSettings};

pub const CONFIG_FILE: &str = "dualcomp.toml";
pub const CONFIG_PATH_VAR: &str = "DUALCOMP_CONFIG";
pub const ENV_PREFIX: &str = "DUALCOMP_";

const TOOL_NAME: &str = "dual_output_image_compressor.sh";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Compressor executable.
    pub tool_path: PathBuf,
    /// Output directory used when a run does not name one.
    pub output_directory: PathBuf,
    /// Target size used when a run names neither a size nor a preset, e.g. `1MB`.
    pub target_size: String,
    pub parallel_jobs: u32,
    /// Environment variable the compressor reads its job count from.
    pub jobs_env_var: String,
    pub verbose: bool,
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            output_directory: PathBuf::from("./dual_compressed"),
            target_size: "1MB".to_string(),
            parallel_jobs: 20,
            jobs_env_var: "DUAL_COMPRESSOR_JOBS".to_string(),
            verbose: false,
            log_json: false,
        }
    }
}

impl AppConfig {
    /// Load the layered configuration, applying `overrides` last.
    ///
    /// `overrides` should skip unset fields when serialized so they do not
    /// mask lower layers.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::figment(overrides)
            .extract()
            .context("Failed to load configuration")
    }

    pub fn figment<T: Serialize>(overrides: Option<&T>) -> Figment {
        let file = std::env::var_os(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

        match overrides {
            Some(args) => figment.merge(Serialized::defaults(args)),
            None => figment,
        }
    }

    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            program: self.tool_path.clone(),
            jobs_env_var: self.jobs_env_var.clone(),
        }
    }

    pub fn default_target_size(&self) -> Result<TargetSize, ConfigError> {
        self.target_size.parse()
    }
}

/// The compressor script is expected next to the `dualcomp` binary.
fn default_tool_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::parent)
        .map(|dir| dir.join(TOOL_NAME))
        .unwrap_or_else(|| PathBuf::from(TOOL_NAME))
}
