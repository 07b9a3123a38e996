use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{FfwatchError, Result};
use crate::media::ConversionOptions;
use crate::process::{AcceptedExitCodes, STDERR_EXCERPT_CHARS};

/// Configuration file looked up in the current directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "ffwatch.toml";

fn default_binary_path() -> String {
    "ffmpeg".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".ffwatch")
}

fn default_stderr_excerpt_chars() -> usize {
    STDERR_EXCERPT_CHARS
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub conversion: ConversionOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FfmpegConfig {
    /// Binary name or path. Rewritten to the resolved path by setup.
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// Binary unpacked into the work directory when nothing else is found
    #[serde(default)]
    pub bundled_path: Option<PathBuf>,
    /// Holds the unpacked binary, pid records and log files
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            bundled_path: None,
            work_dir: default_work_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// No limit when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Exit codes treated as success
    #[serde(default)]
    pub accepted_exit_codes: AcceptedExitCodes,
    /// Characters of captured stderr carried by a failure
    #[serde(default = "default_stderr_excerpt_chars")]
    pub stderr_excerpt_chars: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            accepted_exit_codes: AcceptedExitCodes::default(),
            stderr_excerpt_chars: default_stderr_excerpt_chars(),
        }
    }
}

impl SupervisorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FfwatchError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| FfwatchError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FfwatchError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| FfwatchError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Load `explicit` if given (it must exist), else `default_file` if present, else defaults.
    pub fn load(explicit: Option<&Path>, default_file: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(FfwatchError::FileNotFound(path.display().to_string()));
            }
            debug!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }
        if default_file.exists() {
            debug!("Loading configuration from {}", default_file.display());
            return Self::from_file(default_file);
        }
        debug!("No configuration file, using defaults");
        Ok(Self::default())
    }
}
