use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which of the fatal outcomes a supervised run ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The OS could not start the process.
    LaunchFailed,
    /// The process exceeded its time limit and was killed.
    TimedOut,
    /// Interpreting a diagnostic line (or notifying a subscriber) failed.
    InternalFailure,
    /// The process exited with a code outside the accepted set.
    ExitCode,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureKind::LaunchFailed => "process failed to start",
            FailureKind::TimedOut => "process timed out",
            FailureKind::InternalFailure => "output interpretation failed",
            FailureKind::ExitCode => "process exited with a failure code",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum FfwatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Executable not found: {0}")]
    BinaryNotFound(String),

    #[error("Provisioning error: {0}")]
    Provision(String),

    #[error("Invalid argument string: {0}")]
    InvalidArguments(String),

    #[error("Failed to parse diagnostic line: {0}")]
    Parse(String),

    #[error("Event subscriber failed: {0}")]
    Subscriber(String),

    #[error("Failed to start {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} (exit code {}): {stderr}", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    ProcessFailed {
        kind: FailureKind,
        exit_code: Option<i32>,
        stderr: String,
        #[source]
        cause: Option<Box<FfwatchError>>,
    },
}

impl FfwatchError {
    /// Exit code carried by a `ProcessFailed` error.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            FfwatchError::ProcessFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FfwatchError::ProcessFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FfwatchError>;
