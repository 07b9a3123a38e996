// Media model and processing operations
//
// This module provides the media-facing side of the supervisor:
// - Model: the media file a run reports on, with the stream descriptors found in its preamble
// - Commands: argument builders that serialise conversion options into a flat argument string
// - Processor: convert/probe/version operations on top of the process supervisor

pub mod commands;
pub mod processor;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use commands::*;
pub use processor::*;

use crate::config::Config;
use crate::error::Result;
use crate::events::EventEmitter;
use crate::process::{ProcessSupervisor, RunOutcome};
use crate::setup::PidTracker;

/// Video stream descriptor from the diagnostic preamble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStream {
    pub codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<u32>,
}

impl VideoStream {
    /// `1920x1080` style geometry, when both dimensions are known.
    pub fn resolution(&self) -> Option<String> {
        Some(format!("{}x{}", self.width?, self.height?))
    }
}

/// Audio stream descriptor from the diagnostic preamble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStream {
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<String>,
    pub bitrate_kbps: Option<u32>,
}

/// The media file a supervised run reports on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    pub path: PathBuf,
    pub duration: Option<Duration>,
    pub video: Option<VideoStream>,
    pub audio: Option<AudioStream>,
}

/// Media file shared between the caller and the reducer of a running invocation.
pub type SharedMediaFile = Arc<Mutex<MediaFile>>;

impl MediaFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn shared<P: AsRef<Path>>(path: P) -> SharedMediaFile {
        Arc::new(Mutex::new(Self::new(path)))
    }

    /// Record the video descriptor unless one is already known.
    /// Returns whether the descriptor was recorded.
    pub fn attach_video(&mut self, stream: VideoStream) -> bool {
        if self.video.is_some() {
            return false;
        }
        self.video = Some(stream);
        true
    }

    /// Record the audio descriptor unless one is already known.
    pub fn attach_audio(&mut self, stream: AudioStream) -> bool {
        if self.audio.is_some() {
            return false;
        }
        self.audio = Some(stream);
        true
    }

    pub fn attach_duration(&mut self, duration: Duration) {
        self.duration.get_or_insert(duration);
    }
}

/// One conversion request.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: ConversionOptions,
    /// Overrides the configured timeout when set.
    pub timeout: Option<Duration>,
}

impl ConversionJob {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q, options: ConversionOptions) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            options,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a successful conversion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub media: MediaFile,
    pub output: PathBuf,
    pub exit_code: Option<i32>,
    pub total_duration: Duration,
    pub elapsed: Duration,
}

/// Main trait for media processing operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProcessorTrait: Send + Sync {
    /// Convert a media file, emitting progress events while it runs
    async fn convert(&self, job: &ConversionJob) -> Result<ConversionReport>;

    /// Read duration and stream descriptors of a media file
    async fn probe(&self, input: &Path) -> Result<MediaFile>;

    /// Check if the media processor binary can be started
    async fn check_availability(&self) -> Result<()>;

    /// Get media processor version information
    async fn get_version_info(&self) -> Result<String>;

    /// Execute a custom media processing command
    async fn execute_command(&self, command: MediaCommand) -> Result<RunOutcome>;

    /// Emitter that receives progress and completion events of every run
    fn events(&self) -> Arc<EventEmitter>;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    /// Create the default media processor implementation (FFmpeg-based)
    pub fn create_processor(config: Config) -> Box<dyn MediaProcessorTrait> {
        Box::new(processor::MediaProcessorImpl::new(
            config,
            Arc::new(ProcessSupervisor::new()),
        ))
    }

    /// Same as `create_processor`, recording every started child in `tracker`
    pub fn create_tracked_processor(config: Config, tracker: PidTracker) -> Box<dyn MediaProcessorTrait> {
        Box::new(processor::MediaProcessorImpl::new(
            config,
            Arc::new(ProcessSupervisor::new().with_pid_tracker(tracker)),
        ))
    }
}
