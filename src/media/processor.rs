use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ConversionJob, ConversionReport, MediaCommand, MediaCommandBuilder, MediaFile,
    MediaProcessorTrait,
};
use crate::config::Config;
use crate::error::{FfwatchError, Result};
use crate::events::EventEmitter;
use crate::process::{AcceptedExitCodes, ProcessSupervisorTrait, ProgressReducer, RunOutcome};

/// Exit code of the tool when it was given an input but no output.
const NO_OUTPUT_EXIT_CODE: i32 = 1;

/// Concrete implementation of media processor (FFmpeg-based)
pub struct MediaProcessorImpl {
    config: Config,
    command_builder: MediaCommandBuilder,
    supervisor: Arc<dyn ProcessSupervisorTrait>,
    emitter: Arc<EventEmitter>,
}

impl MediaProcessorImpl {
    pub fn new(config: Config, supervisor: Arc<dyn ProcessSupervisorTrait>) -> Self {
        let command_builder = MediaCommandBuilder::new(&config.ffmpeg.binary_path);

        Self {
            config,
            command_builder,
            supervisor,
            emitter: Arc::new(EventEmitter::new()),
        }
    }

    pub fn command_builder(&self) -> &MediaCommandBuilder {
        &self.command_builder
    }

    async fn supervise(
        &self,
        command: &MediaCommand,
        timeout: Option<Duration>,
        reducer: ProgressReducer,
        accepted: &AcceptedExitCodes,
    ) -> Result<RunOutcome> {
        debug!(
            "{}: {} {}",
            command.description,
            command.binary_path.display(),
            command.command_line()
        );

        let outcome = self
            .supervisor
            .run(command.to_launch_spec(timeout), reducer)
            .await;
        outcome.ensure_success(accepted, self.config.supervisor.stderr_excerpt_chars)
    }

    fn require_input(input: &Path) -> Result<()> {
        if input.exists() {
            Ok(())
        } else {
            Err(FfwatchError::FileNotFound(input.display().to_string()))
        }
    }
}

#[async_trait]
impl MediaProcessorTrait for MediaProcessorImpl {
    async fn convert(&self, job: &ConversionJob) -> Result<ConversionReport> {
        Self::require_input(&job.input)?;
        if let Some(parent) = job.output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        info!("Converting {} -> {}", job.input.display(), job.output.display());

        let media = MediaFile::shared(&job.input);
        let reducer =
            ProgressReducer::new(Arc::clone(&self.emitter)).with_media(Arc::clone(&media));
        let command = self
            .command_builder
            .convert(&job.input, &job.output, &job.options);
        let timeout = job.timeout.or_else(|| self.config.supervisor.timeout());

        let outcome = self
            .supervise(&command, timeout, reducer, &self.config.supervisor.accepted_exit_codes)
            .await?;

        info!(
            "Conversion completed in {:.1}s",
            outcome.elapsed.as_secs_f64()
        );

        let media = media.lock().clone();
        Ok(ConversionReport {
            media,
            output: job.output.clone(),
            exit_code: outcome.exit_code,
            total_duration: outcome.total_duration,
            elapsed: outcome.elapsed,
        })
    }

    async fn probe(&self, input: &Path) -> Result<MediaFile> {
        Self::require_input(input)?;
        debug!("Probing {}", input.display());

        let media = MediaFile::shared(input);
        let reducer = ProgressReducer::detached().with_media(Arc::clone(&media));
        let accepted = self
            .config
            .supervisor
            .accepted_exit_codes
            .clone()
            .with_code(NO_OUTPUT_EXIT_CODE);

        self.supervise(
            &self.command_builder.probe(input),
            self.config.supervisor.timeout(),
            reducer,
            &accepted,
        )
        .await?;

        let media = media.lock().clone();
        if media.duration.is_none() && media.video.is_none() && media.audio.is_none() {
            return Err(FfwatchError::Parse(format!(
                "no stream information found for {}",
                input.display()
            )));
        }
        Ok(media)
    }

    async fn check_availability(&self) -> Result<()> {
        match self.get_version_info().await {
            Ok(version) => {
                info!("Media processor is available: {}", version);
                Ok(())
            }
            Err(e) => Err(FfwatchError::BinaryNotFound(format!(
                "{} ({})",
                self.config.ffmpeg.binary_path, e
            ))),
        }
    }

    async fn get_version_info(&self) -> Result<String> {
        debug!("Getting media processor version information");

        let outcome = self
            .supervise(
                &self.command_builder.version_check(),
                self.config.supervisor.timeout(),
                ProgressReducer::detached(),
                &self.config.supervisor.accepted_exit_codes,
            )
            .await?;

        let first_line = outcome.stdout.lines().next().unwrap_or("Unknown version");
        Ok(first_line.to_string())
    }

    async fn execute_command(&self, command: MediaCommand) -> Result<RunOutcome> {
        info!("Executing custom media processing command: {}", command.description);
        self.supervise(
            &command,
            self.config.supervisor.timeout(),
            ProgressReducer::new(Arc::clone(&self.emitter)),
            &self.config.supervisor.accepted_exit_codes,
        )
        .await
    }

    fn events(&self) -> Arc<EventEmitter> {
        Arc::clone(&self.emitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::events::TranscodeEvent;
    use crate::media::ConversionOptions;
    use crate::process::{MockProcessSupervisorTrait, Termination};
    use tempfile::TempDir;

    const PREAMBLE: [&str; 3] = [
        "  Duration: 00:00:10.00, start: 0.000000, bitrate: 1205 kb/s",
        "    Stream #0:0(und): Video: h264 (High), yuv420p, 1280x720, 1000 kb/s, 30 fps",
        "    Stream #0:1(und): Audio: aac (LC), 48000 Hz, stereo, fltp, 128 kb/s",
    ];

    fn outcome(exit_code: Option<i32>, stdout: &str, stderr: &str) -> RunOutcome {
        RunOutcome {
            termination: Termination::Completed,
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            internal_failure: None,
            total_duration: Duration::ZERO,
            pid: Some(4242),
            elapsed: Duration::from_millis(20),
        }
    }

    fn processor(mock: MockProcessSupervisorTrait, config: Config) -> MediaProcessorImpl {
        MediaProcessorImpl::new(config, Arc::new(mock))
    }

    fn input_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("input.mp4");
        std::fs::write(&path, b"not really a movie").unwrap();
        path
    }

    #[tokio::test]
    async fn test_convert_reports_media_and_emits_events() {
        let dir = TempDir::new().unwrap();
        let input = input_file(&dir);
        let output = dir.path().join("out").join("output.mkv");

        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run().times(1).returning(|spec, reducer| {
            assert!(spec.argument_string().contains("-c:v libx264"));
            assert_eq!(spec.time_limit(), Some(Duration::from_secs(3)));
            for line in PREAMBLE {
                reducer.consume_line(line).unwrap();
            }
            reducer
                .consume_line("frame=150 fps=30 size=512kB time=00:00:05.00 bitrate=838.9kbits/s speed=2x")
                .unwrap();
            let mut result = outcome(Some(0), "", "");
            result.total_duration = reducer.total_duration();
            result
        });

        let processor = processor(mock, Config::default());
        let (_, mut events) = processor.events().channel();
        let job = ConversionJob::new(&input, &output, ConversionOptions::default())
            .with_timeout(Duration::from_secs(3));

        let report = processor.convert(&job).await.unwrap();

        assert!(output.parent().unwrap().is_dir());
        assert_eq!(report.total_duration, Duration::from_secs(10));
        assert_eq!(report.media.duration, Some(Duration::from_secs(10)));
        assert_eq!(report.media.video.unwrap().codec, "h264");
        assert_eq!(report.media.audio.unwrap().sample_rate, Some(48000));
        match events.try_recv().unwrap() {
            TranscodeEvent::Progress(snapshot) => assert_eq!(snapshot.ratio(), Some(0.5)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_convert_uses_configured_timeout() {
        let dir = TempDir::new().unwrap();
        let input = input_file(&dir);

        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run()
            .withf(|spec, _| spec.time_limit() == Some(Duration::from_millis(750)))
            .returning(|_, _| outcome(Some(0), "", ""));

        let mut config = Config::default();
        config.supervisor.timeout_ms = Some(750);
        let job = ConversionJob::new(&input, dir.path().join("o.mp4"), ConversionOptions::default());
        assert!(processor(mock, config).convert(&job).await.is_ok());
    }

    #[tokio::test]
    async fn test_convert_failure_carries_stderr_excerpt() {
        let dir = TempDir::new().unwrap();
        let input = input_file(&dir);

        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run()
            .returning(|_, _| outcome(Some(2), "", "Unknown encoder 'libnothing'"));

        let mut config = Config::default();
        config.supervisor.stderr_excerpt_chars = 7;
        let job = ConversionJob::new(&input, dir.path().join("o.mp4"), ConversionOptions::default());

        let err = processor(mock, config).convert(&job).await.unwrap_err();
        match err {
            FfwatchError::ProcessFailed { kind, exit_code, stderr, .. } => {
                assert_eq!(kind, FailureKind::ExitCode);
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, "Unknown");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_convert_missing_input_never_starts_process() {
        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run().never();

        let job = ConversionJob::new("/no/such/input.mp4", "out.mp4", ConversionOptions::default());
        let err = processor(mock, Config::default()).convert(&job).await.unwrap_err();
        assert!(matches!(err, FfwatchError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_probe_accepts_no_output_exit_code() {
        let dir = TempDir::new().unwrap();
        let input = input_file(&dir);

        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run().returning(|spec, reducer| {
            assert!(spec.argument_string().starts_with("-hide_banner -i "));
            for line in PREAMBLE {
                reducer.consume_line(line).unwrap();
            }
            outcome(Some(1), "", "At least one output file must be specified")
        });

        let mut config = Config::default();
        config.supervisor.accepted_exit_codes = AcceptedExitCodes::new([0]);

        let media = processor(mock, config).probe(&input).await.unwrap();
        assert_eq!(media.path, input);
        assert_eq!(media.duration, Some(Duration::from_secs(10)));
        assert_eq!(
            media.video.and_then(|v| v.resolution()).as_deref(),
            Some("1280x720")
        );
    }

    #[tokio::test]
    async fn test_probe_without_stream_information_fails() {
        let dir = TempDir::new().unwrap();
        let input = input_file(&dir);

        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run()
            .returning(|_, _| outcome(Some(1), "", "input.mp4: Invalid data found when processing input"));

        let err = processor(mock, Config::default()).probe(&input).await.unwrap_err();
        assert!(matches!(err, FfwatchError::Parse(_)));
    }

    #[tokio::test]
    async fn test_version_info_first_line() {
        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run()
            .withf(|spec, _| spec.argument_string() == "-version")
            .returning(|_, _| outcome(Some(0), "ffmpeg version 7.0.1\nbuilt with gcc\n", ""));

        let processor = processor(mock, Config::default());
        assert_eq!(processor.get_version_info().await.unwrap(), "ffmpeg version 7.0.1");
        assert!(processor.check_availability().await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_binary() {
        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run().returning(|_, _| {
            RunOutcome::failed_to_start(
                FfwatchError::Launch {
                    program: "ffmpeg".into(),
                    source: std::io::Error::from_raw_os_error(2),
                },
                Duration::ZERO,
            )
        });

        let err = processor(mock, Config::default())
            .check_availability()
            .await
            .unwrap_err();
        assert!(matches!(err, FfwatchError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_command_returns_outcome() {
        let mut mock = MockProcessSupervisorTrait::new();
        mock.expect_run()
            .withf(|spec, _| spec.argument_string() == "-filters")
            .returning(|_, _| outcome(Some(0), "Filters:\n", ""));

        let processor = processor(mock, Config::default());
        let command = processor.command_builder().custom("List filters").arg("-filters");
        let outcome = processor.execute_command(command).await.unwrap();
        assert_eq!(outcome.stdout, "Filters:\n");
    }
}
