//! ffwatch - Supervised ffmpeg invocations with live progress
//!
//! Command line entry point: loads configuration, provisions the media processor,
//! and renders progress events as a progress bar or JSON lines.

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ffwatch::cli::{Args, Commands};
use ffwatch::config::{Config, DEFAULT_CONFIG_FILE};
use ffwatch::events::{EventEmitter, SubscriptionId, TranscodeEvent};
use ffwatch::media::MediaProcessorFactory;
use ffwatch::process::{LaunchSpec, ProcessSupervisor, ProcessSupervisorTrait, ProgressReducer};
use ffwatch::setup::SetupManager;
use ffwatch::workflow::Workflow;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    if let Commands::InitConfig { path } = &args.command {
        Config::default().save_to_file(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // Load configuration: --config, then ffwatch.toml, then defaults
    let mut config = Config::load(args.config.as_deref(), Path::new(DEFAULT_CONFIG_FILE))?;

    let setup_manager = SetupManager::new(&config.ffmpeg.work_dir)?;
    setup_logging(args.verbose, &setup_manager.log_dir())?;
    info!("Starting ffwatch");

    // Clean up after earlier runs and resolve the binary
    setup_manager.initialize(&mut config.ffmpeg).await?;

    let media = MediaProcessorFactory::create_tracked_processor(
        config.clone(),
        setup_manager.pid_tracker(),
    );

    // Execute command
    match args.command {
        Commands::Setup => {
            let version = media.get_version_info().await?;
            println!("Media processor: {}", config.ffmpeg.binary_path);
            println!("Version: {}", version);
        }
        Commands::Convert {
            input,
            output,
            timeout_ms,
            video_codec,
            audio_codec,
            profile,
        } => {
            info!("Converting media file: {}", input.display());

            let mut options = config.conversion.clone();
            if let Some(codec) = video_codec {
                options.video_codec = codec;
            }
            if let Some(codec) = audio_codec {
                options.audio_codec = codec;
            }
            if let Some(profile) = profile {
                options = options.with_profile(profile);
            }

            let display = ProgressDisplay::attach(media.events(), args.json)?;
            let workflow = Workflow::new(&config, media)
                .with_options(options)
                .with_timeout(timeout_ms.map(Duration::from_millis));
            let result = workflow.convert_file(&input, &output).await;
            display.finish();

            let report = result?;
            print_result(args.json, &report, || {
                format!(
                    "Converted {} -> {} in {:.1}s",
                    input.display(),
                    report.output.display(),
                    report.elapsed.as_secs_f64()
                )
            })?;
        }
        Commands::Probe { input } => {
            let info = media.probe(&input).await?;
            print_result(args.json, &info, || {
                let mut lines = vec![format!("File: {}", info.path.display())];
                if let Some(duration) = info.duration {
                    lines.push(format!("Duration: {}", format_duration(duration)));
                }
                if let Some(video) = &info.video {
                    lines.push(format!(
                        "Video: {} {} {}",
                        video.codec,
                        video.resolution().unwrap_or_default(),
                        video.fps.map(|fps| format!("{} fps", fps)).unwrap_or_default()
                    ));
                }
                if let Some(audio) = &info.audio {
                    lines.push(format!(
                        "Audio: {} {}",
                        audio.codec,
                        audio.sample_rate.map(|hz| format!("{} Hz", hz)).unwrap_or_default()
                    ));
                }
                lines.join("\n")
            })?;
        }
        Commands::Run {
            args: arguments,
            stdin,
            timeout_ms,
        } => {
            let mut spec = LaunchSpec::new(&config.ffmpeg.binary_path).arguments(arguments);
            if let Some(payload) = stdin {
                spec = spec.stdin_payload(payload);
            }
            if let Some(limit) = timeout_ms.or(config.supervisor.timeout_ms) {
                spec = spec.timeout_ms(limit);
            }

            let display = ProgressDisplay::attach(media.events(), args.json)?;
            let supervisor = ProcessSupervisor::new().with_pid_tracker(setup_manager.pid_tracker());
            let outcome = supervisor
                .run(spec, ProgressReducer::new(media.events()))
                .await;
            display.finish();

            let outcome = outcome.ensure_success(
                &config.supervisor.accepted_exit_codes,
                config.supervisor.stderr_excerpt_chars,
            )?;
            print!("{}", outcome.stdout);
            info!("Exit code: {:?}", outcome.exit_code);
        }
        Commands::Batch {
            input_dir,
            output_dir,
            format,
            timeout_ms,
        } => {
            info!("Converting directory: {}", input_dir.display());

            let display = ProgressDisplay::attach(media.events(), args.json)?;
            let workflow = Workflow::new(&config, media)
                .with_timeout(timeout_ms.map(Duration::from_millis));
            let result = workflow
                .convert_batch(&input_dir, output_dir.as_ref(), &format)
                .await;
            display.finish();

            let summary = result?;
            print_result(args.json, &summary, || {
                let mut lines = vec![format!(
                    "{} of {} files converted",
                    summary.converted.len(),
                    summary.total()
                )];
                for failure in &summary.failed {
                    lines.push(format!("  failed: {}: {}", failure.input.display(), failure.error));
                }
                lines.join("\n")
            })?;
            if !summary.is_success() {
                anyhow::bail!("{} file(s) failed to convert", summary.failed.len());
            }
        }
        Commands::InitConfig { .. } => {}
    }

    info!("ffwatch completed successfully");
    Ok(())
}

/// Renders transcode events on the terminal until finished
struct ProgressDisplay {
    emitter: Arc<EventEmitter>,
    subscription: SubscriptionId,
    bar: Option<ProgressBar>,
}

impl ProgressDisplay {
    fn attach(emitter: Arc<EventEmitter>, json: bool) -> Result<Self> {
        if json {
            let subscription = emitter.subscribe(Arc::new(
                |event: &TranscodeEvent| -> ffwatch::error::Result<()> {
                    println!("{}", serde_json::to_string(event)?);
                    Ok(())
                },
            ));
            return Ok(Self {
                emitter,
                subscription,
                bar: None,
            });
        }

        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}s {msg}")
                .map_err(|e| anyhow::anyhow!("Invalid progress template: {}", e))?
                .progress_chars("#>-"),
        );

        let handle = bar.clone();
        let subscription = emitter.subscribe(Arc::new(
            move |event: &TranscodeEvent| -> ffwatch::error::Result<()> {
                match event {
                    TranscodeEvent::Progress(snapshot) => {
                        if !snapshot.total_duration.is_zero() {
                            handle.set_length(snapshot.total_duration.as_secs());
                        }
                        handle.set_position(snapshot.elapsed.as_secs());
                        if let Some(speed) = snapshot.speed {
                            handle.set_message(format!("{:.2}x", speed));
                        }
                    }
                    TranscodeEvent::Completed(_) => {
                        if let Some(length) = handle.length() {
                            handle.set_position(length);
                        }
                        handle.set_message("done");
                    }
                }
                Ok(())
            },
        ));

        Ok(Self {
            emitter,
            subscription,
            bar: Some(bar),
        })
    }

    fn finish(self) {
        self.emitter.unsubscribe(self.subscription);
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Print `value` as JSON, or the human readable text from `text`
fn print_result<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool, log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(log_dir, "ffwatch.log");
    let (non_blocking_file, _guard) = non_blocking(file_appender);
    // Keep the guard alive for the duration of the program
    std::mem::forget(_guard);

    // Determine log level
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    // Console output goes to stderr so stdout stays clean for results
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(verbose)
        .with_file(verbose)
        .with_line_number(verbose);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false); // No ANSI colors in file

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        log_level,
        log_dir.join("ffwatch.log").display()
    );

    Ok(())
}

/// Format a duration as `HH:MM:SS.ss`
fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0).floor() as u64;
    let minutes = ((total % 3600.0) / 60.0).floor() as u64;
    let seconds = total % 60.0;
    format!("{:02}:{:02}:{:05.2}", hours, minutes, seconds)
}
