//! Child process lifecycle: start, stream wiring, race, termination, result assembly.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, trace, warn};
use uuid::Uuid;

use super::collector::{StreamKind, TextBuffer, collect_lines};
use super::racer::{RaceVerdict, race};
use super::{
    InvocationState, LaunchSpec, PidRegistry, ProcessSupervisorTrait, ProgressReducer, RunOutcome,
    Termination,
};
use crate::error::{FfwatchError, Result};
use crate::setup::PidTracker;

/// How long a finished invocation waits for its pid record to be cleared.
const PID_RECORD_GRACE: Duration = Duration::from_millis(250);

/// Default supervisor. Holds no per-invocation state, so one instance can run any
/// number of invocations concurrently.
#[derive(Clone, Default)]
pub struct ProcessSupervisor {
    pid_registry: Option<Arc<dyn PidRegistry>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pid of every started child until its invocation is finalised.
    pub fn with_pid_tracker(self, tracker: PidTracker) -> Self {
        self.with_pid_registry(Arc::new(tracker))
    }

    pub fn with_pid_registry(mut self, registry: Arc<dyn PidRegistry>) -> Self {
        self.pid_registry = Some(registry);
        self
    }

    async fn supervise(&self, spec: LaunchSpec, reducer: ProgressReducer) -> RunOutcome {
        let started = Instant::now();
        let mut state = InvocationState::Created;

        let mut child = match build_command(&spec).and_then(|mut command| {
            command.spawn().map_err(|source| FfwatchError::Launch {
                program: spec.program().to_path_buf(),
                source,
            })
        }) {
            Ok(child) => child,
            Err(error) => {
                warn!(error = %error, "Process failed to start");
                advance(&mut state, InvocationState::FailedToStart);
                advance(&mut state, InvocationState::Finalized);
                return RunOutcome::failed_to_start(error, started.elapsed());
            }
        };
        let spawned_at = tokio::time::Instant::now();
        advance(&mut state, InvocationState::Started);

        let pid = child.id();
        info!(pid = ?pid, args = %spec.argument_string(), "Process started");

        let reducer = Arc::new(reducer);
        let stdout_text = Arc::new(TextBuffer::new());
        let stderr_text = Arc::new(TextBuffer::new());
        let (failure_tx, failure_rx) = oneshot::channel();

        let stdin_task = child.stdin.take().map(|stdin| {
            let payload = spec.stdin_text().map(str::to_owned);
            tokio::spawn(write_stdin(stdin, payload).in_current_span())
        });

        let mut stdout_task = child.stdout.take().map(|stdout| {
            let buffer = Arc::clone(&stdout_text);
            tokio::spawn(
                async move {
                    if let Err(e) = collect_lines(stdout, buffer, StreamKind::Stdout, |_| Ok(())).await {
                        warn!(error = %e, "stdout collection failed");
                    }
                }
                .in_current_span(),
            )
        });

        let mut stderr_task = child.stderr.take().map(|stderr| {
            let buffer = Arc::clone(&stderr_text);
            let reducer = Arc::clone(&reducer);
            tokio::spawn(
                async move {
                    let result = collect_lines(stderr, buffer, StreamKind::Stderr, |line| {
                        reducer.consume_line(line)
                    })
                    .await;
                    if let Err(error) = result {
                        warn!(error = %error, "Diagnostic output could not be interpreted");
                        let _ = failure_tx.send(error);
                    }
                }
                .in_current_span(),
            )
        });

        // Pid bookkeeping runs beside the readers and never gates the deadline.
        let (finished_tx, finished_rx) = oneshot::channel();
        let pid_task = match (&self.pid_registry, pid) {
            (Some(registry), Some(pid)) => Some(tokio::spawn(
                track_pid(
                    Arc::clone(registry),
                    pid,
                    spec.program().to_path_buf(),
                    finished_rx,
                )
                .in_current_span(),
            )),
            _ => None,
        };

        let verdict = race(
            &mut child,
            stdout_task.as_mut(),
            stderr_task.as_mut(),
            failure_rx,
            spec.time_limit(),
            spawned_at,
        )
        .await;

        let (termination, exit_code, internal_failure) = match verdict {
            RaceVerdict::Clean(Ok(status)) => (Termination::Completed, status.code(), None),
            RaceVerdict::Clean(Err(e)) => {
                warn!(error = %e, "Waiting for the process failed");
                terminate(&mut child).await;
                (Termination::InternalFailure, None, Some(FfwatchError::Io(e)))
            }
            RaceVerdict::TimedOut(limit) => {
                warn!(limit_ms = limit.as_millis() as u64, "Time limit exceeded, killing process");
                terminate(&mut child).await;
                (Termination::TimedOut, None, None)
            }
            RaceVerdict::Failed(error) => {
                terminate(&mut child).await;
                (Termination::InternalFailure, None, Some(error))
            }
        };
        advance(&mut state, termination.into());

        // Readers of a killed process may still be waiting on a pipe held open by a grandchild.
        for task in [stdin_task, stdout_task, stderr_task].into_iter().flatten() {
            task.abort();
        }

        let _ = finished_tx.send(());
        if let Some(task) = pid_task {
            if tokio::time::timeout(PID_RECORD_GRACE, task).await.is_err() {
                warn!(pid = ?pid, "Pid record still pending, leaving it to finish in the background");
            }
        }

        let outcome = RunOutcome {
            termination,
            exit_code,
            stdout: stdout_text.snapshot(),
            stderr: stderr_text.snapshot(),
            internal_failure,
            total_duration: reducer.total_duration(),
            pid,
            elapsed: started.elapsed(),
        };
        advance(&mut state, InvocationState::Finalized);

        info!(
            termination = ?outcome.termination,
            exit_code = ?outcome.exit_code,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Process finished"
        );
        outcome
    }
}

#[async_trait]
impl ProcessSupervisorTrait for ProcessSupervisor {
    async fn run(&self, spec: LaunchSpec, reducer: ProgressReducer) -> RunOutcome {
        let span = info_span!(
            "invocation",
            id = %Uuid::new_v4(),
            program = %spec.program().display()
        );
        self.supervise(spec, reducer).instrument(span).await
    }
}

impl From<Termination> for InvocationState {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Completed => InvocationState::Completed,
            Termination::TimedOut => InvocationState::TimedOut,
            Termination::FailedToStart => InvocationState::FailedToStart,
            Termination::InternalFailure => InvocationState::InternalFailure,
        }
    }
}

fn advance(state: &mut InvocationState, next: InvocationState) {
    debug_assert!(state.can_transition(next), "invalid transition {state} -> {next}");
    trace!(from = %state, to = %next, "Invocation state");
    *state = next;
}

fn build_command(spec: &LaunchSpec) -> Result<Command> {
    let mut command = Command::new(spec.program());

    #[cfg(windows)]
    {
        command.raw_arg(spec.argument_string());
        command.creation_flags(0x08000000); // CREATE_NO_WINDOW
    }
    #[cfg(not(windows))]
    command.args(spec.argv()?);

    command
        .stdin(if spec.stdin_redirected() { Stdio::piped() } else { Stdio::null() })
        .stdout(if spec.stdout_redirected() { Stdio::piped() } else { Stdio::inherit() })
        .stderr(if spec.stderr_redirected() { Stdio::piped() } else { Stdio::inherit() })
        .kill_on_drop(true);
    Ok(command)
}

/// Record `pid` until the invocation reports it finished, then remove the record.
async fn track_pid(
    registry: Arc<dyn PidRegistry>,
    pid: u32,
    program: PathBuf,
    finished: oneshot::Receiver<()>,
) {
    if let Err(e) = registry.register(pid, &program).await {
        warn!(pid, error = %e, "Failed to record pid");
    }
    let _ = finished.await;
    if let Err(e) = registry.unregister(pid).await {
        warn!(pid, error = %e, "Failed to remove pid record");
    }
}

/// Write the payload, then close stdin by dropping it.
async fn write_stdin(mut stdin: ChildStdin, payload: Option<String>) {
    let Some(payload) = payload else {
        return;
    };
    if let Err(e) = stdin.write_all(payload.as_bytes()).await {
        debug!(error = %e, "stdin closed before payload was written");
        return;
    }
    if let Err(e) = stdin.flush().await {
        debug!(error = %e, "stdin flush failed");
    }
}

/// Best-effort kill; a process that already exited is not an error.
async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill failed, process already gone");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::events::{EventEmitter, TranscodeEvent};
    use crate::process::{AcceptedExitCodes, STDERR_EXCERPT_CHARS};
    use std::time::Duration;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh")
            .arguments(format!("-c '{}'", script))
            .timeout(Duration::from_secs(30))
    }

    async fn run(spec: LaunchSpec) -> RunOutcome {
        ProcessSupervisor::new()
            .run(spec, ProgressReducer::detached())
            .await
    }

    #[tokio::test]
    async fn test_captures_both_streams_without_deadlock() {
        let padding = "x".repeat(200);
        let script = format!(
            "i=0; while [ $i -lt 2000 ]; do echo \"out $i\"; echo \"err $i {padding}\" >&2; i=$((i+1)); done"
        );

        let outcome = run(sh(&script)).await;

        let expected_stdout: String = (0..2000).map(|i| format!("out {i}\n")).collect();
        let expected_stderr: String = (0..2000).map(|i| format!("err {i} {padding}\n")).collect();
        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, expected_stdout);
        assert_eq!(outcome.stderr, expected_stderr);
        assert!(outcome.internal_failure.is_none());
    }

    #[tokio::test]
    async fn test_progress_events_from_diagnostic_stream() {
        let script = [
            "echo \"Input #0, mov,mp4,m4a,3gp,3g2,mj2, from input.mp4:\" >&2",
            "echo \"  Duration: 00:01:30.00, start: 0.000000, bitrate: 1205 kb/s\" >&2",
            "printf \"frame=25 fps=25 size=100kB time=00:00:01.00 bitrate=800.0kbits/s speed=1.0x\\r\" >&2",
            "printf \"frame=50 fps=25 size=200kB time=00:00:02.00 bitrate=800.0kbits/s speed=1.0x\\r\" >&2",
            "printf \"frame=75 fps=25 size=300kB time=00:00:03.00 bitrate=800.0kbits/s speed=1.0x\\n\" >&2",
            "echo \"video:300kB audio:20kB subtitle:0kB other streams:0kB global headers:0kB muxing overhead: 0.1%\" >&2",
        ]
        .join("; ");

        let emitter = Arc::new(EventEmitter::new());
        let (_, mut receiver) = emitter.channel();
        let outcome = ProcessSupervisor::new()
            .run(sh(&script), ProgressReducer::new(emitter))
            .await;

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.total_duration, Duration::from_secs(90));

        let mut elapsed = Vec::new();
        let mut completions = 0;
        while let Ok(event) = receiver.try_recv() {
            assert_eq!(event.total_duration(), Duration::from_secs(90));
            match event {
                TranscodeEvent::Progress(snapshot) => elapsed.push(snapshot.elapsed.as_secs()),
                TranscodeEvent::Completed(_) => completions += 1,
            }
        }
        assert_eq!(elapsed, vec![1, 2, 3]);
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let spec = LaunchSpec::new("sleep").arguments("30").timeout_ms(50);
        let started = Instant::now();

        let outcome = run(spec).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.pid.is_some());
        #[cfg(target_os = "linux")]
        {
            let pid = outcome.pid.unwrap_or_default();
            assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        }

        let err = outcome
            .ensure_success(&AcceptedExitCodes::default(), STDERR_EXCERPT_CHARS)
            .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::TimedOut));
    }

    #[tokio::test]
    async fn test_timeout_with_grandchild_holding_pipes() {
        let spec = sh("sleep 3 & exec sleep 30").timeout_ms(50);
        let started = Instant::now();

        let outcome = run(spec).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.exit_code, None);
    }

    /// Registry whose writes never complete, like a record on a hung filesystem.
    #[derive(Default)]
    struct StalledRegistry {
        registered: parking_lot::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PidRegistry for StalledRegistry {
        async fn register(&self, pid: u32, _program: &std::path::Path) -> Result<()> {
            self.registered.lock().push(pid);
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn unregister(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_pid_record_does_not_delay_timeout() {
        let registry = Arc::new(StalledRegistry::default());
        let supervisor = ProcessSupervisor::new().with_pid_registry(registry.clone());
        let spec = LaunchSpec::new("sleep").arguments("30").timeout_ms(50);
        let started = Instant::now();

        let outcome = supervisor.run(spec, ProgressReducer::detached()).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(registry.registered.lock().clone(), vec![outcome.pid.unwrap_or_default()]);
    }

    #[tokio::test]
    async fn test_stalled_pid_record_does_not_block_output() {
        let registry = Arc::new(StalledRegistry::default());
        let supervisor = ProcessSupervisor::new().with_pid_registry(registry);
        let padding = "y".repeat(50_000);

        let outcome = supervisor
            .run(sh(&format!("echo {padding}; echo {padding} >&2")), ProgressReducer::detached())
            .await;

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.stdout.len(), 50_001);
        assert_eq!(outcome.stderr.len(), 50_001);
    }

    #[tokio::test]
    async fn test_exit_code_one_is_success() {
        let outcome = run(sh("echo \"nothing to do\" >&2; exit 1")).await;
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.is_success(&AcceptedExitCodes::default()));
    }

    #[tokio::test]
    async fn test_exit_code_two_is_fatal_with_truncated_stderr() {
        let outcome = run(sh(
            "i=0; while [ $i -lt 300 ]; do printf 0123456789 >&2; i=$((i+1)); done; exit 2",
        ))
        .await;
        assert_eq!(outcome.stderr.len(), 3000);

        let err = outcome
            .ensure_success(&AcceptedExitCodes::default(), STDERR_EXCERPT_CHARS)
            .unwrap_err();
        match err {
            FfwatchError::ProcessFailed {
                kind,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(kind, FailureKind::ExitCode);
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr.chars().count(), 1000);
                assert!(stderr.starts_with("0123456789"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_launch_failure_short_circuits() {
        let outcome = run(LaunchSpec::new("/nonexistent/ffwatch-missing-binary")).await;
        assert_eq!(outcome.termination, Termination::FailedToStart);
        assert!(outcome.exit_code.is_some());
        assert!(outcome.pid.is_none());
        assert!(matches!(outcome.internal_failure, Some(FfwatchError::Launch { .. })));
    }

    #[tokio::test]
    async fn test_invalid_argument_string_fails_to_start() {
        let outcome = run(LaunchSpec::new("sh").arguments("-c 'unterminated")).await;
        assert_eq!(outcome.termination, Termination::FailedToStart);
        assert_eq!(outcome.exit_code, None);
        assert!(matches!(
            outcome.internal_failure,
            Some(FfwatchError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_internal_failure_stops_waiting() {
        let emitter = Arc::new(EventEmitter::new());
        emitter.subscribe(Arc::new(|_: &TranscodeEvent| -> Result<()> {
            Err(FfwatchError::Subscriber("consumer gone".to_string()))
        }));
        let spec = sh(
            "printf \"frame=1 size=1kB time=00:00:01.00 bitrate=N/A speed=N/A\\n\" >&2; exec sleep 30",
        );
        let started = Instant::now();

        let outcome = ProcessSupervisor::new()
            .run(spec, ProgressReducer::new(emitter))
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.termination, Termination::InternalFailure);
        assert_eq!(outcome.exit_code, None);
        assert!(matches!(
            outcome.internal_failure,
            Some(FfwatchError::Subscriber(_))
        ));
    }

    #[tokio::test]
    async fn test_stdin_payload_is_delivered() {
        let spec = LaunchSpec::new("cat")
            .stdin_payload("hello\nworld\n")
            .timeout(Duration::from_secs(10));
        let outcome = run(spec).await;
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "hello\nworld\n");
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_independent() {
        let supervisor = ProcessSupervisor::new();
        let (first, second) = tokio::join!(
            supervisor.run(sh("echo first; exit 0"), ProgressReducer::detached()),
            supervisor.run(sh("echo second; exit 1"), ProgressReducer::detached()),
        );
        assert_eq!(first.stdout, "first\n");
        assert_eq!(first.exit_code, Some(0));
        assert_eq!(second.stdout, "second\n");
        assert_eq!(second.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_pid_is_tracked_only_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = PidTracker::new(dir.path());
        let supervisor = ProcessSupervisor::new().with_pid_tracker(tracker.clone());

        let outcome = supervisor
            .run(sh("exit 0"), ProgressReducer::detached())
            .await;

        assert!(outcome.pid.is_some());
        assert!(tracker.recorded().await.unwrap().is_empty());
    }
}
