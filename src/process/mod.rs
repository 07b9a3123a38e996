// Process supervision
//
// Starts a child process, drains both output streams concurrently, interprets the
// diagnostic stream line by line and races process exit against an optional timeout:
// - Collector: concurrent line-wise draining of stdout/stderr into append-only buffers
// - Reducer: folds pattern matches into running state and emits events
// - Racer: reduces exit, end-of-stream, timeout and internal failure into one verdict
// - Supervisor: owns the child lifecycle and assembles the RunOutcome

pub mod collector;
pub mod racer;
pub mod reducer;
pub mod supervisor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use collector::TextBuffer;
pub use reducer::ProgressReducer;
pub use supervisor::ProcessSupervisor;

use crate::error::{FailureKind, FfwatchError, Result};

/// Default number of stderr characters carried by a failure.
pub const STDERR_EXCERPT_CHARS: usize = 1000;

/// Everything needed to start one child process. Immutable once built.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: PathBuf,
    arguments: String,
    redirect_stdin: bool,
    redirect_stdout: bool,
    redirect_stderr: bool,
    stdin_payload: Option<String>,
    timeout: Option<Duration>,
}

impl LaunchSpec {
    /// stdout and stderr are redirected by default; stdin is not.
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            arguments: String::new(),
            redirect_stdin: false,
            redirect_stdout: true,
            redirect_stderr: true,
            stdin_payload: None,
            timeout: None,
        }
    }

    /// Already-serialised argument string.
    pub fn arguments<S: Into<String>>(mut self, arguments: S) -> Self {
        self.arguments = arguments.into();
        self
    }

    /// Text written to stdin after start. Implies stdin redirection.
    pub fn stdin_payload<S: Into<String>>(mut self, payload: S) -> Self {
        self.stdin_payload = Some(payload.into());
        self.redirect_stdin = true;
        self
    }

    pub fn redirect_stdin(mut self, redirect: bool) -> Self {
        self.redirect_stdin = redirect;
        self
    }

    pub fn redirect_stdout(mut self, redirect: bool) -> Self {
        self.redirect_stdout = redirect;
        self
    }

    pub fn redirect_stderr(mut self, redirect: bool) -> Self {
        self.redirect_stderr = redirect;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn argument_string(&self) -> &str {
        &self.arguments
    }

    pub fn stdin_redirected(&self) -> bool {
        self.redirect_stdin
    }

    pub fn stdout_redirected(&self) -> bool {
        self.redirect_stdout
    }

    pub fn stderr_redirected(&self) -> bool {
        self.redirect_stderr
    }

    pub fn stdin_text(&self) -> Option<&str> {
        self.stdin_payload.as_deref()
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.timeout
    }

    /// Split the argument string into argv entries.
    pub fn argv(&self) -> Result<Vec<String>> {
        split_arguments(&self.arguments)
    }
}

/// Shell-like splitting: whitespace separates, single quotes are literal,
/// double quotes allow `\"` and `\\`, a bare backslash escapes the next character.
pub fn split_arguments(input: &str) -> Result<Vec<String>> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote = Quote::None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                _ => current.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => current.push('\\'),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_token = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(FfwatchError::InvalidArguments(format!(
            "unterminated quote in '{}'",
            input
        )));
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Created,
    Started,
    Completed,
    TimedOut,
    FailedToStart,
    InternalFailure,
    Finalized,
}

impl InvocationState {
    pub fn can_transition(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Created, Started)
                | (Created, FailedToStart)
                | (Started, Completed)
                | (Started, TimedOut)
                | (Started, InternalFailure)
                | (Completed | TimedOut | FailedToStart | InternalFailure, Finalized)
        )
    }

    pub fn termination(self) -> Option<Termination> {
        match self {
            InvocationState::Completed => Some(Termination::Completed),
            InvocationState::TimedOut => Some(Termination::TimedOut),
            InvocationState::FailedToStart => Some(Termination::FailedToStart),
            InvocationState::InternalFailure => Some(Termination::InternalFailure),
            _ => None,
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the race of an invocation was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Termination {
    /// Exited and every redirected stream reached end-of-stream.
    Completed,
    TimedOut,
    FailedToStart,
    InternalFailure,
}

/// Exit codes treated as success. Defaults to `{0, 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AcceptedExitCodes(BTreeSet<i32>);

impl AcceptedExitCodes {
    pub fn new<I: IntoIterator<Item = i32>>(codes: I) -> Self {
        Self(codes.into_iter().collect())
    }

    pub fn contains(&self, code: i32) -> bool {
        self.0.contains(&code)
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.0.insert(code);
        self
    }
}

impl Default for AcceptedExitCodes {
    fn default() -> Self {
        Self::new([0, 1])
    }
}

/// Final record of one invocation. Exactly one is produced per run.
#[derive(Debug)]
pub struct RunOutcome {
    pub termination: Termination,
    /// `None` when the process was killed or never started cleanly.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub internal_failure: Option<FfwatchError>,
    /// Zero when the input duration never appeared in the output.
    pub total_duration: Duration,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

impl RunOutcome {
    /// Outcome of a process that could not be started.
    pub fn failed_to_start(error: FfwatchError, elapsed: Duration) -> Self {
        let exit_code = match &error {
            FfwatchError::Launch { source, .. } => Some(source.raw_os_error().unwrap_or(-1)),
            _ => None,
        };
        Self {
            termination: Termination::FailedToStart,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            internal_failure: Some(error),
            total_duration: Duration::ZERO,
            pid: None,
            elapsed,
        }
    }

    pub fn is_success(&self, accepted: &AcceptedExitCodes) -> bool {
        self.termination == Termination::Completed
            && self.internal_failure.is_none()
            && self.exit_code.is_some_and(|code| accepted.contains(code))
    }

    /// Map the outcome to success or the single fatal-error contract.
    pub fn ensure_success(self, accepted: &AcceptedExitCodes, excerpt_chars: usize) -> Result<Self> {
        if self.is_success(accepted) {
            return Ok(self);
        }

        let kind = match self.termination {
            Termination::FailedToStart => FailureKind::LaunchFailed,
            Termination::TimedOut => FailureKind::TimedOut,
            Termination::InternalFailure => FailureKind::InternalFailure,
            Termination::Completed if self.internal_failure.is_some() => FailureKind::InternalFailure,
            Termination::Completed => FailureKind::ExitCode,
        };

        Err(FfwatchError::ProcessFailed {
            kind,
            exit_code: self.exit_code,
            stderr: self.stderr.chars().take(excerpt_chars).collect(),
            cause: self.internal_failure.map(Box::new),
        })
    }
}

/// Seam between callers and the process supervisor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessSupervisorTrait: Send + Sync {
    /// Run one invocation to its terminal state. Never fails: every error is
    /// recorded in the returned outcome.
    async fn run(&self, spec: LaunchSpec, reducer: ProgressReducer) -> RunOutcome;
}

/// Bookkeeping of started children, so strays can be found after a crash.
#[async_trait]
pub trait PidRegistry: Send + Sync {
    async fn register(&self, pid: u32, program: &Path) -> Result<()>;
    async fn unregister(&self, pid: u32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(exit_code: Option<i32>, stderr: &str) -> RunOutcome {
        RunOutcome {
            termination: Termination::Completed,
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            internal_failure: None,
            total_duration: Duration::ZERO,
            pid: Some(42),
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_split_arguments() {
        let args = split_arguments(r#"-y -i "my input.mp4" -vf 'scale=1280:-2' out\ file.mp4"#).unwrap();
        assert_eq!(
            args,
            vec!["-y", "-i", "my input.mp4", "-vf", "scale=1280:-2", "out file.mp4"]
        );
    }

    #[test]
    fn test_split_arguments_keeps_empty_quoted() {
        assert_eq!(split_arguments(r#"-metadata title="""#).unwrap(), vec!["-metadata", "title="]);
        assert_eq!(split_arguments(r#"a "" b"#).unwrap(), vec!["a", "", "b"]);
        assert!(split_arguments("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_arguments_unterminated_quote() {
        assert!(matches!(
            split_arguments("-i 'broken"),
            Err(FfwatchError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_state_transitions() {
        use InvocationState::*;
        assert!(Created.can_transition(Started));
        assert!(Created.can_transition(FailedToStart));
        assert!(Started.can_transition(TimedOut));
        assert!(TimedOut.can_transition(Finalized));
        assert!(!Created.can_transition(Completed));
        assert!(!FailedToStart.can_transition(Started));
        assert!(!Finalized.can_transition(Created));
        assert_eq!(InternalFailure.termination(), Some(Termination::InternalFailure));
        assert_eq!(Started.termination(), None);
    }

    #[test]
    fn test_exit_code_one_is_accepted() {
        let accepted = AcceptedExitCodes::default();
        let outcome = completed(Some(1), "At least one output file must be specified")
            .ensure_success(&accepted, STDERR_EXCERPT_CHARS)
            .unwrap();
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[test]
    fn test_exit_code_two_truncates_stderr() {
        let stderr = "x".repeat(3000);
        let err = completed(Some(2), &stderr)
            .ensure_success(&AcceptedExitCodes::default(), STDERR_EXCERPT_CHARS)
            .unwrap_err();
        match err {
            FfwatchError::ProcessFailed {
                kind,
                exit_code,
                stderr,
                cause,
            } => {
                assert_eq!(kind, FailureKind::ExitCode);
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr.chars().count(), 1000);
                assert!(cause.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_custom_acceptance_set() {
        let strict = AcceptedExitCodes::new([0]);
        assert!(completed(Some(1), "").ensure_success(&strict, 10).is_err());
        assert!(completed(Some(0), "").ensure_success(&strict, 10).is_ok());
    }

    #[test]
    fn test_timeout_is_fatal_without_exit_code() {
        let mut outcome = completed(None, "partial");
        outcome.termination = Termination::TimedOut;
        let err = outcome
            .ensure_success(&AcceptedExitCodes::default(), STDERR_EXCERPT_CHARS)
            .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::TimedOut));
        assert_eq!(err.exit_code(), None);
    }

    #[test]
    fn test_internal_failure_is_fatal_even_with_accepted_code() {
        let mut outcome = completed(Some(0), "");
        outcome.internal_failure = Some(FfwatchError::Parse("bad".to_string()));
        let err = outcome
            .ensure_success(&AcceptedExitCodes::default(), STDERR_EXCERPT_CHARS)
            .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::InternalFailure));
    }

    #[test]
    fn test_failed_to_start_carries_os_error_code() {
        let error = FfwatchError::Launch {
            program: PathBuf::from("/missing/ffmpeg"),
            source: std::io::Error::from_raw_os_error(2),
        };
        let outcome = RunOutcome::failed_to_start(error, Duration::ZERO);
        assert_eq!(outcome.exit_code, Some(2));
        let err = outcome
            .ensure_success(&AcceptedExitCodes::default(), STDERR_EXCERPT_CHARS)
            .unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::LaunchFailed));
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("ffmpeg")
            .arguments("-version")
            .stdin_payload("q")
            .timeout_ms(50);
        assert!(spec.stdin_redirected());
        assert!(spec.stdout_redirected());
        assert_eq!(spec.stdin_text(), Some("q"));
        assert_eq!(spec.time_limit(), Some(Duration::from_millis(50)));
        assert_eq!(spec.argv().unwrap(), vec!["-version"]);
    }
}
