//! Reduces process exit, stream closure, timeout and internal failure into one verdict.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FfwatchError;

/// Which signal won the race.
#[derive(Debug)]
pub enum RaceVerdict {
    /// The process exited and every redirected stream reached end-of-stream.
    Clean(io::Result<ExitStatus>),
    TimedOut(Duration),
    Failed(FfwatchError),
}

/// Wait for `exit AND stdout closed AND stderr closed`, racing it against `timeout`
/// (counted from `spawned_at`) and the first internal failure reported on `failure`.
///
/// Streams passed as `None` are not redirected and count as closed. A dropped
/// `failure` sender only disables that branch. The caller is responsible for
/// terminating the child when the verdict is not `Clean`.
pub async fn race(
    child: &mut Child,
    stdout: Option<&mut JoinHandle<()>>,
    stderr: Option<&mut JoinHandle<()>>,
    failure: oneshot::Receiver<FfwatchError>,
    timeout: Option<Duration>,
    spawned_at: Instant,
) -> RaceVerdict {
    let clean = async {
        let (status, (), ()) = tokio::join!(child.wait(), drained(stdout), drained(stderr));
        status
    };
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep_until(spawned_at + limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;

        Ok(error) = failure => RaceVerdict::Failed(error),
        status = clean => RaceVerdict::Clean(status),
        () = deadline => RaceVerdict::TimedOut(timeout.unwrap_or_default()),
    }
}

async fn drained(task: Option<&mut JoinHandle<()>>) {
    let Some(task) = task else {
        return;
    };
    match task.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("Stream reader cancelled"),
        Err(e) => warn!(error = %e, "Stream reader panicked"),
    }
}
