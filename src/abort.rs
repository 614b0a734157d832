//! The one path that actually stops a job.

use crate::job::{AbortCause, Job};

/// What a call to [`kill`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// This call moved the job to aborted.
    Aborted,
    /// The job had already finished or been aborted; nothing happened.
    AlreadyFinished,
    /// No interruption mechanism was reachable.
    Unreachable,
    /// Every reachable mechanism failed.
    Failed,
}

/// Abort `job` with `cause`.
///
/// Tries the job's executor first and falls back to its generic interrupt
/// handle when there is no executor or the executor refuses. Never panics or
/// returns an error: failures are logged and reported in the outcome.
pub fn kill(job: &dyn Job, cause: &AbortCause) -> KillOutcome {
    let name = job.display_name();
    if !job.is_running() {
        tracing::debug!(job = %name, %cause, "job already finished, skipping abort");
        return KillOutcome::AlreadyFinished;
    }

    let mechanisms = [("executor", job.executor()), ("interrupt", job.interrupt_handle())];
    let mut attempted = false;
    for (via, mechanism) in mechanisms {
        let Some(mechanism) = mechanism else {
            continue;
        };
        attempted = true;
        match mechanism.request_abort(cause) {
            Ok(true) => {
                tracing::info!(job = %name, via, %cause, "aborted job");
                return KillOutcome::Aborted;
            }
            Ok(false) => {
                tracing::debug!(job = %name, via, "job stopped before abort took effect");
                return KillOutcome::AlreadyFinished;
            }
            Err(e) => {
                tracing::warn!(job = %name, via, error = %e, "failed to interrupt job");
            }
        }
    }

    if attempted {
        KillOutcome::Failed
    } else {
        tracing::warn!(job = %name, %cause, "no interruption handle reachable, cannot abort job");
        KillOutcome::Unreachable
    }
}
