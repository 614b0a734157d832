/// Local child processes as monitored jobs.
///
/// The child is spawned in its own process group (via `process_group(0)`) so
/// an abort can signal the entire group, not just the direct child.
use crate::job::{AbortCause, AbortError, Abortable, Job, JobId};
use crate::node::Workspace;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::Notify;

const RUNNING: u8 = 0;
const COMPLETED: u8 = 1;
const ABORTED: u8 = 2;

/// Lifecycle of a process job: running, then completed or aborted, once.
#[derive(Debug)]
pub struct JobState {
    state: AtomicU8,
    abort_cause: Mutex<Option<String>>,
    abort_signalled: Notify,
}

impl JobState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            abort_cause: Mutex::new(None),
            abort_signalled: Notify::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    pub fn was_aborted(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ABORTED
    }

    /// Cause recorded by the abort that took effect, if any.
    pub fn abort_cause(&self) -> Option<String> {
        self.abort_cause
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolves once an abort signal has been delivered to the job.
    pub async fn abort_signalled(&self) {
        self.abort_signalled.notified().await
    }

    /// Mark the job completed. Returns false if it was already aborted.
    pub fn mark_completed(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn begin_abort(&self, cause: &AbortCause) -> bool {
        let won = self
            .state
            .compare_exchange(RUNNING, ABORTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            *self
                .abort_cause
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(cause.to_string());
        }
        won
    }

    fn undo_abort(&self) {
        if self
            .state
            .compare_exchange(ABORTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self
                .abort_cause
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        }
    }
}

/// Claims the abort, sends the signal, and gives the claim back if the
/// signal could not be delivered.
fn signal_abort(
    state: &JobState,
    cause: &AbortCause,
    target: String,
    send: impl FnOnce() -> nix::Result<()>,
) -> Result<bool, AbortError> {
    if !state.begin_abort(cause) {
        return Ok(false);
    }
    match send() {
        Ok(()) => {
            state.abort_signalled.notify_one();
            Ok(true)
        }
        // Already exited; whoever reaps it records completion.
        Err(Errno::ESRCH) => {
            state.undo_abort();
            Ok(false)
        }
        Err(e) => {
            state.undo_abort();
            Err(AbortError::Signal { target, source: e })
        }
    }
}

/// SIGTERM to the job's whole process group.
struct ProcessGroup {
    pgid: Pid,
    state: Arc<JobState>,
}

impl Abortable for ProcessGroup {
    fn request_abort(&self, cause: &AbortCause) -> Result<bool, AbortError> {
        signal_abort(&self.state, cause, format!("process group {}", self.pgid), || {
            killpg(self.pgid, Signal::SIGTERM)
        })
    }
}

/// SIGKILL to the direct child only.
struct ChildProcess {
    pid: Pid,
    state: Arc<JobState>,
}

impl Abortable for ChildProcess {
    fn request_abort(&self, cause: &AbortCause) -> Result<bool, AbortError> {
        signal_abort(&self.state, cause, format!("process {}", self.pid), || {
            kill(self.pid, Signal::SIGKILL)
        })
    }
}

/// A spawned command, adapted to [`Job`].
pub struct ProcessJob {
    id: JobId,
    command: String,
    pid: u32,
    log_file: PathBuf,
    workspace: Workspace,
    state: Arc<JobState>,
}

impl ProcessJob {
    pub fn new(
        id: JobId,
        command: impl Into<String>,
        pid: u32,
        log_file: impl Into<PathBuf>,
        workspace: Workspace,
    ) -> Self {
        Self {
            id,
            command: command.into(),
            pid,
            log_file: log_file.into(),
            workspace,
            state: Arc::new(JobState::new()),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// SIGKILL the whole process group. Used when the job outlives its abort.
    pub fn kill_group(&self) -> Result<(), AbortError> {
        match killpg(self.raw_pid(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(AbortError::Signal {
                target: format!("process group {}", self.pid),
                source: e,
            }),
        }
    }

    /// Record that the process exited on its own.
    pub fn finish(&self) -> bool {
        self.state.mark_completed()
    }

    fn raw_pid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}

impl Job for ProcessJob {
    fn id(&self) -> JobId {
        self.id.clone()
    }

    fn display_name(&self) -> String {
        format!("{} (pid {})", self.id, self.pid)
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn log_file(&self) -> Option<PathBuf> {
        Some(self.log_file.clone())
    }

    fn current_workspace(&self) -> Option<Workspace> {
        self.is_running().then(|| self.workspace.clone())
    }

    fn assigned_workspace(&self) -> Option<Workspace> {
        Some(self.workspace.clone())
    }

    fn executor(&self) -> Option<Arc<dyn Abortable>> {
        Some(Arc::new(ProcessGroup {
            pgid: self.raw_pid(),
            state: Arc::clone(&self.state),
        }))
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Abortable>> {
        Some(Arc::new(ChildProcess {
            pid: self.raw_pid(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// Errors that can occur while starting a process job.
#[derive(Debug)]
pub enum ProcessError {
    /// The working directory could not be used.
    Workspace {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the subprocess.
    Spawn { source: std::io::Error },
    /// The child exited before its pid could be read.
    NoPid,
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Workspace { path, source } => {
                write!(f, "failed to prepare workspace {}: {}", path.display(), source)
            }
            ProcessError::Spawn { source } => write!(f, "failed to spawn job process: {}", source),
            ProcessError::NoPid => write!(f, "job process exited before it could be tracked"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Workspace { source, .. } => Some(source),
            ProcessError::Spawn { source } => Some(source),
            ProcessError::NoPid => None,
        }
    }
}

/// Spawn `command` in `workspace` (created if missing), in a new process
/// group, with stdout and stderr piped.
pub fn spawn_command(
    command: &str,
    args: &[String],
    workspace: &Path,
) -> Result<(Child, u32), ProcessError> {
    std::fs::create_dir_all(workspace).map_err(|e| ProcessError::Workspace {
        path: workspace.to_path_buf(),
        source: e,
    })?;

    tracing::info!(
        command = %command,
        args = ?args,
        workspace = %workspace.display(),
        "spawning job"
    );

    let child = Command::new(command)
        .args(args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .spawn()
        .map_err(|e| ProcessError::Spawn { source: e })?;

    let pid = child.id().ok_or(ProcessError::NoPid)?;
    tracing::info!(pid, "job process started");
    Ok((child, pid))
}
