//! Run one command as a monitored job, from spawn to report.

use crate::dirsize::DirectorySize;
use crate::job::{Job, JobId, OutputSink};
use crate::node::Workspace;
use crate::process::{self, ProcessError, ProcessJob};
use crate::registry::LifecycleController;
use crate::report::{RunOutcome, RunReport};
use crate::sentinel::LogFilter;
use chrono::Utc;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// How long to wait for output pumps after the child exits. A grandchild
/// that inherited the pipes can otherwise keep them open indefinitely.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period used when a request does not name one.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;
type Pump = JoinHandle<std::io::Result<u64>>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Defaults to `<command>-<pid>`.
    pub job_id: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub log_file: PathBuf,
    pub workspace: PathBuf,
    pub report_file: Option<PathBuf>,
    /// Per-invocation output limit, on top of the global one.
    pub output_limit: Option<LogFilter>,
    /// How long an aborted job may keep running after SIGTERM before its
    /// process group is killed outright.
    pub kill_grace: Duration,
}

/// Errors that stop a run before the job could be monitored.
#[derive(Debug)]
pub enum RunError {
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Process(ProcessError),
    Wait {
        source: std::io::Error,
    },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::LogFile { path, source } => {
                write!(f, "failed to create log file {}: {}", path.display(), source)
            }
            RunError::Process(e) => write!(f, "{e}"),
            RunError::Wait { source } => write!(f, "failed to wait for job process: {}", source),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::LogFile { source, .. } => Some(source),
            RunError::Process(e) => Some(e),
            RunError::Wait { source } => Some(source),
        }
    }
}

impl From<ProcessError> for RunError {
    fn from(e: ProcessError) -> Self {
        RunError::Process(e)
    }
}

/// Spawn the command, monitor it until it ends, and produce its report.
///
/// The lifecycle callbacks fire in host order: started once the process
/// exists, completed once it has exited, finalized once its output is flushed.
pub async fn run_job(
    controller: &LifecycleController,
    request: &RunRequest,
) -> Result<RunReport, RunError> {
    let log_error = |e| RunError::LogFile {
        path: request.log_file.clone(),
        source: e,
    };
    let log = File::create(&request.log_file).map_err(log_error)?;
    let notices = log.try_clone().map_err(log_error)?;

    let started_at = Utc::now();
    let (mut child, pid) =
        process::spawn_command(&request.command, &request.args, &request.workspace)?;

    let id = request
        .job_id
        .clone()
        .unwrap_or_else(|| format!("{}-{pid}", request.command));
    let process_job = Arc::new(ProcessJob::new(
        JobId::new(id),
        request.command.clone(),
        pid,
        &request.log_file,
        Workspace::local(&request.workspace),
    ));
    let job: Arc<dyn Job> = process_job.clone();

    let settings = controller.settings();
    let scheduler = controller.scheduler();
    let mut writer = LogFilter::global().decorate(log, &job, settings, scheduler);
    if let Some(filter) = request.output_limit {
        writer = filter.decorate(writer, &job, settings, scheduler);
    }
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let notices: OutputSink = Arc::new(Mutex::new(notices));

    controller.on_job_started(Arc::clone(&job), notices);

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, Arc::clone(&writer))));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, Arc::clone(&writer))));
    }

    let status = match wait_enforced(&mut child, &process_job, request.kill_grace).await {
        Ok(status) => status,
        Err(e) => {
            release(controller, &process_job, pumps);
            return Err(RunError::Wait { source: e });
        }
    };
    process_job.finish();
    controller.on_job_completed(job.as_ref());

    for handle in pumps {
        match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, handle).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "output pump failed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "output pump task failed"),
            Err(_) => tracing::warn!("output pump still open after job exit, giving up"),
        }
    }
    if let Err(e) = writer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .flush()
    {
        tracing::warn!(error = %e, "failed to flush job log");
    }
    controller.on_job_finalized(job.as_ref());

    let log_bytes = std::fs::metadata(&request.log_file)
        .map(|m| m.len())
        .unwrap_or(0);
    let workspace_bytes = match Workspace::local(&request.workspace)
        .act(DirectorySize::new(job.display_name()))
        .await
    {
        Ok(size) => Some(size),
        Err(e) => {
            tracing::warn!(error = %e, "failed to measure final workspace size");
            None
        }
    };

    let state = process_job.state();
    let outcome = if state.was_aborted() {
        RunOutcome::Aborted
    } else if status.success() {
        RunOutcome::Completed
    } else {
        RunOutcome::Failed
    };

    let report = RunReport {
        job_id: job.id().to_string(),
        command: request.command.clone(),
        pid,
        started_at,
        finished_at: Utc::now(),
        outcome,
        exit_code: status.code(),
        log_bytes,
        workspace_bytes,
        abort_cause: state.abort_cause(),
    };
    tracing::info!(
        job = %report.job_id,
        outcome = ?report.outcome,
        exit_code = ?report.exit_code,
        log_bytes,
        duration_secs = report.duration().num_seconds(),
        "job finished"
    );

    if let Some(path) = &request.report_file {
        if let Err(e) = report.write(path) {
            tracing::warn!(error = %e, "failed to write run report");
        }
    }

    Ok(report)
}

/// Wait for the child. Once an abort has been delivered, the child gets
/// `grace` to exit before its whole process group is SIGKILLed.
async fn wait_enforced(
    child: &mut Child,
    job: &ProcessJob,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = job.state().abort_signalled() => None,
    };
    if let Some(status) = exited {
        return status;
    }

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }
    tracing::warn!(
        job = %job.display_name(),
        grace_secs = grace.as_secs_f64(),
        "job ignored abort, killing process group"
    );
    if let Err(e) = job.kill_group() {
        tracing::warn!(job = %job.display_name(), error = %e, "failed to kill process group");
        let _ = child.start_kill();
    }
    child.wait().await
}

/// Tear down a job whose process can no longer be waited on: stop its
/// monitor, stop copying its output, and kill whatever is left of it.
fn release(controller: &LifecycleController, job: &ProcessJob, pumps: Vec<Pump>) {
    if let Err(e) = job.kill_group() {
        tracing::warn!(job = %job.display_name(), error = %e, "failed to kill process group");
    }
    job.finish();
    controller.on_job_completed(job);
    for handle in pumps {
        handle.abort();
    }
    controller.on_job_finalized(job);
}

/// Copy a child pipe into the shared log writer until EOF.
///
/// Writes go through the blocking pool so a slow disk never stalls the
/// workers that drive monitor ticks.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, writer: SharedWriter) -> std::io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        let chunk = buf[..n].to_vec();
        let writer = Arc::clone(&writer);
        tokio::task::spawn_blocking(move || {
            writer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .write_all(&chunk)
        })
        .await
        .map_err(std::io::Error::other)??;
        total += n as u64;
    }
}
