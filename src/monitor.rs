//! Per-job resource monitor.
//!
//! Runs alongside the job on the shared scheduler, periodically checking the
//! log file size and the workspace size. If either passes its limit, writes a
//! notice to the job's output, aborts the job, and retires itself.

use crate::abort;
use crate::config::ResourceLimits;
use crate::dirsize::DirectorySize;
use crate::job::{write_notice, AbortCause, Job, JobId, OutputSink};
use crate::node::{NodeError, Workspace};
use crate::registry::MonitorRegistry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the monitor should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep ticking.
    Continue,
    /// Stop ticking and leave the registry.
    Retire,
}

/// The recurring check for one job. Never reused once retired.
pub struct Monitor {
    job: Arc<dyn Job>,
    output: OutputSink,
    limits: ResourceLimits,
    registry: Arc<MonitorRegistry>,
    registration: u64,
    retired: AtomicBool,
}

impl Monitor {
    pub(crate) fn new(
        job: Arc<dyn Job>,
        output: OutputSink,
        limits: ResourceLimits,
        registry: Arc<MonitorRegistry>,
        registration: u64,
    ) -> Self {
        Self {
            job,
            output,
            limits,
            registry,
            registration,
            retired: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// One scheduled tick: run the checks, retire if they say so, and log
    /// failures without retiring.
    pub async fn run_tick(&self) {
        if self.is_retired() {
            return;
        }
        match self.check().await {
            Ok(TickOutcome::Continue) => {}
            Ok(TickOutcome::Retire) => self.retire(),
            Err(e) => {
                tracing::warn!(
                    job = %self.job.display_name(),
                    error = %e,
                    "resource check failed, will retry next interval"
                );
            }
        }
    }

    /// Run the checks once, in order: liveness, log size, workspace size.
    ///
    /// A log breach ends the tick before the workspace is looked at.
    pub async fn check(&self) -> Result<TickOutcome, MonitorError> {
        let name = self.job.display_name();
        if !self.job.is_running() {
            tracing::debug!(job = %name, "job no longer running, retiring monitor");
            return Ok(TickOutcome::Retire);
        }

        if let Some(limit) = self.limits.log_limit() {
            if let Some(size) = self.log_size()? {
                tracing::trace!(job = %name, size, limit, "log size");
                if size > limit {
                    return Ok(self.breach(AbortCause::LogSize { size, limit }));
                }
            }
        }

        if let Some(limit) = self.limits.workspace_limit() {
            let Some(workspace) = self.resolve_workspace() else {
                return Ok(TickOutcome::Continue);
            };
            if !workspace.exists().await? {
                tracing::debug!(
                    job = %name,
                    root = %workspace.root().display(),
                    "workspace does not exist yet"
                );
                return Ok(TickOutcome::Continue);
            }
            let size = workspace.act(DirectorySize::new(name.clone())).await?;
            tracing::trace!(
                job = %name,
                node = workspace.node_name(),
                size,
                limit,
                "workspace size"
            );
            if size > limit {
                return Ok(self.breach(AbortCause::WorkspaceSize { size, limit }));
            }
        }

        Ok(TickOutcome::Continue)
    }

    /// Leave the registry and stop ticking. Idempotent.
    pub fn retire(&self) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            self.registry
                .deregister(&self.job.id(), self.registration);
        }
    }

    fn log_size(&self) -> Result<Option<u64>, MonitorError> {
        let Some(path) = self.job.log_file() else {
            return Ok(None);
        };
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MonitorError::LogStat { path, source: e }),
        }
    }

    fn resolve_workspace(&self) -> Option<Workspace> {
        self.job
            .current_workspace()
            .or_else(|| self.job.assigned_workspace())
    }

    fn breach(&self, cause: AbortCause) -> TickOutcome {
        tracing::info!(job = %self.job.display_name(), %cause, "resource limit exceeded");
        write_notice(&self.output, &cause.notice());
        abort::kill(self.job.as_ref(), &cause);
        TickOutcome::Retire
    }
}

/// Errors from a single tick. None of them retire the monitor.
#[derive(Debug)]
pub enum MonitorError {
    LogStat {
        path: PathBuf,
        source: std::io::Error,
    },
    Workspace(NodeError),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::LogStat { path, source } => {
                write!(f, "failed to stat log file {}: {source}", path.display())
            }
            MonitorError::Workspace(e) => write!(f, "failed to measure workspace: {e}"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::LogStat { source, .. } => Some(source),
            MonitorError::Workspace(e) => Some(e),
        }
    }
}

impl From<NodeError> for MonitorError {
    fn from(e: NodeError) -> Self {
        MonitorError::Workspace(e)
    }
}
