//! What the monitoring core needs from a job.
//!
//! The host owns how jobs are represented and run; it adapts each kind of job
//! to [`Job`] and each way of stopping one to [`Abortable`].

use crate::node::Workspace;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Stable identity of a job, usable as a map key for the job's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Append-only channel into a job's own output.
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// Write a message to the job's output, ignoring failures.
pub fn write_notice(sink: &Mutex<dyn Write + Send>, text: &str) {
    let mut out = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
        tracing::debug!(error = %e, "failed to write notice to job output");
    }
}

/// Why a job is being aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
    /// The log file on disk grew past its limit.
    LogSize { size: u64, limit: u64 },
    /// The workspace tree grew past its limit.
    WorkspaceSize { size: u64, limit: u64 },
    /// Output written through a sentinel passed its limit.
    OutputLimit { limit: u64 },
}

impl AbortCause {
    /// The message shown in the job's own output before it is aborted.
    pub fn notice(&self) -> String {
        match self {
            AbortCause::LogSize { limit, .. } | AbortCause::OutputLimit { limit } => {
                format!("\n[sizeguard] Job log exceeded limit of {limit} bytes. Aborting job.\n")
            }
            AbortCause::WorkspaceSize { size, limit } => format!(
                "[sizeguard] Workspace size {size} bytes exceeded limit {limit}. Aborting job.\n"
            ),
        }
    }
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortCause::LogSize { size, limit } => {
                write!(f, "log size {size} bytes exceeded limit of {limit} bytes")
            }
            AbortCause::WorkspaceSize { size, limit } => {
                write!(f, "workspace size {size} bytes exceeded limit of {limit} bytes")
            }
            AbortCause::OutputLimit { limit } => {
                write!(f, "output exceeded limit of {limit} bytes")
            }
        }
    }
}

/// Something that can be asked to stop a job.
pub trait Abortable: Send + Sync {
    /// Request interruption with an aborted terminal status.
    ///
    /// Returns `Ok(true)` if this call moved the job to aborted and
    /// `Ok(false)` if the job had already finished or been aborted.
    fn request_abort(&self, cause: &AbortCause) -> Result<bool, AbortError>;
}

/// A running unit of work whose resource usage is bounded.
pub trait Job: Send + Sync {
    fn id(&self) -> JobId;

    /// Name used in log lines.
    fn display_name(&self) -> String {
        self.id().to_string()
    }

    fn is_running(&self) -> bool;

    /// Local path of the job's log file, if it has one.
    fn log_file(&self) -> Option<PathBuf>;

    /// Workspace of the live execution context, if one is attached right now.
    fn current_workspace(&self) -> Option<Workspace>;

    /// Workspace statically associated with the job, used when no live
    /// execution context is available.
    fn assigned_workspace(&self) -> Option<Workspace> {
        None
    }

    /// The most specific interruption mechanism for the current execution.
    fn executor(&self) -> Option<Arc<dyn Abortable>>;

    /// A generic interruption signal, tried when there is no executor.
    fn interrupt_handle(&self) -> Option<Arc<dyn Abortable>> {
        None
    }
}

/// Errors raised by an interruption mechanism.
#[derive(Debug)]
pub enum AbortError {
    Signal { target: String, source: nix::Error },
    Unsupported(String),
}

impl std::fmt::Display for AbortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortError::Signal { target, source } => {
                write!(f, "failed to signal {target}: {source}")
            }
            AbortError::Unsupported(msg) => write!(f, "abort not supported: {msg}"),
        }
    }
}

impl std::error::Error for AbortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AbortError::Signal { source, .. } => Some(source),
            AbortError::Unsupported(_) => None,
        }
    }
}
