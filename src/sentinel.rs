//! Inline output limit: counts bytes as the job writes them.

use crate::abort;
use crate::config::Settings;
use crate::job::{AbortCause, Job};
use crate::scheduler::Scheduler;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

/// Pause between a breach and the abort, so output already written can drain.
pub const ABORT_DRAIN_DELAY: Duration = Duration::from_millis(250);

/// A writer that forwards everything to `inner` and aborts the job once the
/// running total passes `limit`.
///
/// Bytes are forwarded first and counted second, and forwarding never stops,
/// even after the limit trips. The first write that pushes the total strictly
/// above the limit writes a notice to `inner` and schedules one abort on the
/// scheduler after [`ABORT_DRAIN_DELAY`]. Later writes skip the check.
///
/// Counting relies on `&mut self`; concurrent writers share one instance
/// behind a mutex, which serialises count and check per instance.
pub struct SizeLimitWriter<W: Write> {
    inner: W,
    limit: u64,
    written: u64,
    killed: bool,
    job: Arc<dyn Job>,
    scheduler: Scheduler,
}

impl<W: Write> SizeLimitWriter<W> {
    /// Wrap `inner`. Callers skip the wrapper entirely for a zero limit; see
    /// [`LogFilter::decorate`].
    pub fn new(inner: W, limit: u64, job: Arc<dyn Job>, scheduler: Scheduler) -> Self {
        Self {
            inner,
            limit,
            written: 0,
            killed: false,
            job,
            scheduler,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn record(&mut self, n: usize) {
        self.written = self.written.saturating_add(n as u64);
        if !self.killed && self.written > self.limit {
            self.trip();
        }
    }

    fn trip(&mut self) {
        self.killed = true;
        let cause = AbortCause::OutputLimit { limit: self.limit };
        tracing::info!(
            job = %self.job.display_name(),
            written = self.written,
            limit = self.limit,
            "output limit exceeded"
        );
        if let Err(e) = self
            .inner
            .write_all(cause.notice().as_bytes())
            .and_then(|_| self.inner.flush())
        {
            tracing::debug!(error = %e, "failed to write limit notice");
        }
        let job = Arc::clone(&self.job);
        self.scheduler.schedule_once(ABORT_DRAIN_DELAY, async move {
            abort::kill(job.as_ref(), &cause);
        });
    }
}

impl<W: Write> Write for SizeLimitWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.record(n);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decides whether and how a job's output gets a [`SizeLimitWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFilter {
    /// Use the global settings' log limit, if monitoring is enabled.
    Global,
    /// Use this many bytes, regardless of the global settings.
    Explicit(u64),
}

impl LogFilter {
    pub fn global() -> Self {
        LogFilter::Global
    }

    pub fn explicit(bytes: u64) -> Self {
        LogFilter::Explicit(bytes)
    }

    /// An explicit limit given in megabytes (1 MB = 1024 * 1024 bytes).
    pub fn explicit_megabytes(megabytes: u64) -> Self {
        LogFilter::Explicit(megabytes.saturating_mul(1024 * 1024))
    }

    /// The limit this filter would enforce, or `None` for no sentinel.
    pub fn effective_limit(&self, settings: &dyn Settings) -> Option<u64> {
        let limit = match *self {
            LogFilter::Global if settings.is_enabled() => settings.max_log_bytes(),
            LogFilter::Global => 0,
            LogFilter::Explicit(bytes) => bytes,
        };
        (limit > 0).then_some(limit)
    }

    /// Wrap `sink` in a sentinel, or hand it back unwrapped when there is no
    /// limit to enforce.
    pub fn decorate<W: Write + Send + 'static>(
        &self,
        sink: W,
        job: &Arc<dyn Job>,
        settings: &dyn Settings,
        scheduler: &Scheduler,
    ) -> Box<dyn Write + Send> {
        match self.effective_limit(settings) {
            Some(limit) => {
                tracing::debug!(job = %job.display_name(), limit, "installing output limit");
                Box::new(SizeLimitWriter::new(
                    sink,
                    limit,
                    Arc::clone(job),
                    scheduler.clone(),
                ))
            }
            None => Box::new(sink),
        }
    }
}
