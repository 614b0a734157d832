//! Resource limits for running jobs.
//!
//! Every monitored job gets two guards. An inline sentinel wraps the job's
//! output stream and aborts the job as soon as it has written more than its
//! byte limit. A periodic monitor checks the job's log file and workspace on
//! a shared scheduler and aborts the job when either grows past its ceiling.
//!
//! Hosts adapt their jobs to [`Job`], then drive a [`LifecycleController`]
//! from their job start, completion and finalization notifications.

pub mod abort;
pub mod config;
pub mod dirsize;
pub mod job;
pub mod monitor;
pub mod node;
pub mod process;
pub mod registry;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod sentinel;

#[cfg(test)]
mod testing;

pub use abort::{kill, KillOutcome};
pub use config::{ResourceLimits, Settings};
pub use job::{AbortCause, Abortable, Job, JobId, OutputSink};
pub use node::{NodeChannel, Workspace};
pub use registry::LifecycleController;
pub use scheduler::Scheduler;
pub use sentinel::LogFilter;
