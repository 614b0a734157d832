//! Bookkeeping for active monitors: at most one per job.

use crate::config::{ResourceLimits, Settings};
use crate::job::{Job, JobId, OutputSink};
use crate::monitor::Monitor;
use crate::scheduler::{ScheduleHandle, Scheduler};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Registration {
    token: u64,
    limits: ResourceLimits,
    schedule: ScheduleHandle,
}

/// Map from job identity to that job's scheduled monitor.
///
/// Each registration carries a token so that a monitor retiring itself can
/// only remove its own entry, never a newer one installed for the same job.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    entries: DashMap<JobId, Registration>,
    next_token: AtomicU64,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Record `schedule` as the monitor for `id`, cancelling any previous one.
    pub(crate) fn register(
        &self,
        id: JobId,
        token: u64,
        limits: ResourceLimits,
        schedule: ScheduleHandle,
    ) {
        let replaced = self.entries.insert(
            id.clone(),
            Registration {
                token,
                limits,
                schedule,
            },
        );
        if let Some(old) = replaced {
            tracing::warn!(job = %id, "job already had a monitor, replacing it");
            old.schedule.cancel();
        }
    }

    /// Remove and cancel the entry for `id` only if it still carries `token`.
    pub(crate) fn deregister(&self, id: &JobId, token: u64) -> bool {
        match self.entries.remove_if(id, |_, reg| reg.token == token) {
            Some((_, reg)) => {
                reg.schedule.cancel();
                tracing::debug!(job = %id, "cancelled resource monitor");
                true
            }
            None => false,
        }
    }

    /// Remove and cancel whatever entry `id` has. A missing entry is a no-op.
    pub fn remove(&self, id: &JobId) -> bool {
        match self.entries.remove(id) {
            Some((_, reg)) => {
                reg.schedule.cancel();
                tracing::debug!(job = %id, "cancelled resource monitor");
                true
            }
            None => false,
        }
    }

    /// Limits the job's current monitor enforces.
    pub fn limits(&self, id: &JobId) -> Option<ResourceLimits> {
        self.entries.get(id).map(|reg| reg.limits)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entry points the host wires into its job lifecycle notifications.
pub struct LifecycleController {
    settings: Arc<dyn Settings>,
    scheduler: Scheduler,
    registry: Arc<MonitorRegistry>,
}

impl LifecycleController {
    pub fn new(settings: Arc<dyn Settings>, scheduler: Scheduler) -> Self {
        Self {
            settings,
            scheduler,
            registry: Arc::new(MonitorRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn settings(&self) -> &dyn Settings {
        self.settings.as_ref()
    }

    /// A job started: snapshot the limits and schedule its monitor.
    ///
    /// Does nothing when monitoring is disabled or no limit is set. Returns
    /// whether a monitor was installed.
    pub fn on_job_started(&self, job: Arc<dyn Job>, output: OutputSink) -> bool {
        match ResourceLimits::from_settings(self.settings.as_ref()) {
            Some(limits) => self.monitor(job, output, limits),
            None => {
                tracing::debug!(job = %job.display_name(), "resource monitoring off for job");
                false
            }
        }
    }

    /// Schedule a monitor for `job` with an explicit snapshot of limits.
    pub(crate) fn monitor(&self, job: Arc<dyn Job>, output: OutputSink, limits: ResourceLimits) -> bool {
        if !limits.any_enabled() {
            return false;
        }
        let id = job.id();
        tracing::debug!(
            job = %job.display_name(),
            log_limit = limits.max_log_bytes,
            workspace_limit = limits.max_workspace_bytes,
            interval_secs = limits.poll_interval.as_secs_f64(),
            "scheduling resource monitor"
        );

        let token = self.registry.next_token();
        let monitor = Arc::new(Monitor::new(
            job,
            output,
            limits,
            Arc::clone(&self.registry),
            token,
        ));
        let ticking = Arc::clone(&monitor);
        let schedule = self.scheduler.schedule_at_fixed_rate(
            format!("monitor:{id}"),
            limits.poll_interval,
            move || {
                let monitor = Arc::clone(&ticking);
                async move { monitor.run_tick().await }
            },
        );
        self.registry.register(id.clone(), token, limits, schedule);
        // A very short interval can retire the monitor before it was registered.
        if monitor.is_retired() {
            self.registry.deregister(&id, token);
        }
        true
    }

    /// The job completed. Idempotent.
    pub fn on_job_completed(&self, job: &dyn Job) {
        self.registry.remove(&job.id());
    }

    /// The job's record was finalized. Idempotent.
    pub fn on_job_finalized(&self, job: &dyn Job) {
        self.registry.remove(&job.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::node::Workspace;
    use crate::testing::{wait_for, FakeJob, SharedBuffer};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::runtime::Handle;

    fn controller(enabled: bool, log: u64, ws: u64) -> LifecycleController {
        let settings = MonitorConfig {
            enabled,
            max_log_bytes: log,
            max_workspace_bytes: ws,
            check_interval_secs: 10,
        };
        LifecycleController::new(Arc::new(settings), Scheduler::new(Handle::current(), 4))
    }

    fn fast(log: u64, ws: u64) -> ResourceLimits {
        ResourceLimits {
            max_log_bytes: log,
            max_workspace_bytes: ws,
            poll_interval: Duration::from_millis(30),
        }
    }

    fn write_bytes(path: &std::path::Path, len: usize) {
        std::fs::write(path, vec![b'x'; len]).unwrap();
    }

    #[tokio::test]
    async fn test_both_limits_disabled_installs_nothing() {
        let ctl = controller(true, 0, 0);
        let fake = Arc::new(FakeJob::new("c"));
        assert!(!ctl.on_job_started(fake.clone(), SharedBuffer::new().sink()));
        assert!(!ctl.registry().contains(&JobId::new("c")));
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn test_monitoring_disabled_installs_nothing() {
        let ctl = controller(false, 100, 100);
        let fake = Arc::new(FakeJob::new("off"));
        assert!(!ctl.on_job_started(fake, SharedBuffer::new().sink()));
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_then_complete_and_finalize() {
        let ctl = controller(true, 100, 0);
        let fake = Arc::new(FakeJob::new("j"));
        assert!(ctl.on_job_started(fake.clone(), SharedBuffer::new().sink()));
        assert!(ctl.registry().contains(&JobId::new("j")));

        ctl.on_job_completed(fake.as_ref());
        assert!(ctl.registry().is_empty());
        ctl.on_job_completed(fake.as_ref());
        ctl.on_job_finalized(fake.as_ref());
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_without_registration_is_noop() {
        let ctl = controller(true, 100, 0);
        let fake = FakeJob::new("never-started");
        ctl.on_job_finalized(&fake);
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_remove_newer_registration() {
        let registry = MonitorRegistry::new();
        let sched = Scheduler::new(Handle::current(), 1);
        let id = JobId::new("dup");
        let first = registry.next_token();
        let second = registry.next_token();
        registry.register(id.clone(), first, fast(100, 0), sched.schedule_once(Duration::from_secs(3600), async {}));
        registry.register(id.clone(), second, fast(100, 0), sched.schedule_once(Duration::from_secs(3600), async {}));

        assert_eq!(registry.len(), 1);
        assert!(!registry.deregister(&id, first));
        assert!(registry.contains(&id));
        assert!(registry.deregister(&id, second));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_start_replaces_old_monitor() {
        let ctl = controller(true, 100, 0);
        let old = Arc::new(FakeJob::new("same"));
        let new = Arc::new(FakeJob::new("same"));
        ctl.monitor(old.clone(), SharedBuffer::new().sink(), fast(100, 0));
        assert!(wait_for(Duration::from_secs(2), || old.liveness_checks() > 0).await);

        ctl.monitor(new.clone(), SharedBuffer::new().sink(), fast(100, 0));
        assert_eq!(ctl.registry().len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let old_checks = old.liveness_checks();
        assert!(wait_for(Duration::from_secs(2), || new.liveness_checks() >= 3).await);
        assert_eq!(old.liveness_checks(), old_checks);
        ctl.on_job_completed(new.as_ref());
    }

    /// Settings whose values can change while jobs are running.
    #[derive(Default)]
    struct LiveSettings {
        enabled: AtomicBool,
        max_log_bytes: AtomicU64,
        max_workspace_bytes: AtomicU64,
        interval_secs: AtomicU64,
    }

    impl Settings for LiveSettings {
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn max_log_bytes(&self) -> u64 {
            self.max_log_bytes.load(Ordering::SeqCst)
        }

        fn max_workspace_bytes(&self) -> u64 {
            self.max_workspace_bytes.load(Ordering::SeqCst)
        }

        fn poll_interval_secs(&self) -> u64 {
            self.interval_secs.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_started_job_keeps_limits_from_its_start() {
        let settings = Arc::new(LiveSettings::default());
        settings.enabled.store(true, Ordering::SeqCst);
        settings.max_log_bytes.store(100, Ordering::SeqCst);
        settings.interval_secs.store(30, Ordering::SeqCst);
        let ctl = LifecycleController::new(settings.clone(), Scheduler::new(Handle::current(), 2));

        let first = Arc::new(FakeJob::new("early"));
        assert!(ctl.on_job_started(first.clone(), SharedBuffer::new().sink()));

        settings.max_log_bytes.store(5, Ordering::SeqCst);
        settings.max_workspace_bytes.store(4096, Ordering::SeqCst);
        settings.interval_secs.store(1, Ordering::SeqCst);

        let early = ctl.registry().limits(&JobId::new("early")).unwrap();
        assert_eq!(early.max_log_bytes, 100);
        assert_eq!(early.max_workspace_bytes, 0);
        assert_eq!(early.poll_interval, Duration::from_secs(30));

        let second = Arc::new(FakeJob::new("late"));
        assert!(ctl.on_job_started(second.clone(), SharedBuffer::new().sink()));
        let late = ctl.registry().limits(&JobId::new("late")).unwrap();
        assert_eq!(late.max_log_bytes, 5);
        assert_eq!(late.max_workspace_bytes, 4096);
        assert_eq!(late.poll_interval, crate::config::MIN_POLL_INTERVAL);

        settings.enabled.store(false, Ordering::SeqCst);
        assert!(ctl.registry().contains(&JobId::new("early")));
        ctl.on_job_completed(first.as_ref());
        ctl.on_job_completed(second.as_ref());
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_retires_when_job_stops() {
        let ctl = controller(true, 100, 0);
        let fake = Arc::new(FakeJob::new("stops"));
        let id = JobId::new("stops");
        ctl.monitor(fake.clone(), SharedBuffer::new().sink(), fast(100, 0));
        assert!(wait_for(Duration::from_secs(2), || fake.liveness_checks() >= 2).await);

        fake.set_running(false);
        assert!(wait_for(Duration::from_secs(2), || !ctl.registry().contains(&id)).await);
        let checks = fake.liveness_checks();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fake.liveness_checks(), checks);
        assert_eq!(fake.abort_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_log_written_outside_sentinel_is_caught() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("job.log");
        std::fs::write(&log, b"").unwrap();
        let ctl = controller(true, 100, 0);
        let fake = Arc::new(FakeJob::new("a").with_log_file(&log));
        let out = SharedBuffer::new();
        let id = JobId::new("a");
        ctl.monitor(fake.clone(), out.sink(), fast(100, 0));

        write_bytes(&log, 150);

        assert!(wait_for(Duration::from_secs(2), || fake.abort_count() == 1).await);
        assert!(wait_for(Duration::from_secs(2), || !ctl.registry().contains(&id)).await);
        assert_eq!(
            fake.causes(),
            vec![crate::job::AbortCause::LogSize {
                size: 150,
                limit: 100
            }]
        );
        assert!(out.text().contains("Job log exceeded limit of 100 bytes"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workspace_over_limit_aborts_on_first_tick() {
        let dir = tempdir().unwrap();
        write_bytes(&dir.path().join("a.bin"), 1024);
        write_bytes(&dir.path().join("b.bin"), 1024);
        let ctl = controller(true, 0, 1024);
        let fake = Arc::new(FakeJob::new("b").with_workspace(Workspace::local(dir.path())));
        let out = SharedBuffer::new();
        ctl.monitor(fake.clone(), out.sink(), fast(0, 1024));

        assert!(wait_for(Duration::from_secs(2), || fake.abort_count() == 1).await);
        assert!(wait_for(Duration::from_secs(2), || ctl.registry().is_empty()).await);
        assert!(out.text().contains("Workspace size 2048 bytes exceeded limit 1024"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_stops_ticks() {
        let ctl = controller(true, 100, 0);
        let fake = Arc::new(FakeJob::new("done"));
        ctl.monitor(fake.clone(), SharedBuffer::new().sink(), fast(100, 0));
        assert!(wait_for(Duration::from_secs(2), || fake.liveness_checks() >= 1).await);

        ctl.on_job_completed(fake.as_ref());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let checks = fake.liveness_checks();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fake.liveness_checks(), checks);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_and_complete_leave_registry_empty() {
        let ctl = Arc::new(controller(true, 100, 0));
        let mut tasks = Vec::new();
        for i in 0..32 {
            let ctl = Arc::clone(&ctl);
            tasks.push(tokio::spawn(async move {
                let fake = Arc::new(FakeJob::new(&format!("job-{i}")));
                ctl.on_job_started(fake.clone(), SharedBuffer::new().sink());
                tokio::task::yield_now().await;
                ctl.on_job_completed(fake.as_ref());
                ctl.on_job_finalized(fake.as_ref());
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(ctl.registry().is_empty());
    }
}
