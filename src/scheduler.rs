//! One shared scheduler for every monitor and deferred abort in the process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Recurring and one-shot task scheduler backed by a tokio runtime.
///
/// Each recurring entry is its own task, so a slow tick for one job never
/// delays another job's ticks. The number of ticks running at once across all
/// entries is bounded by `max_concurrent_ticks`.
///
/// The scheduler keeps a runtime [`Handle`], so it can be used from threads
/// that are not part of the runtime (such as a synchronous writer).
#[derive(Clone)]
pub struct Scheduler {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(runtime: Handle, max_concurrent_ticks: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent_ticks.max(1))),
        }
    }

    /// Run `task` every `period`, first one period from now.
    ///
    /// Fixed rate: tick start times are anchored to the schedule, not to the
    /// end of the previous tick. Ticks of one entry never overlap; a late tick
    /// is followed immediately by the ones it delayed.
    ///
    /// A panicking tick is logged and the schedule carries on. Cancelling the
    /// returned handle stops future ticks but lets a tick already in flight
    /// run to completion.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        name: impl Into<String>,
        period: Duration,
        task: F,
    ) -> ScheduleHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let period = period.max(Duration::from_millis(1));
        let runtime = self.runtime.clone();
        let permits = Arc::clone(&self.permits);

        let join = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return;
                };
                let fut = task();
                let tick = runtime.spawn(async move {
                    let _permit = permit;
                    fut.await
                });
                if let Err(e) = tick.await {
                    if e.is_panic() {
                        tracing::warn!(task = %name, "scheduled tick panicked");
                    }
                }
            }
        });

        ScheduleHandle {
            abort: join.abort_handle(),
        }
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<Fut>(&self, delay: Duration, task: Fut) -> ScheduleHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await
        });
        ScheduleHandle {
            abort: join.abort_handle(),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

/// Handle to a scheduled entry. Dropping it does not cancel the entry.
#[derive(Debug)]
pub struct ScheduleHandle {
    abort: AbortHandle,
}

impl ScheduleHandle {
    /// Stop the entry. Safe to call any number of times.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}
