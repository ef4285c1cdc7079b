//! Cooperative single-threaded scheduler.
//!
//! Work registered through a [`SchedulerHandle`] is deferred until
//! [`Scheduler::run`] drives the loop; `run` blocks until no tracked work
//! remains.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::trace;

use crate::error::ClientError;

/// Owns a current-thread runtime and tracks the work spawned on it.
pub struct Scheduler {
    runtime: Option<Runtime>,
    handle: SchedulerHandle,
    running: AtomicBool,
}

/// Cheap handle for registering work on a [`Scheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    tracker: TaskTracker,
    runtime: Handle,
}

impl SchedulerHandle {
    /// Register work that keeps [`Scheduler::run`] alive until it completes.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tracker.spawn_on(task, &self.runtime);
    }

    /// Register work that runs while the loop runs but never keeps it alive.
    pub fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.runtime.spawn(task);
    }

    /// Number of tracked tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}

impl Scheduler {
    pub fn new() -> Result<Self, ClientError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("slackline-scheduler")
            .build()
            .map_err(ClientError::SchedulerInit)?;
        let handle = SchedulerHandle {
            tracker: TaskTracker::new(),
            runtime: runtime.handle().clone(),
        };
        Ok(Self {
            runtime: Some(runtime),
            handle,
            running: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn pending(&self) -> usize {
        self.handle.pending()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Check that [`run`](Self::run) could start right now from this thread.
    pub fn ensure_runnable(&self) -> Result<(), ClientError> {
        if Handle::try_current().is_ok() {
            return Err(ClientError::InsideRuntime);
        }
        if self.is_running() {
            return Err(ClientError::SchedulerBusy);
        }
        Ok(())
    }

    /// Drive all registered work to completion, blocking the calling thread.
    ///
    /// Work spawned while running (including by other tasks) is waited for as
    /// well. `tick` controls how often outstanding work is reported.
    pub fn run(&self, tick: Duration) -> Result<(), ClientError> {
        self.ensure_runnable()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::SchedulerBusy);
        }
        let _running = RunningGuard(&self.running);

        let Some(runtime) = self.runtime.as_ref() else {
            return Err(ClientError::SchedulerBusy);
        };

        let tracker = self.handle.tracker.clone();
        let tick = tick.max(Duration::from_millis(1));
        runtime.block_on(async move {
            tracker.close();
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let idle = tracker.wait();
            tokio::pin!(idle);
            loop {
                tokio::select! {
                    _ = &mut idle => break,
                    _ = ticker.tick() => {
                        trace!(pending = tracker.len(), "scheduler tick");
                    }
                }
            }
        });
        self.handle.tracker.reopen();
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(5);

    #[test]
    fn run_with_no_work_returns() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(TICK).unwrap();
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn spawned_work_is_deferred_until_run() {
        let scheduler = Scheduler::new().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        scheduler.handle().spawn(async move {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        scheduler.run(TICK).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_waits_for_nested_work() {
        let scheduler = Scheduler::new().unwrap();
        let handle = scheduler.handle();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        scheduler.handle().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            });
        });
        scheduler.run(TICK).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn background_work_does_not_keep_run_alive() {
        let scheduler = Scheduler::new().unwrap();
        scheduler
            .handle()
            .spawn_background(std::future::pending::<()>());
        scheduler.run(TICK).unwrap();
    }

    #[test]
    fn overlapping_run_is_rejected() {
        let scheduler = Arc::new(Scheduler::new().unwrap());
        let inner = Arc::clone(&scheduler);
        let result = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&result);
        scheduler.handle().spawn(async move {
            *slot.lock() = Some(inner.run(TICK));
        });
        scheduler.run(TICK).unwrap();
        let nested = result.lock().take().unwrap();
        assert!(matches!(
            nested,
            Err(ClientError::InsideRuntime | ClientError::SchedulerBusy)
        ));
    }

    #[test]
    fn run_can_be_repeated() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.run(TICK).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        scheduler.handle().spawn(async move {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.run(TICK).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_inside_runtime_is_rejected() {
        let scheduler = Scheduler::new().unwrap();
        assert!(matches!(scheduler.run(TICK), Err(ClientError::InsideRuntime)));
    }
}
