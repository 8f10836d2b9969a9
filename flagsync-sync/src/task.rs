//! Periodic sync task runner.
//!
//! A [`SyncTask`] wraps a [`SyncJob`] and runs it on a fixed period until
//! stopped. Stopping hands the job a deactivated [`TaskContext`] so an
//! in-flight fetch can notice and discard its result instead of applying
//! stale data after the task was told to stand down.

use crate::error::SyncResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tells a running job whether its result is still wanted.
#[derive(Clone)]
pub struct TaskContext {
    active: Option<Arc<AtomicBool>>,
}

impl TaskContext {
    /// Context for one-shot executions; always active.
    pub fn detached() -> Self {
        Self { active: None }
    }

    fn watching(flag: Arc<AtomicBool>) -> Self {
        Self { active: Some(flag) }
    }

    /// `false` once the owning task has been stopped.
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(true)
    }
}

/// A unit of sync work runnable periodically or on demand.
#[async_trait]
pub trait SyncJob: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> SyncResult<()>;
}

struct TaskState {
    /// Activity flag for the current generation; `None` when stopped.
    /// Each start gets a fresh flag so a stop/start cycle cannot revive
    /// the previous generation's in-flight work.
    active: Option<Arc<AtomicBool>>,
    stop_tx: Option<mpsc::Sender<()>>,
}

/// Named periodic job with idempotent start/stop.
pub struct SyncTask {
    name: String,
    period: Duration,
    job: Arc<dyn SyncJob>,
    state: Mutex<TaskState>,
}

impl SyncTask {
    pub fn new(name: impl Into<String>, period: Duration, job: Arc<dyn SyncJob>) -> Self {
        Self {
            name: name.into(),
            period,
            job,
            state: Mutex::new(TaskState {
                active: None,
                stop_tx: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .active
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Starts the periodic loop. The job runs once immediately, then every
    /// period. Calling start on a running task is a no-op.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state
            .active
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            info!("sync task {} already running", self.name);
            return;
        }

        let flag = Arc::new(AtomicBool::new(true));
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        state.active = Some(flag.clone());
        state.stop_tx = Some(stop_tx);
        drop(state);

        info!("starting sync task {} (period {:?})", self.name, self.period);

        let job = Arc::clone(&self.job);
        let name = self.name.clone();
        let period = self.period;
        tokio::spawn(async move {
            let ctx = TaskContext::watching(flag.clone());
            loop {
                if let Err(e) = job.run(&ctx).await {
                    warn!("sync task {name} run failed: {e}");
                }
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
            }
            debug!("sync task {name} loop exited");
        });
    }

    /// Stops the periodic loop and deactivates the current generation's
    /// context. Calling stop on a stopped task is a no-op.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(flag) = state.active.take() else {
            debug!("sync task {} not running", self.name);
            return;
        };
        flag.store(false, Ordering::SeqCst);
        // Dropping the sender wakes the loop out of its sleep.
        state.stop_tx.take();
        info!("stopping sync task {}", self.name);
    }

    /// Runs the job once, outside the periodic schedule.
    pub async fn execute(&self) -> SyncResult<()> {
        self.job.run(&TaskContext::detached()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingJob {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SyncJob for CountingJob {
        async fn run(&self, _ctx: &TaskContext) -> SyncResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_task(period: Duration) -> (SyncTask, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = SyncTask::new(
            "test",
            period,
            Arc::new(CountingJob { runs: runs.clone() }),
        );
        (task, runs)
    }

    #[tokio::test]
    async fn runs_immediately_and_then_periodically() {
        let (task, runs) = counting_task(Duration::from_millis(20));
        task.start();

        tokio::time::sleep(Duration::from_millis(70)).await;
        task.stop();

        let count = runs.load(Ordering::SeqCst);
        assert!(count >= 2, "expected several runs, got {count}");
    }

    #[tokio::test]
    async fn stop_halts_the_schedule() {
        let (task, runs) = counting_task(Duration::from_millis(10));
        task.start();
        tokio::time::sleep(Duration::from_millis(5)).await;
        task.stop();
        assert!(!task.is_running());

        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (task, runs) = counting_task(Duration::from_secs(3600));
        task.start();
        task.start();
        task.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        task.stop();
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let (task, _runs) = counting_task(Duration::from_millis(10));
        task.stop();
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn restart_after_stop_works() {
        let (task, runs) = counting_task(Duration::from_secs(3600));
        task.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.stop();

        task.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        task.stop();
    }

    #[tokio::test]
    async fn execute_runs_once_without_starting() {
        let (task, runs) = counting_task(Duration::from_secs(3600));
        task.execute().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn stopping_deactivates_the_running_context() {
        struct SlowJob {
            observed_inactive: Arc<AtomicBool>,
        }

        #[async_trait]
        impl SyncJob for SlowJob {
            async fn run(&self, ctx: &TaskContext) -> SyncResult<()> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if !ctx.is_active() {
                    self.observed_inactive.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
        }

        let observed = Arc::new(AtomicBool::new(false));
        let task = SyncTask::new(
            "slow",
            Duration::from_secs(3600),
            Arc::new(SlowJob {
                observed_inactive: observed.clone(),
            }),
        );

        task.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.stop();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(observed.load(Ordering::SeqCst));
    }
}
