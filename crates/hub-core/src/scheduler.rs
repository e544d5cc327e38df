//! Scheduler (C8, §4.8): cron-driven jobs (hourly aggregation, retention
//! sweeps, periodic re-probing) registered by the host application and run
//! through `tokio-cron-scheduler`, with single-flight semantics so a slow
//! run never overlaps its own next tick.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

use hub_common::Error;

type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct RegisteredJob {
    /// `tokio-cron-scheduler`'s internal job id, needed to unregister.
    uuid: uuid::Uuid,
    /// Guards against overlapping runs of the same job (§4.8 single-flight).
    running: Arc<AtomicBool>,
}

/// Thin wrapper around `tokio-cron-scheduler` adding named jobs and
/// single-flight execution (§4.8).
pub struct Scheduler {
    inner: Mutex<Option<JobScheduler>>,
    jobs: Mutex<HashMap<String, RegisteredJob>>,
}

impl Scheduler {
    /// Construct an unstarted scheduler. Call `start()` before registering
    /// jobs expecting to actually fire.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(None),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Start the underlying tick loop.
    pub async fn start(&self) -> Result<(), Error> {
        let mut scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Internal(format!("scheduler init failed: {e}")))?;
        scheduler
            .start()
            .await
            .map_err(|e| Error::Internal(format!("scheduler start failed: {e}")))?;
        *self.inner.lock() = Some(scheduler);
        Ok(())
    }

    /// Stop the tick loop and drop all registered jobs.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let taken = self.inner.lock().take();
        if let Some(mut scheduler) = taken {
            scheduler
                .shutdown()
                .await
                .map_err(|e| Error::Internal(format!("scheduler shutdown failed: {e}")))?;
        }
        self.jobs.lock().clear();
        Ok(())
    }

    /// Register a named cron job (§4.8 `registerJob`). `cron` is a standard
    /// 6-field `tokio-cron-scheduler` expression (seconds first). Replaces
    /// any existing job registered under the same `id`. Runs are
    /// single-flight: if the previous tick's execution is still in flight,
    /// the new tick is skipped rather than queued.
    pub async fn register_job<F, Fut>(&self, id: impl Into<String>, cron: &str, execute: F) -> Result<(), Error>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        self.unregister_job(&id).await?;

        let running = Arc::new(AtomicBool::new(false));
        let execute: JobFn = Arc::new(move || Box::pin(execute()));

        let job_running = running.clone();
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let execute = execute.clone();
            let job_running = job_running.clone();
            Box::pin(async move {
                if job_running.swap(true, Ordering::SeqCst) {
                    tracing::debug!("skipping tick: previous run still in flight");
                    return;
                }
                execute().await;
                job_running.store(false, Ordering::SeqCst);
            })
        })
        .map_err(|e| Error::Internal(format!("invalid cron expression: {e}")))?;

        let uuid = {
            let guard = self.inner.lock();
            let Some(scheduler) = guard.as_ref() else {
                return Err(Error::Internal("scheduler not started".to_owned()));
            };
            scheduler
                .add(job)
                .await
                .map_err(|e| Error::Internal(format!("failed to register job: {e}")))?
        };

        self.jobs.lock().insert(id, RegisteredJob { uuid, running });
        Ok(())
    }

    /// Unregister a job by id (§4.8 `unregisterJob`). A no-op if the id
    /// isn't registered.
    pub async fn unregister_job(&self, id: &str) -> Result<(), Error> {
        let removed = self.jobs.lock().remove(id);
        let Some(removed) = removed else { return Ok(()) };
        let guard = self.inner.lock();
        if let Some(scheduler) = guard.as_ref() {
            scheduler
                .remove(&removed.uuid)
                .await
                .map_err(|e| Error::Internal(format!("failed to unregister job: {e}")))?;
        }
        Ok(())
    }

    /// Whether a job with this id is currently registered.
    pub fn is_registered(&self, id: &str) -> bool {
        self.jobs.lock().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn register_and_unregister_round_trip() {
        let scheduler = Scheduler::new();
        scheduler.start().await.unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        scheduler
            .register_job("tick", "* * * * * *", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();
        assert!(scheduler.is_registered("tick"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);

        scheduler.unregister_job("tick").await.unwrap();
        assert!(!scheduler.is_registered("tick"));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn overlapping_ticks_do_not_run_concurrently() {
        let scheduler = Scheduler::new();
        scheduler.start().await.unwrap();

        let concurrent = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));
        let c = concurrent.clone();
        let m = max_concurrent.clone();
        scheduler
            .register_job("slow", "* * * * * *", move || {
                let c = c.clone();
                let m = m.clone();
                async move {
                    let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1200)).await;
                    c.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await.unwrap();
    }
}
