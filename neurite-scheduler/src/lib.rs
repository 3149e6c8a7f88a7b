//! Tick-driven background job scheduler.
//!
//! A [`Scheduler`] wakes up once per tick, runs every job whose interval has
//! elapsed, and sleeps for whatever remains of the tick. Jobs that overrun
//! the tick delay the next wake-up rather than piling up concurrent runs:
//! within one scheduler, job executions never overlap.
//!
//! Jobs come in two flavors: [`Scheduler::every`] for recurring work and
//! [`Scheduler::once`] for work that runs on the next tick and is then
//! forgotten. Stopping is cooperative: cancel the token passed to
//! [`Scheduler::start`] and await the returned handle; the in-flight tick
//! finishes first.
//!
//! Job failures must not take the server down, so jobs return `()` and are
//! expected to log their own errors.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Job {
    name: String,
    /// `Duration::ZERO` marks a one-shot job, removed after its first run.
    interval: Duration,
    last_run: Option<Instant>,
    task: JobFn,
}

impl Job {
    fn due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        }
    }
}

/// In-process job scheduler. Cheap to clone; clones share one job table.
#[derive(Clone)]
pub struct Scheduler {
    tick: Duration,
    jobs: Arc<Mutex<Vec<Job>>>,
}

impl Scheduler {
    /// Create a scheduler that wakes up every `tick`.
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a recurring job. The first run happens on the next tick.
    pub async fn every<F, Fut>(&self, name: impl Into<String>, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(name.into(), interval, job).await;
    }

    /// Register a job that runs on the next tick and is then removed.
    pub async fn once<F, Fut>(&self, name: impl Into<String>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(name.into(), Duration::ZERO, job).await;
    }

    async fn add<F, Fut>(&self, name: String, interval: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task: JobFn = Arc::new(move || Box::pin(job()));
        let mut jobs = self.jobs.lock().await;
        tracing::debug!(job = %name, interval_ms = interval.as_millis() as u64, "registered job");
        jobs.push(Job {
            name,
            interval,
            last_run: None,
            task,
        });
    }

    /// Number of registered jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Spawn the scheduler loop. It runs until `cancel` fires; await the
    /// returned handle to wait out the in-flight tick.
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tracing::debug!(tick_ms = scheduler.tick.as_millis() as u64, "scheduler started");
            loop {
                let tick_start = Instant::now();
                scheduler.run_due(tick_start).await;

                let elapsed = tick_start.elapsed();
                if elapsed < scheduler.tick {
                    tokio::select! {
                        _ = tokio::time::sleep(scheduler.tick - elapsed) => {}
                        _ = cancel.cancelled() => break,
                    }
                } else if cancel.is_cancelled() {
                    break;
                }
            }
            tracing::debug!("scheduler stopped");
        })
    }

    /// Run every due job, then drop finished one-shots.
    async fn run_due(&self, now: Instant) {
        let mut jobs = self.jobs.lock().await;

        let mut i = 0;
        while i < jobs.len() {
            if jobs[i].due(now) {
                tracing::trace!(job = %jobs[i].name, "running job");
                let task = jobs[i].task.clone();
                task().await;
                jobs[i].last_run = Some(now);

                if jobs[i].interval.is_zero() {
                    jobs.remove(i);
                    continue;
                }
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_job(counter: Arc<AtomicUsize>) -> impl Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> {
        move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn recurring_job_runs_repeatedly() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .every("count", Duration::from_millis(10), counter_job(count.clone()))
            .await;

        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let runs = count.load(Ordering::SeqCst);
        assert!(runs >= 3, "expected several runs, got {runs}");
    }

    #[tokio::test]
    async fn one_shot_runs_once_and_is_removed() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler.once("oneshot", counter_job(count.clone())).await;
        assert_eq!(scheduler.job_count().await, 1);

        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test]
    async fn long_interval_job_does_not_run_early() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .every("slow", Duration::from_secs(3600), counter_job(count.clone()))
            .await;

        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        // First tick runs it once; the hour-long interval never elapses.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_waits_for_in_flight_tick() {
        let scheduler = Scheduler::new(Duration::from_millis(5));
        let done = Arc::new(AtomicUsize::new(0));
        let done_in_job = done.clone();
        scheduler
            .every("sleepy", Duration::from_millis(5), move || {
                let done = done_in_job.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.unwrap();

        // The job that was mid-run finished before the loop exited.
        assert!(done.load(Ordering::SeqCst) >= 1);
    }
}
