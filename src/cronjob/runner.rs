//! Fixed-period job loop.

use crate::server::metrics;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub type JobFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// A named function executed every `schedule_period`.
///
/// The body receives the cancellation token governing the current run.
/// Long bodies should watch it and return early once it fires.
#[derive(Clone)]
pub struct CronJob {
    pub name: String,
    pub schedule_period: Duration,
    func: JobFn,
}

impl CronJob {
    pub fn new<F, Fut>(name: impl Into<String>, schedule_period: Duration, func: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            schedule_period,
            func: Arc::new(move |token| func(token).boxed()),
        }
    }

    /// Job whose body does synchronous work, such as SQLite transactions.
    ///
    /// Each run executes on the blocking pool and the runner awaits it, so
    /// runs still never overlap.
    pub fn blocking<F>(name: impl Into<String>, schedule_period: Duration, func: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let job_name = name.clone();
        let func = Arc::new(func);
        Self::new(name, schedule_period, move |_| {
            let func = func.clone();
            let job_name = job_name.clone();
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || func()).await {
                    error!("Job {} panicked: {}", job_name, e);
                }
            }
        })
    }
}

impl std::fmt::Debug for CronJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronJob")
            .field("name", &self.name)
            .field("schedule_period", &self.schedule_period)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Waiting,
}

/// Runs a [`CronJob`] until cancelled or stopped.
///
/// Iterations never overlap. A run that takes longer than the period is
/// followed immediately by the next one; missed periods are not caught up.
pub struct PeriodicRunner {
    job: CronJob,
    state: Mutex<RunnerState>,
    stop: CancellationToken,
}

impl PeriodicRunner {
    pub fn new(job: CronJob) -> Self {
        Self {
            job,
            state: Mutex::new(RunnerState::Idle),
            stop: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock().unwrap()
    }

    /// Stop the runner for good. Safe to call any number of times.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn set_state(&self, state: RunnerState) {
        *self.state.lock().unwrap() = state;
    }

    /// Loop until `shutdown` fires or [`stop`](Self::stop) is called.
    ///
    /// Returns to `Idle` on exit so it can be run again, e.g. after this
    /// instance regains leadership.
    pub async fn run(&self, shutdown: &CancellationToken) {
        let period = self.job.schedule_period;
        debug!("Starting periodic job {} (period={:?})", self.job.name, period);

        loop {
            if shutdown.is_cancelled() || self.stop.is_cancelled() {
                break;
            }

            self.set_state(RunnerState::Running);
            let start = Instant::now();
            (self.job.func)(shutdown.clone()).await;
            let elapsed = start.elapsed();
            metrics::record_cron_job_run(&self.job.name, elapsed);

            if elapsed >= period {
                debug!(
                    "Job {} took {:?}, longer than its period, starting next run",
                    self.job.name, elapsed
                );
                continue;
            }

            self.set_state(RunnerState::Waiting);
            tokio::select! {
                _ = tokio::time::sleep(period - elapsed) => {}
                _ = shutdown.cancelled() => break,
                _ = self.stop.cancelled() => break,
            }
        }

        self.set_state(RunnerState::Idle);
        info!("Periodic job {} stopped", self.job.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(
        period: Duration,
        body: impl Fn(usize, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> (CronJob, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let job_counter = counter.clone();
        let job = CronJob::new("test-job", period, move |token| {
            let call = job_counter.fetch_add(1, Ordering::SeqCst) + 1;
            body(call, token)
        });
        (job, counter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_body_cancels() {
        let (job, counter) = counting_job(Duration::from_nanos(1), |call, token| {
            async move {
                if call == 3 {
                    token.cancel();
                }
            }
            .boxed()
        });

        let shutdown = CancellationToken::new();
        PeriodicRunner::new(job).run(&shutdown).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_body_does_not_queue_extra_run() {
        let period = Duration::from_millis(100);
        let (job, counter) = counting_job(period, move |_, token| {
            async move {
                tokio::time::sleep(period * 2).await;
                token.cancel();
            }
            .boxed()
        });

        let shutdown = CancellationToken::new();
        PeriodicRunner::new(job).run(&shutdown).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_remaining_period_between_runs() {
        let period = Duration::from_secs(10);
        let (job, counter) = counting_job(period, |_, _| {
            async move {
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
            .boxed()
        });
        let runner = Arc::new(PeriodicRunner::new(job));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            async move { runner.run(&shutdown).await }
        });

        // Runs start at t=0, 10, 20
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(runner.state(), RunnerState::Waiting);

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(runner.state(), RunnerState::Idle);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_exits_without_new_run() {
        let (job, counter) = counting_job(Duration::from_secs(3600), |_, _| async {}.boxed());
        let runner = Arc::new(PeriodicRunner::new(job));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            async move { runner.run(&shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (job, counter) = counting_job(Duration::from_secs(60), |_, _| async {}.boxed());
        let runner = Arc::new(PeriodicRunner::new(job));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            async move { runner.run(&shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        runner.stop();
        runner.stop();
        handle.await.unwrap();
        runner.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!shutdown.is_cancelled());

        // A stopped runner does not start again
        runner.run(&shutdown).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_job_runs_off_the_runtime() {
        let runs = Arc::new(AtomicUsize::new(0));
        let body_thread = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();
        let job = CronJob::blocking("blocking-job", Duration::from_secs(3600), {
            let runs = runs.clone();
            let body_thread = body_thread.clone();
            let shutdown = shutdown.clone();
            move || {
                *body_thread.lock().unwrap() = Some(std::thread::current().id());
                std::thread::sleep(Duration::from_millis(20));
                runs.fetch_add(1, Ordering::SeqCst);
                shutdown.cancel();
            }
        });

        PeriodicRunner::new(job).run(&shutdown).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let body_thread = body_thread.lock().unwrap().expect("body did not run");
        assert_ne!(body_thread, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_blocking_job_panic_does_not_stop_runner() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let job = CronJob::blocking("panicking-job", Duration::from_millis(1), {
            let runs = runs.clone();
            let shutdown = shutdown.clone();
            move || {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
                shutdown.cancel();
            }
        });

        PeriodicRunner::new(job).run(&shutdown).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
