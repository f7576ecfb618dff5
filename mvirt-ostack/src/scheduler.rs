//! Scheduler boundary.
//!
//! Executors never sleep inside a call stack; every retry and every status
//! check is a new [`Task`] handed to a [`TaskScheduler`] with a delay. The
//! scheduler delivers each task at least once and re-delivers it when the
//! job fails with a retryable error, up to `max_attempts`.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Result;

pub type Job = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Unit of work handed to a scheduler.
pub struct Task {
    pub name: String,
    pub delay: Duration,
    pub max_attempts: u32,
    pub job: Job,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, job: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            max_attempts: 1,
            job: Arc::new(move || job().boxed()),
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Cancels a task that has not started yet.
#[derive(Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, task: Task) -> TaskHandle;
}

/// Scheduler running each task on the tokio runtime.
pub struct TokioScheduler {
    retry: RetryConfig,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TokioScheduler {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Tasks scheduled and not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no task is scheduled or running.
    ///
    /// Tasks scheduled by a running task count before it finishes, so a
    /// chain of polls keeps the scheduler busy until its last step.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let cancelled = handle.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);
        let retry = self.retry.clone();

        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if !task.delay.is_zero() {
                tokio::time::sleep(task.delay).await;
            }

            let max_attempts = task.max_attempts.max(1);
            for attempt in 1..=max_attempts {
                if cancelled.is_cancelled() {
                    debug!(task = %task.name, "Task cancelled before delivery");
                    break;
                }
                match (task.job)().await {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() && attempt < max_attempts => {
                        let delay = retry.backoff(attempt);
                        warn!(task = %task.name, attempt, error = %e, ?delay, "Task failed, redelivering");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(task = %task.name, error = %e, "Task rejected");
                        break;
                    }
                    Err(e) => {
                        warn!(task = %task.name, attempt, error = %e, "Task failed");
                        break;
                    }
                }
            }

            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::AtomicU32;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retryable_errors_are_redelivered() {
        let scheduler = TokioScheduler::new(fast_retry());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        scheduler.schedule(
            Task::new("flaky", move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::BackendTransient("busy".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .max_attempts(5),
        );

        scheduler.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_redelivered() {
        let scheduler = TokioScheduler::new(fast_retry());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        scheduler.schedule(
            Task::new("broken", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::BackendTerminal("no".to_string()))
                }
            })
            .max_attempts(5),
        );

        scheduler.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_never_runs() {
        let scheduler = TokioScheduler::new(fast_retry());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let handle = scheduler.schedule(
            Task::new("delayed", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .delay(Duration::from_millis(50)),
        );
        handle.cancel();

        scheduler.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }
}
