//! Worker lifecycle: runs the consumer and the pruner side by side.
//!
//! Both loops are spawned as independent tasks sharing one broadcast
//! shutdown channel. When the caller's signal future resolves the worker
//! broadcasts shutdown and waits for each task with a bounded timeout; a
//! task that overstays is aborted. Entries read but not yet acknowledged at
//! that point simply stay pending in the log.

use crate::consumer::StreamConsumer;
use crate::pruner::Pruner;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default time each task gets to stop after shutdown is broadcast.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How a task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskExit {
    /// Returned after seeing the shutdown signal
    Stopped,
    /// Panicked or was cancelled
    Failed(String),
    /// Did not stop within the shutdown timeout and was aborted
    TimedOut,
}

/// Exit status of both worker tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Stream consumer task
    pub consumer: TaskExit,
    /// Pruner task
    pub pruner: TaskExit,
}

impl ShutdownReport {
    /// Whether both tasks stopped on their own.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.consumer == TaskExit::Stopped && self.pruner == TaskExit::Stopped
    }
}

/// A consumer and a pruner run until a signal arrives.
pub struct Worker {
    consumer: StreamConsumer,
    pruner: Pruner,
    shutdown_timeout: Duration,
}

impl Worker {
    /// Create a worker with the default shutdown timeout.
    #[must_use]
    pub const fn new(consumer: StreamConsumer, pruner: Pruner) -> Self {
        Self {
            consumer,
            pruner,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set how long each task gets to stop.
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Spawn both tasks, wait for `signal`, then shut them down.
    pub async fn run<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel(4);
        let consumer = tokio::spawn(self.consumer.run(shutdown_tx.subscribe()));
        let pruner = tokio::spawn(self.pruner.run(shutdown_tx.subscribe()));
        tracing::info!("Worker started");

        signal.await;
        tracing::info!(
            timeout = ?self.shutdown_timeout,
            "Shutting down worker"
        );

        if let Err(e) = shutdown_tx.send(()) {
            tracing::warn!(error = %e, "No active shutdown receivers");
        }

        let (consumer, pruner) = futures::future::join(
            stop("consumer", consumer, self.shutdown_timeout),
            stop("pruner", pruner, self.shutdown_timeout),
        )
        .await;

        let report = ShutdownReport { consumer, pruner };
        if report.is_clean() {
            tracing::info!("Worker stopped");
        } else {
            tracing::warn!(?report, "Worker stopped with errors");
        }
        report
    }
}

async fn stop(task: &'static str, mut handle: JoinHandle<()>, timeout: Duration) -> TaskExit {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => {
            tracing::info!(task, "Task stopped gracefully");
            TaskExit::Stopped
        }
        Ok(Err(e)) => {
            tracing::error!(task, error = %e, "Task failed");
            TaskExit::Failed(e.to_string())
        }
        Err(_) => {
            tracing::warn!(task, ?timeout, "Task timed out, aborting");
            handle.abort();
            TaskExit::TimedOut
        }
    }
}
