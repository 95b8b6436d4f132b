//! The polling worker that drains the projection queue into the index.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use datahive_projection::{FailureOutcome, SearchIndex, TaskStore};

/// Longest error message persisted with a task or dead letter.
const MAX_ERROR_LEN: usize = 2000;

/// Projection worker configuration.
///
/// Passed into [`ProjectionWorker::spawn`] explicitly — the worker reads no
/// ambient configuration, which keeps it runnable in tests without any
/// process-level setup.
#[derive(Debug, Clone)]
pub struct ProjectionWorkerConfig {
    /// Name for the thread and log fields.
    pub name: String,
    /// Fixed delay between polls when the queue is empty or errored.
    pub poll_interval: Duration,
    /// Maximum tasks claimed per poll.
    pub batch_size: usize,
}

impl Default for ProjectionWorkerConfig {
    fn default() -> Self {
        Self {
            name: "projection-worker".to_string(),
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

impl ProjectionWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Handle to control and observe a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// In-flight tasks finish; unclaimed ones stay queued for the next worker.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Current per-outcome counters.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Polls the task store on a fixed interval and applies claimed tasks to the
/// search index.
///
/// Several workers may run against one store (threads in one process or
/// separate replicas); the store's atomic claim keeps their batches disjoint.
/// Store errors during claim/mark never crash the loop — they are logged and
/// the poll retried next tick. The only worker-side error handling decision
/// is routing: transient apply failures go to `mark_failure` (backoff or,
/// once the budget is spent, the DLQ), permanent ones to `dead_letter`.
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn the worker on its own thread.
    pub fn spawn<S, I>(store: S, index: I, config: ProjectionWorkerConfig) -> WorkerHandle
    where
        S: TaskStore + 'static,
        I: SearchIndex + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || {
                worker_loop(store, index, config, shutdown_rx, stats_clone);
            })
            .expect("failed to spawn projection worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn worker_loop<S, I>(
    store: S,
    index: I,
    config: ProjectionWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: TaskStore,
    I: SearchIndex,
{
    info!(worker = %config.name, "projection worker started");
    let start_time = Instant::now();

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        {
            let mut s = stats.lock().unwrap();
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        let batch = match store.claim_batch(Utc::now(), config.batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to claim batch");
                thread::sleep(config.poll_interval);
                continue;
            }
        };

        if batch.is_empty() {
            thread::sleep(config.poll_interval);
            continue;
        }

        debug!(worker = %config.name, batch_len = batch.len(), "claimed batch");

        for task in batch {
            let outcome = process_task(&store, &index, &config.name, &task);
            let mut s = stats.lock().unwrap();
            s.tasks_processed += 1;
            match outcome {
                TaskOutcome::Succeeded => s.tasks_succeeded += 1,
                TaskOutcome::Retried => s.tasks_retried += 1,
                TaskOutcome::DeadLettered => s.tasks_dead_lettered += 1,
            }
        }
    }

    info!(worker = %config.name, "projection worker stopped");
}

enum TaskOutcome {
    Succeeded,
    Retried,
    DeadLettered,
}

fn process_task<S, I>(
    store: &S,
    index: &I,
    worker: &str,
    task: &datahive_projection::ProjectionTask,
) -> TaskOutcome
where
    S: TaskStore,
    I: SearchIndex,
{
    match index.apply(task.subject, &task.deltas, task.directive) {
        Ok(()) => {
            if let Err(e) = store.mark_success(task.id) {
                error!(worker, task_id = %task.id, error = %e, "failed to finalize task");
            }
            debug!(worker, task_id = %task.id, subject = %task.subject, "task applied");
            TaskOutcome::Succeeded
        }
        Err(apply_err) if apply_err.is_transient() => {
            let error = sanitize_error(&apply_err.to_string());
            match store.mark_failure(task.id, &error, Utc::now()) {
                Ok(FailureOutcome::Retried {
                    retry_count,
                    next_run_at,
                }) => {
                    debug!(
                        worker,
                        task_id = %task.id,
                        subject = %task.subject,
                        retry_count,
                        next_run_at = %next_run_at,
                        "task rescheduled"
                    );
                    TaskOutcome::Retried
                }
                Ok(FailureOutcome::DeadLettered) => {
                    warn!(
                        worker,
                        task_id = %task.id,
                        subject = %task.subject,
                        error = %error,
                        "task dead-lettered after exhausting retries"
                    );
                    TaskOutcome::DeadLettered
                }
                Err(e) => {
                    // Lease stays in place; the task resurfaces once it expires.
                    error!(worker, task_id = %task.id, error = %e, "failed to record task failure");
                    TaskOutcome::Retried
                }
            }
        }
        Err(apply_err) => {
            let error = sanitize_error(&apply_err.to_string());
            warn!(
                worker,
                task_id = %task.id,
                subject = %task.subject,
                error = %error,
                "non-retryable apply failure, dead-lettering"
            );
            if let Err(e) = store.dead_letter(task.id, &error) {
                error!(worker, task_id = %task.id, error = %e, "failed to dead-letter task");
            }
            TaskOutcome::DeadLettered
        }
    }
}

/// Collapse an error message to one line and cap its length before it is
/// persisted or logged.
fn sanitize_error(message: &str) -> String {
    let mut sanitized: String = message
        .replace(['\n', '\r'], " ")
        .chars()
        .take(MAX_ERROR_LEN)
        .collect();
    if message.chars().count() > MAX_ERROR_LEN {
        sanitized.push('…');
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_error_flattens_and_truncates() {
        assert_eq!(sanitize_error("plain"), "plain");
        assert_eq!(sanitize_error("two\nlines\r\nhere"), "two lines  here");

        let long = "x".repeat(MAX_ERROR_LEN + 50);
        let sanitized = sanitize_error(&long);
        assert_eq!(sanitized.chars().count(), MAX_ERROR_LEN + 1);
        assert!(sanitized.ends_with('…'));
    }

    #[test]
    fn config_builders_apply() {
        let config = ProjectionWorkerConfig::default()
            .with_name("search-sync")
            .with_poll_interval(Duration::from_millis(250))
            .with_batch_size(32);

        assert_eq!(config.name, "search-sync");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 32);
    }
}
