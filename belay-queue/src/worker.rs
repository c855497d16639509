//! Worker pool that claims and executes jobs.

use crate::error::{JobError, QueueError, QueueResult};
use crate::job::Job;
use crate::queue::{FailureOutcome, Queue};
use crate::registry::Registry;
use crate::store::QueueFilter;
use belay_log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of the `locked_by` names; task `i` is `{name_prefix}:{i}`
    pub name_prefix: String,

    /// Queues to serve; empty serves all
    pub queues: Vec<String>,

    /// Number of concurrent jobs to process
    pub concurrency: usize,

    /// Poll interval when no job is runnable
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound of the retry delay after store errors
    #[serde(with = "humantime_serde")]
    pub max_poll_backoff: Duration,

    /// Whether to log job execution
    pub log_execution: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name_prefix: format!("belay:{}", std::process::id()),
            queues: Vec::new(),
            concurrency: 10,
            poll_interval: Duration::from_secs(5),
            max_poll_backoff: Duration::from_secs(60),
            log_execution: true,
        }
    }
}

impl WorkerConfig {
    /// Set the worker name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Serve only the named queues.
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the number of concurrent jobs.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the upper bound of the store-error backoff.
    pub fn with_max_poll_backoff(mut self, max: Duration) -> Self {
        self.max_poll_backoff = max;
        self
    }

    /// Enable or disable execution logging.
    pub fn with_log_execution(mut self, log: bool) -> Self {
        self.log_execution = log;
        self
    }

    fn filter(&self) -> QueueFilter {
        QueueFilter::only(self.queues.iter().cloned())
    }
}

/// Totals from [`Worker::work_off`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkOffReport {
    /// Jobs that ran to completion and were deleted
    pub succeeded: usize,
    /// Jobs released for another attempt
    pub retried: usize,
    /// Jobs marked failed
    pub failed: usize,
}

impl WorkOffReport {
    /// Jobs processed in total.
    pub fn total(&self) -> usize {
        self.succeeded + self.retried + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Retried,
    Failed,
    /// The claim was lost (reaped or the job deleted) before the failure was recorded.
    Lost,
}

/// Pool of tasks polling one queue.
pub struct Worker {
    queue: Queue,
    registry: Arc<Registry>,
    config: WorkerConfig,
    running: Arc<RwLock<bool>>,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker with default configuration.
    pub fn new(queue: Queue, registry: Registry) -> Self {
        Self::with_config(queue, registry, WorkerConfig::default())
    }

    /// Create a worker with custom configuration.
    pub fn with_config(queue: Queue, registry: Registry, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry: Arc::new(registry),
            config,
            running: Arc::new(RwLock::new(false)),
            shutdown: None,
            handles: Vec::new(),
        }
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start `concurrency` polling tasks.
    pub async fn start(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        if self.config.concurrency == 0 {
            return Err(QueueError::Config(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        *running = true;
        drop(running);

        info!(
            "Starting {} worker(s) as '{}' on {}",
            self.config.concurrency,
            self.config.name_prefix,
            describe_queues(&self.config.queues)
        );

        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);

        for i in 0..self.config.concurrency {
            let queue = self.queue.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            let name = format!("{}:{}", config.name_prefix, i);
            let mut shutdown = rx.clone();

            let handle = tokio::spawn(async move {
                let filter = config.filter();
                let mut backoff = config.poll_interval;

                while !*shutdown.borrow() {
                    let result =
                        process_next(&queue, &registry, &name, &filter, config.log_execution).await;
                    let delay = match result {
                        Ok(Some(_)) => {
                            backoff = config.poll_interval;
                            continue;
                        }
                        Ok(None) => {
                            backoff = config.poll_interval;
                            config.poll_interval
                        }
                        Err(e) => {
                            error!("[{}] Error processing job: {}", name, e);
                            let delay = backoff;
                            backoff = backoff.saturating_mul(2).min(config.max_poll_backoff);
                            delay
                        }
                    };

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }

                debug!("[{}] Stopped", name);
            });

            self.handles.push(handle);
        }

        Ok(())
    }

    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn stop(&mut self) -> QueueResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Err(QueueError::WorkerNotRunning);
        }
        *running = false;
        drop(running);

        info!("Stopping worker '{}'...", self.config.name_prefix);

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }

        info!("Worker '{}' stopped", self.config.name_prefix);
        Ok(())
    }

    /// Check if the worker is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run up to `limit` runnable jobs in the caller's task, then return.
    ///
    /// Stops early when nothing is runnable. Store errors are returned
    /// rather than retried.
    pub async fn work_off(&self, limit: usize) -> QueueResult<WorkOffReport> {
        let name = format!("{}:work_off", self.config.name_prefix);
        let filter = self.config.filter();
        let mut report = WorkOffReport::default();

        for _ in 0..limit {
            let Some(outcome) = process_next(
                &self.queue,
                &self.registry,
                &name,
                &filter,
                self.config.log_execution,
            )
            .await?
            else {
                break;
            };

            match outcome {
                Outcome::Succeeded => report.succeeded += 1,
                Outcome::Retried => report.retried += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Lost => {}
            }
        }

        Ok(report)
    }
}

fn describe_queues(queues: &[String]) -> String {
    if queues.is_empty() {
        "all queues".to_string()
    } else {
        format!("queues [{}]", queues.join(", "))
    }
}

/// Claim one job, run it and record the result.
///
/// Returns `None` when nothing is runnable. Only store errors are returned;
/// the job's own failure is recorded on its record.
async fn process_next(
    queue: &Queue,
    registry: &Arc<Registry>,
    worker: &str,
    filter: &QueueFilter,
    log: bool,
) -> QueueResult<Option<Outcome>> {
    let Some(job) = queue.claim(worker, filter).await? else {
        return Ok(None);
    };

    if log {
        info!(
            "[{}] Processing job: {} (kind: {})",
            worker, job.id, job.payload.kind
        );
    }

    match execute(registry, &job, queue.config().max_run_time).await {
        Ok(()) => {
            queue.complete(&job).await?;
            if log {
                info!("[{}] Job {} completed successfully", worker, job.id);
            }
            Ok(Some(Outcome::Succeeded))
        }
        Err(err) => match queue.record_failure(&job, worker, &err).await {
            Ok(FailureOutcome::Retried { .. }) => Ok(Some(Outcome::Retried)),
            Ok(FailureOutcome::Failed) => Ok(Some(Outcome::Failed)),
            Err(QueueError::ClaimConflict(id)) => {
                warn!(
                    "[{}] Lost the claim on job {} before recording: {}",
                    worker, id, err
                );
                Ok(Some(Outcome::Lost))
            }
            Err(QueueError::NotFound(id)) => {
                warn!("[{}] Job {} was deleted while running", worker, id);
                Ok(Some(Outcome::Lost))
            }
            Err(e) => Err(e),
        },
    }
}

/// Run the handler in its own task, bounded by `max_run_time`.
async fn execute(registry: &Arc<Registry>, job: &Job, max_run_time: Duration) -> Result<(), JobError> {
    let registry = Arc::clone(registry);
    let job = job.clone();
    let mut task = tokio::spawn(async move { registry.dispatch(job).await });

    match tokio::time::timeout(max_run_time, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(JobError::retryable(format!(
            "handler panicked: {}",
            join_error
        ))),
        Err(_) => {
            task.abort();
            Err(JobError::retryable("execution expired"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::queue::QueueConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.queues.is_empty());
        assert!(config.log_execution);
        assert!(config.name_prefix.starts_with("belay:"));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_name_prefix("host-a")
            .with_queues(["sms"])
            .with_concurrency(2)
            .with_poll_interval(Duration::from_millis(50))
            .with_log_execution(false);

        assert_eq!(config.name_prefix, "host-a");
        assert_eq!(config.concurrency, 2);
        assert!(config.filter().matches("sms"));
        assert!(!config.filter().matches("default"));
    }

    fn quiet() -> WorkerConfig {
        WorkerConfig::default()
            .with_name_prefix("test")
            .with_log_execution(false)
    }

    #[tokio::test]
    async fn test_work_off_reports_outcomes() {
        let queue = Queue::in_memory();
        let mut registry = Registry::new();
        registry.register_fn("ok", |_job| async { Ok(()) });
        registry.register_fn("flaky", |_job| async { Err(JobError::retryable("busy")) });
        registry.register_fn("broken", |_job| async { Err(JobError::permanent("bad input")) });

        for kind in ["ok", "flaky", "broken", "unknown"] {
            queue.enqueue(NewJob::new(kind, json!({}))).await.unwrap();
        }

        let worker = Worker::with_config(queue.clone(), registry, quiet());
        let report = worker.work_off(10).await.unwrap();

        assert_eq!(
            report,
            WorkOffReport {
                succeeded: 1,
                retried: 1,
                failed: 2
            }
        );
        assert_eq!(report.total(), 4);

        let failed = queue.failed_jobs(10).await.unwrap();
        assert!(failed.iter().any(|job| job.last_error.as_deref()
            == Some("no handler registered for job kind 'unknown'")));
    }

    #[tokio::test]
    async fn test_work_off_respects_limit_and_queues() {
        let queue = Queue::in_memory();
        let mut registry = Registry::new();
        registry.register_fn("ok", |_job| async { Ok(()) });

        for _ in 0..3 {
            queue.enqueue(NewJob::new("ok", json!({})).on_queue("sms")).await.unwrap();
        }
        queue.enqueue(NewJob::new("ok", json!({}))).await.unwrap();

        let worker = Worker::with_config(queue.clone(), registry, quiet().with_queues(["sms"]));
        assert_eq!(worker.work_off(2).await.unwrap().succeeded, 2);
        assert_eq!(worker.work_off(10).await.unwrap().succeeded, 1);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let queue = Queue::in_memory()
            .with_config(QueueConfig::default().with_max_run_time(Duration::from_millis(20)));
        let mut registry = Registry::new();
        registry.register_fn("slow", |_job| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        let id = queue.enqueue(NewJob::new("slow", json!({}))).await.unwrap();
        let worker = Worker::with_config(queue.clone(), registry, quiet());
        let report = worker.work_off(1).await.unwrap();

        assert_eq!(report.retried, 1);
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("execution expired"));
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_worker() {
        let queue = Queue::in_memory();
        let mut registry = Registry::new();
        registry.register_fn("panic", |job| async move {
            if job.payload.kind == "panic" {
                panic!("handler bug");
            }
            Ok(())
        });
        registry.register_fn("ok", |_job| async { Ok(()) });

        queue.enqueue(NewJob::new("panic", json!({})).with_priority(-1)).await.unwrap();
        queue.enqueue(NewJob::new("ok", json!({}))).await.unwrap();

        let worker = Worker::with_config(queue, registry, quiet());
        let report = worker.work_off(5).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let queue = Queue::in_memory();
        let processed = Arc::new(AtomicU32::new(0));
        let counter = processed.clone();

        let mut registry = Registry::new();
        registry.register_fn("count", move |_job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for _ in 0..5 {
            queue.enqueue(NewJob::new("count", json!({}))).await.unwrap();
        }

        let config = quiet()
            .with_concurrency(3)
            .with_poll_interval(Duration::from_millis(10));
        let mut worker = Worker::with_config(queue.clone(), registry, config);

        worker.start().await.unwrap();
        assert!(worker.is_running().await);
        assert!(matches!(
            worker.start().await,
            Err(QueueError::WorkerAlreadyRunning)
        ));

        for _ in 0..200 {
            if processed.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        worker.stop().await.unwrap();
        assert!(!worker.is_running().await);
        assert_eq!(processed.load(Ordering::SeqCst), 5);
        assert_eq!(queue.stats().await.unwrap().pending, 0);
        assert!(matches!(worker.stop().await, Err(QueueError::WorkerNotRunning)));
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let mut worker =
            Worker::with_config(Queue::in_memory(), Registry::new(), quiet().with_concurrency(0));
        assert!(matches!(worker.start().await, Err(QueueError::Config(_))));
        assert!(!worker.is_running().await);
    }
}
