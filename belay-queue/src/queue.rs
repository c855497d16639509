//! Queue facade over a job store.

use crate::clock::{Clock, SystemClock};
use crate::error::{JobError, QueueError, QueueResult};
use crate::job::{DEFAULT_QUEUE, Job, JobId, NewJob};
use crate::registry::Perform;
use crate::retry::{Disposition, RetryPolicy};
use crate::store::{JobStore, MemoryStore, QueueFilter, QueueStats};
use belay_log::{debug, error, info, warn};
use chrono::{DateTime, Utc};
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue for jobs that do not name one
    pub default_queue: String,

    /// Priority for jobs that do not set one
    pub default_priority: i32,

    /// Retry budget and backoff
    pub retry: RetryPolicy,

    /// Longest a single execution may run before it counts as failed
    #[serde(with = "humantime_serde")]
    pub max_run_time: Duration,

    /// Delete permanently failed jobs instead of keeping them for inspection
    pub destroy_failed_jobs: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            default_priority: 0,
            retry: RetryPolicy::default(),
            max_run_time: Duration::from_secs(4 * 60 * 60),
            destroy_failed_jobs: false,
        }
    }
}

impl QueueConfig {
    /// Set the default queue name.
    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Set the default priority.
    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the maximum run time of one execution.
    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    /// Delete jobs once they fail permanently.
    pub fn with_destroy_failed_jobs(mut self, destroy: bool) -> Self {
        self.destroy_failed_jobs = destroy;
        self
    }
}

/// What happened to a job after a failed attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Released for another attempt at `run_at`.
    Retried {
        /// Next earliest run time
        run_at: DateTime<Utc>,
    },
    /// Marked failed (or deleted, with `destroy_failed_jobs`).
    Failed,
}

/// Durable delayed-job queue.
///
/// Cheap to clone; clones share the store and the clock.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl Queue {
    /// Create a queue over `store` with default configuration.
    pub fn new(store: impl JobStore + 'static) -> Self {
        Self::from_store(Arc::new(store))
    }

    /// Create a queue over a shared store.
    pub fn from_store(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: QueueConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a queue over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Connect a queue to Redis with the default key prefix.
    #[cfg(feature = "redis")]
    pub async fn redis(url: impl Into<String>) -> QueueResult<Self> {
        let store = crate::store::RedisStore::new(url).await?;
        Ok(Self::new(store))
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Current time on the queue clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enqueue a job. Always creates a new record.
    pub async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        let job = job.build(
            &self.config.default_queue,
            self.config.default_priority,
            self.config.retry.max_attempts,
            self.now(),
        );

        debug!(
            "Enqueueing job {} ({}) on '{}' for {}",
            job.id, job.payload.kind, job.queue, job.run_at
        );
        self.store.insert(job).await
    }

    /// Enqueue a typed unit of work.
    pub async fn enqueue_perform<J: Perform>(&self, work: &J) -> QueueResult<JobId> {
        let job = NewJob::from_perform(work).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.enqueue(job).await
    }

    /// Claim the next runnable job on `filter` for `worker`.
    pub async fn claim(&self, worker: &str, filter: &QueueFilter) -> QueueResult<Option<Job>> {
        let job = self.store.claim_next(filter, worker, self.now()).await?;
        if let Some(job) = &job {
            debug!("{} claimed job {} ({})", worker, job.id, job.payload.kind);
        }
        Ok(job)
    }

    /// Record a successful execution by deleting the job.
    pub async fn complete(&self, job: &Job) -> QueueResult<()> {
        self.store.delete(job.id).await
    }

    /// Record a failed execution of a job claimed by `worker`.
    ///
    /// `job` must be the record [`Queue::claim`] returned: its lock token
    /// identifies the claim, so a report from an execution whose claim was
    /// reaped is rejected with `ClaimConflict` even if the same worker name
    /// has claimed the job again. The retry policy decides between another
    /// attempt and permanent failure.
    pub async fn record_failure(
        &self,
        job: &Job,
        worker: &str,
        err: &JobError,
    ) -> QueueResult<FailureOutcome> {
        let now = self.now();
        let disposition = self.config.retry.disposition(job, err, now);
        self.store
            .record_failure(job.id, worker, job.lock_token, err.detail(), disposition, now)
            .await?;

        match disposition {
            Disposition::Retry { run_at } => {
                warn!(
                    "Job {} ({}) failed on attempt {}, retrying at {}: {}",
                    job.id,
                    job.payload.kind,
                    job.attempts + 1,
                    run_at,
                    err
                );
                Ok(FailureOutcome::Retried { run_at })
            }
            Disposition::Fail => {
                error!(
                    "Job {} ({}) failed permanently after {} attempts: {}",
                    job.id,
                    job.payload.kind,
                    job.attempts + 1,
                    err
                );
                if self.config.destroy_failed_jobs {
                    self.store.delete(job.id).await?;
                }
                Ok(FailureOutcome::Failed)
            }
        }
    }

    /// Release claims older than `lock_timeout`, counting each as a failed attempt.
    pub async fn reap_expired(&self, lock_timeout: Duration) -> QueueResult<Vec<JobId>> {
        let now = self.now();
        let cutoff = chrono::Duration::from_std(lock_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let detail = format!(
            "lock expired after {}",
            humantime::format_duration(lock_timeout)
        );

        let released = self.store.unlock_expired(cutoff, &detail, now).await?;
        for id in &released {
            warn!("Reaped abandoned job {}", id);
        }

        if self.config.destroy_failed_jobs {
            for id in &released {
                if let Some(job) = self.store.get(*id).await?
                    && job.is_failed()
                {
                    self.store.delete(job.id).await?;
                }
            }
        }

        Ok(released)
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.store.get(id).await
    }

    /// Delete a job regardless of its state.
    pub async fn delete(&self, id: JobId) -> QueueResult<()> {
        self.store.delete(id).await
    }

    /// Counts by state.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.store.stats(self.now()).await
    }

    /// Failed jobs, most recently failed first.
    pub async fn failed_jobs(&self, limit: usize) -> QueueResult<Vec<Job>> {
        self.store.failed(limit).await
    }

    /// Remove every job.
    pub async fn clear(&self) -> QueueResult<()> {
        info!("Clearing job queue");
        self.store.clear().await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::Owner;
    use crate::retry::Backoff;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn queue(config: QueueConfig) -> (Queue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let queue = Queue::in_memory()
            .with_config(config)
            .with_clock(clock.clone());
        (queue, clock)
    }

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.default_queue, "default");
        assert_eq!(config.default_priority, 0);
        assert_eq!(config.retry.max_attempts, 25);
        assert_eq!(config.max_run_time, Duration::from_secs(14_400));
        assert!(!config.destroy_failed_jobs);
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::default()
            .with_default_queue("sms")
            .with_default_priority(10)
            .with_max_run_time(Duration::from_secs(60))
            .with_destroy_failed_jobs(true);

        assert_eq!(config.default_queue, "sms");
        assert_eq!(config.default_priority, 10);
        assert_eq!(config.max_run_time, Duration::from_secs(60));
        assert!(config.destroy_failed_jobs);
    }

    #[test]
    fn test_queue_config_from_toml() {
        let config: QueueConfig = toml::from_str(
            r#"
            default_queue = "mail"
            max_run_time = "15m"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.default_queue, "mail");
        assert_eq!(config.max_run_time, Duration::from_secs(900));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff, Backoff::default());
    }

    #[tokio::test]
    async fn test_enqueue_fills_defaults_from_config() {
        let (queue, _) = queue(
            QueueConfig::default()
                .with_default_queue("sms")
                .with_retry(RetryPolicy::new(4, Backoff::default())),
        );

        let id = queue
            .enqueue(NewJob::new("remind", json!({})).owned_by(Owner::new("Appointment", 1)))
            .await
            .unwrap();
        let job = queue.get(id).await.unwrap().unwrap();

        assert_eq!(job.queue, "sms");
        assert_eq!(job.max_attempts, 4);
        assert_eq!(job.run_at, t0());
        assert_eq!(job.created_at, t0());
    }

    #[tokio::test]
    async fn test_retry_then_permanent_failure() {
        let (queue, clock) = queue(
            QueueConfig::default().with_retry(RetryPolicy::new(2, Backoff::default())),
        );
        let id = queue.enqueue(NewJob::new("flaky", json!({}))).await.unwrap();
        let filter = QueueFilter::any();
        let err = JobError::retryable("gateway timeout");

        let job = queue.claim("w1", &filter).await.unwrap().unwrap();
        let outcome = queue.record_failure(&job, "w1", &err).await.unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retried {
                run_at: t0() + chrono::Duration::seconds(6)
            }
        );
        assert!(queue.claim("w1", &filter).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(6));
        let job = queue.claim("w1", &filter).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        let outcome = queue.record_failure(&job, "w1", &err).await.unwrap();
        assert_eq!(outcome, FailureOutcome::Failed);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.is_failed());
        assert_eq!(queue.failed_jobs(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_failed_jobs() {
        let (queue, _) = queue(QueueConfig::default().with_destroy_failed_jobs(true));
        let id = queue.enqueue(NewJob::new("bad", json!({}))).await.unwrap();

        let job = queue.claim("w1", &QueueFilter::any()).await.unwrap().unwrap();
        queue
            .record_failure(&job, "w1", &JobError::permanent("unknown recipient"))
            .await
            .unwrap();

        assert!(queue.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_deletes() {
        let (queue, _) = queue(QueueConfig::default());
        let id = queue.enqueue(NewJob::new("ok", json!({}))).await.unwrap();
        let job = queue.claim("w1", &QueueFilter::any()).await.unwrap().unwrap();

        queue.complete(&job).await.unwrap();
        queue.complete(&job).await.unwrap();
        assert!(queue.get(id).await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_reap_expired_records_detail() {
        let (queue, clock) = queue(QueueConfig::default());
        let id = queue.enqueue(NewJob::new("stuck", json!({}))).await.unwrap();
        queue.claim("w1", &QueueFilter::any()).await.unwrap().unwrap();

        clock.advance(chrono::Duration::minutes(59));
        assert!(queue
            .reap_expired(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        clock.advance(chrono::Duration::minutes(1));
        let released = queue.reap_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(released, vec![id]);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("lock expired after 1h"));
        assert!(job.is_pending());
    }
}
